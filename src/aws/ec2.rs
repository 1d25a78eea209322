use aws_sdk_ec2::types::{
    Filter, InstanceStateName, InstanceType, ResourceType, Tag, TagSpecification, VolumeState,
};

use crate::{aws::retry, errors::AwsError};

use super::AwsClients;

/// Tag stamped on every instance the operator launches, so hanging instances
/// from interrupted region initializations can be found and reaped.
pub const OPERATOR_TAG_KEY: &str = "owner";
pub const OPERATOR_TAG_VALUE: &str = "account-operator";

impl AwsClients {
    /// Launch a single tagged instance and return its id.
    pub async fn run_tagged_instance(
        &self,
        ami: &str,
        instance_type: InstanceType,
    ) -> Result<String, AwsError> {
        let tag_spec = TagSpecification::builder()
            .resource_type(ResourceType::Instance)
            .tags(
                Tag::builder()
                    .key(OPERATOR_TAG_KEY)
                    .value(OPERATOR_TAG_VALUE)
                    .build(),
            )
            .build();
        let resp = retry::retry_transient("ec2:RunInstances", || {
            self.ec2
                .run_instances()
                .image_id(ami)
                .instance_type(instance_type.clone())
                .min_count(1)
                .max_count(1)
                .tag_specifications(tag_spec.clone())
                .send()
        })
        .await?;
        resp.instances()
            .first()
            .and_then(|i| i.instance_id())
            .map(str::to_string)
            .ok_or(AwsError::MissingField("Instances[0].InstanceId"))
    }

    pub async fn instance_state(
        &self,
        instance_id: &str,
    ) -> Result<Option<InstanceStateName>, AwsError> {
        let resp = retry::retry_transient("ec2:DescribeInstances", || {
            self.ec2.describe_instances().instance_ids(instance_id).send()
        })
        .await?;
        Ok(resp
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .find(|i| i.instance_id() == Some(instance_id))
            .and_then(|i| i.state())
            .and_then(|s| s.name())
            .cloned())
    }

    /// All instances carrying the operator tag, with their states.
    pub async fn list_operator_tagged_instances(
        &self,
    ) -> Result<Vec<(String, InstanceStateName)>, AwsError> {
        let filter = Filter::builder()
            .name(format!("tag:{OPERATOR_TAG_KEY}"))
            .values(OPERATOR_TAG_VALUE)
            .build();
        self.list_instances_filtered(Some(filter)).await
    }

    /// Every instance in the region regardless of tags.
    pub async fn list_all_instances(&self) -> Result<Vec<(String, InstanceStateName)>, AwsError> {
        self.list_instances_filtered(None).await
    }

    async fn list_instances_filtered(
        &self,
        filter: Option<Filter>,
    ) -> Result<Vec<(String, InstanceStateName)>, AwsError> {
        let mut instances = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let token = next_token.clone();
            let page = retry::retry_transient("ec2:DescribeInstances", || {
                self.ec2
                    .describe_instances()
                    .set_filters(filter.clone().map(|f| vec![f]))
                    .set_next_token(token.clone())
                    .send()
            })
            .await?;
            for reservation in page.reservations() {
                for instance in reservation.instances() {
                    if let (Some(id), Some(state)) = (
                        instance.instance_id(),
                        instance.state().and_then(|s| s.name()),
                    ) {
                        instances.push((id.to_string(), state.clone()));
                    }
                }
            }
            next_token = page.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }
        Ok(instances)
    }

    pub async fn terminate_instances(&self, instance_ids: &[String]) -> Result<(), AwsError> {
        if instance_ids.is_empty() {
            return Ok(());
        }
        retry::retry_transient("ec2:TerminateInstances", || {
            self.ec2
                .terminate_instances()
                .set_instance_ids(Some(instance_ids.to_vec()))
                .send()
        })
        .await?;
        Ok(())
    }

    pub async fn list_volumes(&self) -> Result<Vec<(String, VolumeState)>, AwsError> {
        let mut volumes = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let token = next_token.clone();
            let page = retry::retry_transient("ec2:DescribeVolumes", || {
                self.ec2.describe_volumes().set_next_token(token.clone()).send()
            })
            .await?;
            for volume in page.volumes() {
                if let (Some(id), Some(state)) = (volume.volume_id(), volume.state()) {
                    volumes.push((id.to_string(), state.clone()));
                }
            }
            next_token = page.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }
        Ok(volumes)
    }

    pub async fn delete_volume(&self, volume_id: &str) -> Result<(), AwsError> {
        let result = retry::retry_transient("ec2:DeleteVolume", || {
            self.ec2.delete_volume().volume_id(volume_id).send()
        })
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Snapshot ids owned by the calling account.
    pub async fn list_owned_snapshots(&self) -> Result<Vec<String>, AwsError> {
        let mut snapshots = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let token = next_token.clone();
            let page = retry::retry_transient("ec2:DescribeSnapshots", || {
                self.ec2
                    .describe_snapshots()
                    .owner_ids("self")
                    .set_next_token(token.clone())
                    .send()
            })
            .await?;
            snapshots.extend(
                page.snapshots()
                    .iter()
                    .filter_map(|s| s.snapshot_id())
                    .map(str::to_string),
            );
            next_token = page.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }
        Ok(snapshots)
    }

    pub async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), AwsError> {
        let result = retry::retry_transient("ec2:DeleteSnapshot", || {
            self.ec2.delete_snapshot().snapshot_id(snapshot_id).send()
        })
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn list_vpc_endpoint_service_ids(&self) -> Result<Vec<String>, AwsError> {
        let resp = retry::retry_transient("ec2:DescribeVpcEndpointServiceConfigurations", || {
            self.ec2.describe_vpc_endpoint_service_configurations().send()
        })
        .await?;
        Ok(resp
            .service_configurations()
            .iter()
            .filter_map(|c| c.service_id())
            .map(str::to_string)
            .collect())
    }

    pub async fn delete_vpc_endpoint_services(&self, service_ids: &[String]) -> Result<(), AwsError> {
        if service_ids.is_empty() {
            return Ok(());
        }
        retry::retry_transient("ec2:DeleteVpcEndpointServiceConfigurations", || {
            self.ec2
                .delete_vpc_endpoint_service_configurations()
                .set_service_ids(Some(service_ids.to_vec()))
                .send()
        })
        .await?;
        Ok(())
    }
}

/// The cheap instance types used to force per-region activation, in
/// preference order.
pub fn region_init_instance_types() -> [InstanceType; 2] {
    [InstanceType::T3Micro, InstanceType::T2Micro]
}
