use aws_sdk_route53::types::{Change, ChangeAction, ChangeBatch, RrType};
use aws_sdk_s3::types::{Delete, ObjectIdentifier};

use crate::{aws::retry, errors::AwsError};

use super::AwsClients;

impl AwsClients {
    pub async fn list_buckets(&self) -> Result<Vec<String>, AwsError> {
        let resp = retry::retry_transient("s3:ListBuckets", || self.s3.list_buckets().send())
            .await?;
        Ok(resp
            .buckets()
            .iter()
            .filter_map(|b| b.name())
            .map(str::to_string)
            .collect())
    }

    /// Delete every object in the bucket, then the bucket itself. A bucket
    /// that disappeared mid-purge is treated as already gone.
    pub async fn purge_and_delete_bucket(&self, bucket: &str) -> Result<(), AwsError> {
        let mut continuation: Option<String> = None;
        loop {
            let token = continuation.clone();
            let page = retry::retry_transient("s3:ListObjectsV2", || {
                self.s3
                    .list_objects_v2()
                    .bucket(bucket)
                    .set_continuation_token(token.clone())
                    .send()
            })
            .await;
            let page = match page {
                Ok(page) => page,
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e),
            };

            let objects: Vec<ObjectIdentifier> = page
                .contents()
                .iter()
                .filter_map(|o| o.key())
                .filter_map(|key| ObjectIdentifier::builder().key(key).build().ok())
                .collect();
            if !objects.is_empty() {
                let delete = Delete::builder()
                    .set_objects(Some(objects))
                    .build()
                    .map_err(|e| AwsError::Validation {
                        code: "InvalidInput".to_string(),
                        message: e.to_string(),
                    })?;
                retry::retry_transient("s3:DeleteObjects", || {
                    self.s3
                        .delete_objects()
                        .bucket(bucket)
                        .delete(delete.clone())
                        .send()
                })
                .await?;
            }

            if page.is_truncated() == Some(true) {
                continuation = page.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }

        let deleted = retry::retry_transient("s3:DeleteBucket", || {
            self.s3.delete_bucket().bucket(bucket).send()
        })
        .await;
        match deleted {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Hosted zone ids, fully paginated.
    pub async fn list_hosted_zone_ids(&self) -> Result<Vec<String>, AwsError> {
        let mut zones = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let token = marker.clone();
            let page = retry::retry_transient("route53:ListHostedZones", || {
                self.route53.list_hosted_zones().set_marker(token.clone()).send()
            })
            .await?;
            zones.extend(page.hosted_zones().iter().map(|z| z.id().to_string()));
            if page.is_truncated() {
                marker = page.next_marker().map(str::to_string);
            } else {
                break;
            }
        }
        Ok(zones)
    }

    /// Delete all non-{NS, SOA} record sets of a zone, then the zone.
    pub async fn delete_hosted_zone(&self, zone_id: &str) -> Result<(), AwsError> {
        let mut record_name: Option<String> = None;
        let mut record_type: Option<RrType> = None;
        loop {
            let name = record_name.clone();
            let rtype = record_type.clone();
            let page = retry::retry_transient("route53:ListResourceRecordSets", || {
                self.route53
                    .list_resource_record_sets()
                    .hosted_zone_id(zone_id)
                    .set_start_record_name(name.clone())
                    .set_start_record_type(rtype.clone())
                    .send()
            })
            .await;
            let page = match page {
                Ok(page) => page,
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e),
            };

            let deletions: Vec<Change> = page
                .resource_record_sets()
                .iter()
                .filter(|rs| !matches!(rs.r#type(), RrType::Ns | RrType::Soa))
                .map(|rs| {
                    Change::builder()
                        .action(ChangeAction::Delete)
                        .resource_record_set(rs.clone())
                        .build()
                        .map_err(|e| AwsError::Validation {
                            code: "InvalidInput".to_string(),
                            message: e.to_string(),
                        })
                })
                .collect::<Result<_, _>>()?;

            if !deletions.is_empty() {
                let batch = ChangeBatch::builder()
                    .set_changes(Some(deletions))
                    .build()
                    .map_err(|e| AwsError::Validation {
                        code: "InvalidInput".to_string(),
                        message: e.to_string(),
                    })?;
                retry::retry_transient("route53:ChangeResourceRecordSets", || {
                    self.route53
                        .change_resource_record_sets()
                        .hosted_zone_id(zone_id)
                        .change_batch(batch.clone())
                        .send()
                })
                .await?;
            }

            if page.is_truncated() {
                record_name = page.next_record_name().map(str::to_string);
                record_type = page.next_record_type().cloned();
            } else {
                break;
            }
        }

        let deleted = retry::retry_transient("route53:DeleteHostedZone", || {
            self.route53.delete_hosted_zone().id(zone_id).send()
        })
        .await;
        match deleted {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}
