//! The InitializingRegions stage: force the provider's per-region activation
//! path by briefly running one cheap instance in every supported region.

use aws_sdk_ec2::types::InstanceStateName;
use futures::future::join_all;
use kube::{api::ResourceExt, runtime::controller::Action};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

use crate::{
    apis::cloudaccount_types::{AccountState, CloudAccount},
    aws::ec2::region_init_instance_types,
    config,
    controller::Context,
    errors::AwsError,
    Error, Result,
};

use super::{quotas, set_account_state};

/// Total time allowed for one region's instance to reach "running".
const REGION_INIT_WAIT: Duration = Duration::from_secs(25 * 60);
const REGION_INIT_INITIAL_DELAY: Duration = Duration::from_secs(1);

lazy_static::lazy_static! {
    /// Public image used for the activation instance, per region.
    static ref REGION_AMIS: std::collections::BTreeMap<&'static str, &'static str> =
        std::collections::BTreeMap::from([
            ("us-east-1", "ami-0c02fb55956c7d316"),
            ("us-east-2", "ami-089c6f2e3866f0f14"),
            ("us-west-1", "ami-017c001a88dd93847"),
            ("us-west-2", "ami-0e21d4d9303512b8e"),
            ("eu-west-1", "ami-00aa9d3df94c6c354"),
            ("eu-west-2", "ami-03d8261f577d71b6a"),
            ("eu-central-1", "ami-05d34d340fb1d89e5"),
            ("ap-southeast-1", "ami-0b89f7b3f054b957e"),
            ("ap-southeast-2", "ami-075a72b1992cb0687"),
            ("ap-northeast-1", "ami-0ab0bbbd329f565e6"),
        ]);
}

fn ami_for_region(region: &str) -> Option<&'static str> {
    REGION_AMIS.get(region).copied()
}

/// Regions to initialize: everywhere the spec asks for quotas, or the home
/// region when the spec is silent.
pub(crate) fn init_regions(account: &CloudAccount) -> Vec<String> {
    if account.spec.regionalServiceQuotas.is_empty() {
        vec![config::default_region().to_string()]
    } else {
        account.spec.regionalServiceQuotas.keys().cloned().collect()
    }
}

#[instrument(skip(account, ctx), fields(account = %account.name_any()))]
pub async fn handle_initializing(account: &CloudAccount, ctx: &Context) -> Result<Action> {
    // The isolated partition has no activation workflow and is always
    // BYO-VPC; nothing to warm up.
    if config::is_fedramp() {
        set_account_state(
            ctx,
            account,
            AccountState::Ready,
            "RegionInitSkipped",
            "isolated partition",
        )
        .await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let regions = init_regions(account);
    let region_work = join_all(regions.iter().map(|region| init_region(account, ctx, region)));
    let (region_results, quota_result) =
        tokio::join!(region_work, quotas::reconcile_service_quotas(account, ctx));
    quota_result?;

    let mut failures = Vec::new();
    for (region, result) in regions.iter().zip(region_results) {
        if let Err(e) = result {
            warn!("region {region} initialization failed: {e}");
            failures.push(format!("{region}: {e}"));
        }
    }
    if !failures.is_empty() {
        return Err(Error::InvalidErr(format!(
            "region initialization incomplete: {}",
            failures.join("; ")
        )));
    }

    set_account_state(ctx, account, AccountState::Ready, "AccountReady", "").await?;
    info!("account {} is Ready", account.name_any());
    Ok(Action::requeue(Duration::from_secs(1)))
}

/// Warm up one region: reap hanging instances from an interrupted earlier
/// pass, or run one cheap instance to completion and terminate it.
async fn init_region(account: &CloudAccount, ctx: &Context, region: &str) -> Result<()> {
    let aws = ctx.account_aws(account, region, None).await?;

    let hanging: Vec<String> = aws
        .list_operator_tagged_instances()
        .await?
        .into_iter()
        .filter(|(_, state)| !matches!(state, InstanceStateName::Terminated))
        .map(|(id, _)| id)
        .collect();
    if !hanging.is_empty() {
        info!("region {region}: terminating {} hanging instance(s)", hanging.len());
        aws.terminate_instances(&hanging).await?;
        // The earlier pass already exercised the activation path.
        return Ok(());
    }

    let Some(ami) = ami_for_region(region) else {
        warn!("region {region}: no known activation image, skipping");
        return Ok(());
    };

    let mut instance_id = None;
    let mut last_error = None;
    for instance_type in region_init_instance_types() {
        match aws.run_tagged_instance(ami, instance_type.clone()).await {
            Ok(id) => {
                instance_id = Some(id);
                break;
            }
            Err(e) => {
                debug!("region {region}: {instance_type} launch failed: {e}");
                last_error = Some(e);
            }
        }
    }
    let instance_id = match instance_id {
        Some(id) => id,
        None => {
            return Err(last_error
                .unwrap_or(AwsError::MissingField("InstanceId"))
                .into())
        }
    };

    wait_for_running(&aws, region, &instance_id).await?;
    aws.terminate_instances(std::slice::from_ref(&instance_id))
        .await?;
    debug!("region {region}: activation instance {instance_id} done");
    Ok(())
}

/// Poll with doubling backoff until the instance runs or the region budget
/// is spent.
async fn wait_for_running(
    aws: &crate::aws::AwsClients,
    region: &str,
    instance_id: &str,
) -> Result<()> {
    let deadline = Instant::now() + REGION_INIT_WAIT;
    let mut delay = REGION_INIT_INITIAL_DELAY;
    loop {
        if let Some(InstanceStateName::Running) = aws.instance_state(instance_id).await? {
            return Ok(());
        }
        if Instant::now() + delay > deadline {
            return Err(
                AwsError::Timeout(format!("instance {instance_id} in {region}")).into(),
            );
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(Duration::from_secs(240));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::apis::cloudaccount_types::CloudAccountSpec;
    use std::collections::BTreeMap;

    #[test]
    fn init_regions_follows_the_quota_spec() {
        crate::config::set_fedramp(false);
        let mut account = CloudAccount::new("a1", CloudAccountSpec::default());
        assert_eq!(init_regions(&account), vec!["us-east-1".to_string()]);

        account.spec.regionalServiceQuotas = BTreeMap::from([
            ("eu-west-1".to_string(), BTreeMap::new()),
            ("us-east-2".to_string(), BTreeMap::new()),
        ]);
        assert_eq!(
            init_regions(&account),
            vec!["eu-west-1".to_string(), "us-east-2".to_string()]
        );
    }

    #[test]
    fn known_regions_have_activation_images() {
        for region in ["us-east-1", "eu-west-1", "ap-northeast-1"] {
            assert!(ami_for_region(region).is_some(), "{region}");
        }
        assert!(ami_for_region("mars-north-1").is_none());
    }
}
