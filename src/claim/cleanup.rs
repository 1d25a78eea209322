//! Account reuse: scrub every tenant-created resource so the account can
//! rejoin the pool.
//!
//! Instances are terminated first and waited on, because attached volumes
//! only detach once their instance is gone. The remaining resource classes
//! are scrubbed by a fixed fan-out of tasks reporting through two channels;
//! errors never cancel sibling tasks.

use std::collections::BTreeSet;

use aws_sdk_ec2::types::{InstanceStateName, VolumeState};
use kube::api::{Api, PostParams, ResourceExt};
use tokio::{
    sync::mpsc,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    apis::{
        claim_types::AccountClaim,
        cloudaccount_types::{AccountState, CloudAccount},
        conditions::{self, CONDITION_TRUE},
    },
    aws::AwsClients,
    config,
    controller::Context,
    Error, Result,
};

use crate::account::patch_account_status;

const TERMINATE_POLL_INTERVAL: Duration = Duration::from_secs(15);
const TERMINATE_WAIT_CAP: Duration = Duration::from_secs(5 * 60);
const RESET_ATTEMPTS: u32 = 5;

/// Regions the scrub has to visit: wherever the account was warmed up, plus
/// the home region.
fn scrub_regions(account: &CloudAccount) -> Vec<String> {
    let mut regions: BTreeSet<String> =
        account.spec.regionalServiceQuotas.keys().cloned().collect();
    regions.insert(config::default_region().to_string());
    regions.into_iter().collect()
}

pub async fn scrub_account(
    claim: &AccountClaim,
    account: &CloudAccount,
    ctx: &Context,
) -> Result<()> {
    let timer = ctx.metrics.reuse_cleanup_duration.start_timer();
    let result = scrub_inner(account, ctx).await;
    drop(timer);
    if result.is_err() {
        ctx.metrics
            .reuse_cleanup_failures
            .with_label_values(&[&claim.name_any()])
            .inc();
    }
    result
}

async fn scrub_inner(account: &CloudAccount, ctx: &Context) -> Result<()> {
    let regions = scrub_regions(account);
    let name = account.name_any();

    // Sequential preamble: all instances down before anything touches
    // volumes.
    let mut clients = Vec::new();
    for region in &regions {
        let aws = ctx.account_aws(account, region, None).await?;
        terminate_all_instances(&aws, region).await?;
        clients.push((region.clone(), aws));
    }

    // Parallel fan-out over the fixed task set; one message per task.
    let (notify_tx, mut notify_rx) = mpsc::channel::<String>(32);
    let (error_tx, mut error_rx) = mpsc::channel::<String>(32);
    let mut task_count = 0usize;

    for (region, aws) in &clients {
        for task in [
            ScrubTask::Snapshots,
            ScrubTask::Volumes,
            ScrubTask::EndpointServices,
        ] {
            spawn_scrub_task(
                task,
                region.clone(),
                aws.clone(),
                notify_tx.clone(),
                error_tx.clone(),
            );
            task_count += 1;
        }
    }
    // Buckets and DNS zones are account-global; one task each from the home
    // region client.
    if let Some((region, aws)) = clients.first() {
        for task in [ScrubTask::Buckets, ScrubTask::DnsZones] {
            spawn_scrub_task(
                task,
                region.clone(),
                aws.clone(),
                notify_tx.clone(),
                error_tx.clone(),
            );
            task_count += 1;
        }
    }
    drop(notify_tx);
    drop(error_tx);

    let mut failures = Vec::new();
    for _ in 0..task_count {
        tokio::select! {
            Some(done) = notify_rx.recv() => debug!("account {name}: {done}"),
            Some(err) = error_rx.recv() => failures.push(err),
        }
    }

    if failures.is_empty() {
        info!("account {name}: scrub complete across {} region(s)", regions.len());
        Ok(())
    } else {
        Err(Error::CleanupError(failures.join("; ")))
    }
}

#[derive(Clone, Copy, Debug)]
enum ScrubTask {
    Snapshots,
    Volumes,
    Buckets,
    EndpointServices,
    DnsZones,
}

fn spawn_scrub_task(
    task: ScrubTask,
    region: String,
    aws: AwsClients,
    notify_tx: mpsc::Sender<String>,
    error_tx: mpsc::Sender<String>,
) {
    tokio::spawn(async move {
        let result = match task {
            ScrubTask::Snapshots => delete_snapshots(&aws).await,
            ScrubTask::Volumes => delete_volumes(&aws).await,
            ScrubTask::Buckets => delete_buckets(&aws).await,
            ScrubTask::EndpointServices => delete_endpoint_services(&aws).await,
            ScrubTask::DnsZones => delete_dns_zones(&aws).await,
        };
        match result {
            Ok(summary) => {
                let _ = notify_tx.send(format!("{region}: {summary}")).await;
            }
            Err(e) => {
                let _ = error_tx.send(format!("{region}: {task:?}: {e}")).await;
            }
        }
    });
}

/// Terminate everything still up and poll until the region is quiet.
async fn terminate_all_instances(aws: &AwsClients, region: &str) -> Result<()> {
    let running: Vec<String> = aws
        .list_all_instances()
        .await?
        .into_iter()
        .filter(|(_, state)| !matches!(state, InstanceStateName::Terminated))
        .map(|(id, _)| id)
        .collect();
    if running.is_empty() {
        return Ok(());
    }
    info!("terminating {} instance(s) in {region}", running.len());
    aws.terminate_instances(&running).await?;

    let deadline = Instant::now() + TERMINATE_WAIT_CAP;
    loop {
        tokio::time::sleep(TERMINATE_POLL_INTERVAL).await;
        let still_up = aws
            .list_all_instances()
            .await?
            .into_iter()
            .any(|(_, state)| !matches!(state, InstanceStateName::Terminated));
        if !still_up {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::CleanupError(format!(
                "instances in {region} did not terminate in time"
            )));
        }
    }
}

async fn delete_snapshots(aws: &AwsClients) -> Result<String, String> {
    let snapshots = aws.list_owned_snapshots().await.map_err(|e| e.to_string())?;
    let count = snapshots.len();
    for id in snapshots {
        aws.delete_snapshot(&id).await.map_err(|e| e.to_string())?;
    }
    Ok(format!("{count} snapshot(s) deleted"))
}

/// Attached volumes are skipped without failing; the instance they belonged
/// to just terminated and the next reconcile sweeps them up.
async fn delete_volumes(aws: &AwsClients) -> Result<String, String> {
    let volumes = aws.list_volumes().await.map_err(|e| e.to_string())?;
    let mut deleted = 0;
    for (id, state) in volumes {
        if matches!(state, VolumeState::InUse) {
            debug!("volume {id} still attached, leaving for the next pass");
            continue;
        }
        match aws.delete_volume(&id).await {
            Ok(()) => deleted += 1,
            Err(e) if e.code() == "VolumeInUse" => {
                debug!("volume {id} became attached mid-scrub, skipping");
            }
            Err(e) => return Err(e.to_string()),
        }
    }
    Ok(format!("{deleted} volume(s) deleted"))
}

async fn delete_buckets(aws: &AwsClients) -> Result<String, String> {
    let buckets = aws.list_buckets().await.map_err(|e| e.to_string())?;
    let count = buckets.len();
    for bucket in buckets {
        aws.purge_and_delete_bucket(&bucket)
            .await
            .map_err(|e| e.to_string())?;
    }
    Ok(format!("{count} bucket(s) purged"))
}

async fn delete_endpoint_services(aws: &AwsClients) -> Result<String, String> {
    let services = aws
        .list_vpc_endpoint_service_ids()
        .await
        .map_err(|e| e.to_string())?;
    let count = services.len();
    aws.delete_vpc_endpoint_services(&services)
        .await
        .map_err(|e| e.to_string())?;
    Ok(format!("{count} endpoint service(s) deleted"))
}

async fn delete_dns_zones(aws: &AwsClients) -> Result<String, String> {
    let zones = aws.list_hosted_zone_ids().await.map_err(|e| e.to_string())?;
    let count = zones.len();
    for zone in zones {
        aws.delete_hosted_zone(&zone).await.map_err(|e| e.to_string())?;
    }
    Ok(format!("{count} zone(s) deleted"))
}

/// Put the scrubbed account back into the pool: unbind it, keep its legal
/// entity, flag both credential rotations, and mark it Ready + reused.
///
/// Spec and status writes use optimistic-concurrency retry; a missing
/// account is not an error.
pub async fn reset_account_for_reuse(ctx: &Context, account_name: &str) -> Result<()> {
    let accounts: Api<CloudAccount> =
        Api::namespaced(ctx.client.clone(), &ctx.config.operator_namespace);
    let mut delay = Duration::from_secs(1);

    for attempt in 1..=RESET_ATTEMPTS {
        let mut account = match accounts.get(account_name).await {
            Ok(account) => account,
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        account.spec.claimLink = String::new();
        account.spec.claimLinkNamespace = String::new();
        // legalEntity stays: reuse is scoped to it.

        match accounts
            .replace(account_name, &PostParams::default(), &account)
            .await
        {
            Ok(_) => {
                let mut status = account.status.clone().unwrap_or_default();
                status.state = AccountState::Ready;
                status.claimed = false;
                status.reused = true;
                status.rotateCredentials = true;
                status.rotateConsoleCredentials = true;
                conditions::set_condition(
                    &mut status.conditions,
                    "Reuse",
                    CONDITION_TRUE,
                    "Scrubbed",
                    "account returned to the pool",
                );
                patch_account_status(ctx, account_name, &status).await?;
                return Ok(());
            }
            Err(kube::Error::Api(e)) if e.code == 409 && attempt < RESET_ATTEMPTS => {
                warn!(
                    "conflict resetting account {account_name} (attempt {attempt}), retrying"
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(Error::InvalidErr(format!(
        "could not reset account {account_name} after {RESET_ATTEMPTS} attempts"
    )))
}

/// Record an unrecoverable scrub on the account itself.
pub async fn mark_account_reuse_failed(ctx: &Context, account: &CloudAccount) -> Result<()> {
    let mut status = account.status.clone().unwrap_or_default();
    status.state = AccountState::Failed;
    conditions::set_condition(
        &mut status.conditions,
        "Reuse",
        conditions::CONDITION_FALSE,
        "CleanupFailed",
        "tenant resource scrub did not complete",
    );
    patch_account_status(ctx, &account.name_any(), &status).await
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::apis::cloudaccount_types::CloudAccountSpec;
    use std::collections::BTreeMap;

    #[test]
    fn scrub_regions_always_include_home() {
        crate::config::set_fedramp(false);
        let mut account = CloudAccount::new("a1", CloudAccountSpec::default());
        assert_eq!(scrub_regions(&account), vec!["us-east-1".to_string()]);

        account.spec.regionalServiceQuotas =
            BTreeMap::from([("eu-west-1".to_string(), BTreeMap::new())]);
        assert_eq!(
            scrub_regions(&account),
            vec!["eu-west-1".to_string(), "us-east-1".to_string()]
        );
    }
}
