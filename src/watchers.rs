//! Background loops that run beside the controllers: the organization-wide
//! account budget guard and the long-lived credential ager.

use std::sync::{
    atomic::{AtomicBool, AtomicI64, Ordering},
    Arc,
};

use chrono::{Duration as ChronoDuration, Utc};
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    Client, ResourceExt,
};
use serde_json::json;
use tokio::{sync::watch, time::Duration};
use tracing::{debug, error, info};

use crate::{
    account::account_secret_name,
    apis::cloudaccount_types::CloudAccount,
    aws::AwsClientBuilder,
    config::{self, Config},
    configmap, Metrics, Result,
};

/// Secret in the operator namespace holding the operator's own keys.
pub const OPERATOR_CREDENTIALS_SECRET: &str = "account-operator-credentials";

/// How often the organization account count is re-polled.
pub const TOTAL_WATCH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Long-lived keys older than this get rotated.
const STALE_CREDENTIAL_DAYS: i64 = 30;

/// Budget guard over the organization account limit.
///
/// `accounts_can_be_created` is the only thing the controllers consult; it is
/// refreshed every poll and reads lock-free.
#[derive(Clone, Default)]
pub struct TotalAccountWatcher {
    can_create: Arc<AtomicBool>,
    limit_delta: Arc<AtomicI64>,
    initialized: Arc<AtomicBool>,
    notify: Arc<tokio::sync::Notify>,
}

impl TotalAccountWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accounts_can_be_created(&self) -> bool {
        self.can_create.load(Ordering::SeqCst)
    }

    /// Remaining headroom (may be negative when over limit).
    pub fn limit_delta(&self) -> i64 {
        self.limit_delta.load(Ordering::SeqCst)
    }

    /// Block until the first successful poll so the pool controller never
    /// acts on a default value.
    pub async fn wait_until_initialized(&self) {
        while !self.initialized.load(Ordering::SeqCst) {
            self.notify.notified().await;
        }
    }

    #[cfg(test)]
    pub fn set_for_test(&self, can_create: bool, limit_delta: i64) {
        self.can_create.store(can_create, Ordering::SeqCst);
        self.limit_delta.store(limit_delta, Ordering::SeqCst);
        self.initialized.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    async fn poll_once(
        &self,
        client: Client,
        builder: &AwsClientBuilder,
        cfg: &Config,
        metrics: &Metrics,
    ) -> Result<()> {
        let cm = configmap::get_operator_configmap(client, &cfg.operator_namespace).await?;
        let limit = configmap::account_limit(&cm)? as i64;

        let aws = builder
            .from_secret(
                OPERATOR_CREDENTIALS_SECRET,
                &cfg.operator_namespace,
                config::default_region(),
            )
            .await?;
        let active = aws.list_active_accounts().await?.len() as i64;
        let in_flight = aws.count_in_progress_creations().await? as i64;
        let total = active + in_flight;

        self.can_create.store(total < limit, Ordering::SeqCst);
        self.limit_delta.store(limit - total, Ordering::SeqCst);
        metrics.aws_accounts.set(total);
        debug!("organization accounts: {total}/{limit} (in flight: {in_flight})");

        if !self.initialized.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
        Ok(())
    }

    pub async fn run(
        self,
        client: Client,
        builder: AwsClientBuilder,
        cfg: Config,
        metrics: Metrics,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self
                        .poll_once(client.clone(), &builder, &cfg, &metrics)
                        .await
                    {
                        error!("total-account watcher poll failed: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    info!("total-account watcher stopping");
                    return;
                }
            }
        }
    }
}

/// Flag accounts whose long-lived credential secrets have aged out so the
/// next reconcile regenerates their keys.
pub async fn run_credential_rotation_watcher(
    client: Client,
    cfg: Config,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = mark_stale_credentials(client.clone(), &cfg).await {
                    error!("credential rotation watcher failed: {e}");
                }
            }
            _ = shutdown.changed() => {
                info!("credential rotation watcher stopping");
                return;
            }
        }
    }
}

async fn mark_stale_credentials(client: Client, cfg: &Config) -> Result<()> {
    let accounts: Api<CloudAccount> = Api::namespaced(client.clone(), &cfg.operator_namespace);
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &cfg.operator_namespace);
    let cutoff = Utc::now() - ChronoDuration::days(STALE_CREDENTIAL_DAYS);

    for account in accounts.list(&ListParams::default()).await?.items {
        if !account.is_ready() || account.spec.manualSTS {
            continue;
        }
        let already_flagged = account
            .status
            .as_ref()
            .map(|s| s.rotateCredentials)
            .unwrap_or(false);
        if already_flagged {
            continue;
        }
        let secret = match secrets.get(&account_secret_name(&account.name_any())).await {
            Ok(secret) => secret,
            Err(kube::Error::Api(e)) if e.code == 404 => continue,
            Err(e) => return Err(e.into()),
        };
        let created = secret
            .metadata
            .creation_timestamp
            .as_ref()
            .map(|t| t.0)
            .unwrap_or_else(Utc::now);
        if created < cutoff {
            info!(
                "flagging stale credentials for account {}",
                account.name_any()
            );
            let patch = Patch::Merge(json!({ "status": { "rotateCredentials": true } }));
            accounts
                .patch_status(&account.name_any(), &PatchParams::default(), &patch)
                .await?;
        }
    }
    Ok(())
}
