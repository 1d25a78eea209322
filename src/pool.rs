use std::sync::Arc;

use chrono::Utc;
use itertools::Itertools;
use kube::{
    api::{Api, ListParams, Patch, PatchParams, PostParams, ResourceExt},
    runtime::controller::Action,
    Resource,
};
use serde_json::json;
use tokio::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::{
    apis::{
        cloudaccount_types::{CloudAccount, CloudAccountSpec},
        pool_types::{AccountPool, AccountPoolStatus},
    },
    configmap::{self, PoolConfig},
    controller::{requeue_normal_with_jitter, short_uid, Context},
    Error, Result,
};

pub static POOL_CONTROLLER: &str = "accountpool";

/// Derive the status counters from the accounts owned by this pool.
fn compute_pool_status(
    pool: &AccountPool,
    pool_cfg: &PoolConfig,
    accounts: &[CloudAccount],
    limit_delta: i64,
) -> AccountPoolStatus {
    let name = pool.name_any();
    let mut status = AccountPoolStatus {
        poolSize: pool.spec.poolSize,
        awsLimitDelta: limit_delta.max(0) as i32,
        ..AccountPoolStatus::default()
    };
    for account in accounts
        .iter()
        .filter(|a| a.belongs_to_pool(&name, pool_cfg.default))
    {
        if account.is_claimed() {
            status.claimedAccounts += 1;
        } else if !account.is_failed() {
            status.unclaimedAccounts += 1;
        }
        if account.is_unclaimed_and_ready() {
            status.availableAccounts += 1;
        }
        if account.is_progressing() {
            status.accountsProgressing += 1;
        }
    }
    status
}

#[instrument(skip(ctx, pool))]
pub async fn reconcile(pool: Arc<AccountPool>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = ctx.metrics.count_and_measure(POOL_CONTROLLER);
    ctx.diagnostics.write().await.last_event = Utc::now();
    let ns = pool.namespace().unwrap(); // pool is namespace scoped
    let name = pool.name_any();
    let pools: Api<AccountPool> = Api::namespaced(ctx.client.clone(), &ns);
    let accounts_api: Api<CloudAccount> =
        Api::namespaced(ctx.client.clone(), &ctx.config.operator_namespace);

    let cm =
        configmap::get_operator_configmap(ctx.client.clone(), &ctx.config.operator_namespace)
            .await?;
    // A pool missing from the accountpool table is a configuration error,
    // never a silent fallback to another pool.
    let pool_cfg = configmap::pool_config(&cm, &name)?;

    // The budget guard must have polled at least once before we act.
    ctx.total_accounts.wait_until_initialized().await;

    let accounts = accounts_api.list(&ListParams::default()).await?.items;
    let new_status = compute_pool_status(&pool, &pool_cfg, &accounts, ctx.total_accounts.limit_delta());
    ctx.metrics
        .pool_size
        .with_label_values(&[&name])
        .set(pool.spec.poolSize as i64);
    update_account_census(&ctx, &accounts);

    if pool.status.as_ref() != Some(&new_status) {
        let patch = json!({
            "apiVersion": "awsfleet.io/v1alpha1",
            "kind": "AccountPool",
            "status": new_status
        });
        pools
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
    }

    if new_status.unclaimedAccounts >= pool.spec.poolSize {
        debug!("pool {name} satisfied: {} unclaimed", new_status.unclaimedAccounts);
        return Ok(requeue_normal_with_jitter());
    }

    if !ctx.total_accounts.accounts_can_be_created() {
        warn!("pool {name} below size but the organization account limit is reached");
        return Ok(requeue_normal_with_jitter());
    }

    // Fill one account per pass; the watch on CloudAccounts brings us back
    // for the rest of the shortfall.
    let account_name = format!("{name}-{}", short_uid());
    let mut account = CloudAccount::new(
        &account_name,
        CloudAccountSpec {
            accountPool: name.clone(),
            regionalServiceQuotas: pool_cfg.regional_quotas()?,
            ..CloudAccountSpec::default()
        },
    );
    account.metadata.namespace = Some(ctx.config.operator_namespace.clone());
    account.metadata.owner_references = pool.controller_owner_ref(&()).map(|oref| vec![oref]);
    accounts_api
        .create(&PostParams::default(), &account)
        .await?;
    info!(
        "pool {name}: created account {account_name} ({} of {})",
        new_status.unclaimedAccounts + 1,
        pool.spec.poolSize
    );

    Ok(Action::requeue(Duration::from_secs(15)))
}

/// Account census over (claimed, reused, state), refreshed whenever a pool
/// reconciles since it already paid for the full listing.
fn update_account_census(ctx: &Context, accounts: &[CloudAccount]) {
    let counts = accounts
        .iter()
        .map(|a| {
            (
                a.is_claimed().to_string(),
                a.is_reused().to_string(),
                a.state().to_string(),
            )
        })
        .counts();
    for ((claimed, reused, state), count) in counts {
        ctx.metrics
            .account_crs
            .with_label_values(&[&claimed, &reused, &state])
            .set(count as i64);
    }
}

pub(crate) fn error_policy(_pool: Arc<AccountPool>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("pool reconcile failed: {:?}", error);
    ctx.metrics.reconcile_failure(POOL_CONTROLLER, error);
    Action::requeue(Duration::from_secs(5 * 60))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::apis::cloudaccount_types::{AccountState, CloudAccountStatus};
    use crate::apis::pool_types::AccountPoolSpec;

    fn account(pool: &str, state: AccountState, claimed: bool, claim_link: &str) -> CloudAccount {
        let mut a = CloudAccount::new(
            "a",
            CloudAccountSpec {
                accountPool: pool.to_string(),
                claimLink: claim_link.to_string(),
                ..CloudAccountSpec::default()
            },
        );
        a.status = Some(CloudAccountStatus {
            state,
            claimed,
            ..CloudAccountStatus::default()
        });
        a
    }

    fn pool(size: i32) -> AccountPool {
        AccountPool::new("default-pool", AccountPoolSpec { poolSize: size })
    }

    #[test]
    fn counters_split_claimed_unclaimed_and_progressing() {
        let cfg = PoolConfig {
            default: true,
            ..PoolConfig::default()
        };
        let accounts = vec![
            account("", AccountState::Ready, false, ""),
            account("default-pool", AccountState::Ready, true, "claim-1"),
            account("default-pool", AccountState::Creating, false, ""),
            account("default-pool", AccountState::Failed, false, ""),
            account("other-pool", AccountState::Ready, false, ""),
        ];
        let status = compute_pool_status(&pool(3), &cfg, &accounts, 10);
        assert_eq!(status.unclaimedAccounts, 2); // ready unowned + creating, not the failed one
        assert_eq!(status.claimedAccounts, 1);
        assert_eq!(status.availableAccounts, 1);
        assert_eq!(status.accountsProgressing, 1);
        assert_eq!(status.awsLimitDelta, 10);
    }

    #[test]
    fn limit_delta_clamps_at_zero() {
        let cfg = PoolConfig::default();
        let status = compute_pool_status(&pool(5), &cfg, &[], -3);
        assert_eq!(status.awsLimitDelta, 0);
        assert_eq!(status.unclaimedAccounts, 0);
    }

    #[test]
    fn non_default_pool_ignores_unlabelled_accounts() {
        let cfg = PoolConfig::default(); // default: false
        let accounts = vec![
            account("", AccountState::Ready, false, ""),
            account("sq-pool", AccountState::Ready, false, ""),
        ];
        let mut p = pool(1);
        p.metadata.name = Some("sq-pool".to_string());
        let status = compute_pool_status(&p, &cfg, &accounts, 1);
        assert_eq!(status.unclaimedAccounts, 1);
    }
}
