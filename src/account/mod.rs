//! The CloudAccount state machine.
//!
//! Creating -> PendingVerification -> InitializingRegions -> Ready, with
//! Failed as the terminal state of an incarnation. Each reconcile dispatches
//! on the observed state and performs exactly one stage.

pub mod create;
pub mod iam;
pub mod quotas;
pub mod regions;
pub mod support_case;

use std::sync::Arc;

use chrono::Utc;
use kube::{
    api::{Api, Patch, PatchParams, ResourceExt},
    runtime::{
        controller::Action,
        events::{Event, EventType},
        finalizer::{finalizer, Event as Finalizer},
    },
};
use serde_json::json;
use tokio::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::{
    apis::{
        cloudaccount_types::{AccountState, CloudAccount, CloudAccountStatus},
        conditions::{self, CONDITION_TRUE},
    },
    config,
    controller::{requeue_normal_with_jitter, Context},
    secret::delete_secret,
    Error, Result,
};

pub static ACCOUNT_CONTROLLER: &str = "cloudaccount";
pub static ACCOUNT_FINALIZER: &str = "cloudaccounts.awsfleet.io";

/// IAM user used for tenant provisioning inside the member account.
pub const ADMIN_USER: &str = "osdManagedAdmin";
/// IAM user used for operator access inside the member account.
pub const SRE_USER: &str = "osdManagedAdminSRE";
/// Name prefix of the support-access role created for STS accounts.
pub const SUPPORT_ROLE_PREFIX: &str = "ManagedOpenShift-Support";

pub fn account_secret_name(account_name: &str) -> String {
    format!("{account_name}-secret")
}

/// Stable short identifier derived from the entity's store UID.
pub fn account_short_uid(account: &CloudAccount) -> String {
    account
        .metadata
        .uid
        .as_deref()
        .unwrap_or("0000000")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(7)
        .collect()
}

pub fn support_role_name(account: &CloudAccount) -> String {
    format!("{SUPPORT_ROLE_PREFIX}-{}", account_short_uid(account))
}

#[instrument(skip(ctx, account), fields(trace_id))]
pub async fn reconcile(account: Arc<CloudAccount>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = crate::telemetry::get_trace_id();
    tracing::Span::current().record("trace_id", tracing::field::display(&trace_id));
    let _timer = ctx.metrics.count_and_measure(ACCOUNT_CONTROLLER);
    ctx.diagnostics.write().await.last_event = Utc::now();

    let ns = account.namespace().unwrap(); // account is namespace scoped
    let accounts: Api<CloudAccount> = Api::namespaced(ctx.client.clone(), &ns);

    debug!(
        "Reconciling CloudAccount \"{}\" in {}",
        account.name_any(),
        ns
    );
    finalizer(&accounts, ACCOUNT_FINALIZER, account, |event| async {
        match event {
            Finalizer::Apply(account) => apply(account, ctx.clone()).await,
            Finalizer::Cleanup(account) => cleanup(account, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(Box::new(e)))
}

async fn apply(account: Arc<CloudAccount>, ctx: Arc<Context>) -> Result<Action> {
    match account.state() {
        AccountState::Unset => create::handle_unset(&account, &ctx).await,
        AccountState::Creating => iam::handle_creating(&account, &ctx).await,
        AccountState::PendingVerification => {
            support_case::handle_pending_verification(&account, &ctx).await
        }
        AccountState::InitializingRegions => regions::handle_initializing(&account, &ctx).await,
        AccountState::Ready => handle_ready(&account, &ctx).await,
        AccountState::Failed => {
            // Terminal for this incarnation; a claim cleanup may reset the
            // spec and re-enter the machine.
            Ok(Action::await_change())
        }
    }
}

async fn handle_ready(account: &CloudAccount, ctx: &Context) -> Result<Action> {
    let rotate = account
        .status
        .as_ref()
        .map(|s| s.rotateCredentials)
        .unwrap_or(false);
    if rotate && !account.spec.manualSTS {
        info!("rotating credentials for {}", account.name_any());
        iam::rotate_credentials(account, ctx).await?;
        let accounts: Api<CloudAccount> =
            Api::namespaced(ctx.client.clone(), &ctx.config.operator_namespace);
        let patch = json!({
            "status": { "rotateCredentials": false, "rotateConsoleCredentials": false }
        });
        accounts
            .patch_status(
                &account.name_any(),
                &PatchParams::default(),
                &Patch::Merge(patch),
            )
            .await?;
        return Ok(Action::requeue(Duration::from_secs(30)));
    }

    // Quota requests may still be in flight after Ready; keep nudging them.
    if quotas::has_open_quota_requests(account) {
        quotas::reconcile_service_quotas(account, ctx).await?;
    }
    Ok(requeue_normal_with_jitter())
}

// Finalizer cleanup (the object was deleted, ensure nothing is orphaned)
#[instrument(skip(self_, ctx))]
async fn cleanup(self_: Arc<CloudAccount>, ctx: Arc<Context>) -> Result<Action> {
    let name = self_.name_any();
    info!("cleaning up CloudAccount {name}");
    delete_secret(
        ctx.client.clone(),
        &account_secret_name(&name),
        &ctx.config.operator_namespace,
    )
    .await?;
    let recorder = ctx
        .diagnostics
        .read()
        .await
        .recorder(ctx.client.clone(), &self_);
    recorder
        .publish(Event {
            type_: EventType::Normal,
            reason: "DeleteCloudAccount".into(),
            note: Some(format!("Delete `{name}`")),
            action: "Reconciling".into(),
            secondary: None,
        })
        .await
        .map_err(Error::KubeError)?;
    Ok(Action::await_change())
}

pub(crate) fn error_policy(
    _account: Arc<CloudAccount>,
    error: &Error,
    ctx: Arc<Context>,
) -> Action {
    warn!("account reconcile failed: {:?}", error);
    ctx.metrics.reconcile_failure(ACCOUNT_CONTROLLER, error);
    Action::requeue(Duration::from_secs(5 * 60))
}

/// Merge-patch the account status, carrying the new state and condition
/// history.
pub async fn patch_account_status(
    ctx: &Context,
    name: &str,
    status: &CloudAccountStatus,
) -> Result<()> {
    let accounts: Api<CloudAccount> =
        Api::namespaced(ctx.client.clone(), &ctx.config.operator_namespace);
    let patch = json!({
        "apiVersion": "awsfleet.io/v1alpha1",
        "kind": "CloudAccount",
        "status": status
    });
    accounts
        .patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
        .await?;
    Ok(())
}

/// Move the account to `state`, recording the transition as a condition.
pub async fn set_account_state(
    ctx: &Context,
    account: &CloudAccount,
    state: AccountState,
    reason: &str,
    message: &str,
) -> Result<()> {
    let mut status = account.status.clone().unwrap_or_default();
    let claimed = state == AccountState::Ready && !account.spec.claimLink.is_empty();
    conditions::set_condition(
        &mut status.conditions,
        &state.to_string(),
        CONDITION_TRUE,
        reason,
        message,
    );
    status.state = state;
    status.claimed = claimed;
    patch_account_status(ctx, &account.name_any(), &status).await
}

/// Root email address for a new member account.
pub fn account_email(account_name: &str, ctx: &Context) -> String {
    format!("{}@{}", account_name, ctx.config.account_email_domain)
}

/// ARN of the administrator managed policy in the active partition.
pub fn administrator_policy_arn() -> String {
    format!(
        "{}:iam::aws:policy/AdministratorAccess",
        config::partition_prefix()
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::apis::cloudaccount_types::CloudAccountSpec;

    #[test]
    fn short_uid_is_stable_and_alphanumeric() {
        let mut account = CloudAccount::new("a1", CloudAccountSpec::default());
        account.metadata.uid = Some("752d59ef-2671-4890-9feb-0097459b18c8".into());
        assert_eq!(account_short_uid(&account), "752d59e");
        assert_eq!(
            support_role_name(&account),
            "ManagedOpenShift-Support-752d59e"
        );
    }

    #[test]
    fn administrator_policy_arn_is_partition_aware() {
        crate::config::set_fedramp(false);
        assert_eq!(
            administrator_policy_arn(),
            "arn:aws:iam::aws:policy/AdministratorAccess"
        );
    }
}
