//! The PendingVerification stage: raise the new account's instance limits
//! through a support case and wait for it to resolve.

use kube::{
    api::{Api, Patch, PatchParams, ResourceExt},
    runtime::controller::Action,
};
use serde_json::json;
use tokio::time::Duration;
use tracing::{debug, info};

use crate::{
    apis::cloudaccount_types::{AccountState, CloudAccount},
    config,
    controller::Context,
    Result,
};

use super::set_account_state;

const CASE_POLL_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub async fn handle_pending_verification(
    account: &CloudAccount,
    ctx: &Context,
) -> Result<Action> {
    let name = account.name_any();

    // Dev modes never talk to the support API.
    if ctx.config.dev_mode.skip_support_cases() {
        set_account_state(
            ctx,
            account,
            AccountState::InitializingRegions,
            "SupportCaseSkipped",
            "dev mode",
        )
        .await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let aws = ctx
        .account_aws(account, config::default_region(), None)
        .await?;

    if account.spec.supportCaseID.is_empty() {
        let case_id = aws
            .open_limit_increase_case(&account.spec.awsAccountID)
            .await?;
        info!("account {name}: opened support case {case_id}");
        let accounts: Api<CloudAccount> =
            Api::namespaced(ctx.client.clone(), &ctx.config.operator_namespace);
        let patch = json!({ "spec": { "supportCaseID": case_id } });
        accounts
            .patch(&name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        return Ok(Action::requeue(CASE_POLL_INTERVAL));
    }

    if aws
        .support_case_resolved(&account.spec.supportCaseID)
        .await?
    {
        info!(
            "account {name}: support case {} resolved",
            account.spec.supportCaseID
        );
        set_account_state(
            ctx,
            account,
            AccountState::InitializingRegions,
            "SupportCaseResolved",
            "",
        )
        .await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    debug!(
        "account {name}: support case {} still open",
        account.spec.supportCaseID
    );
    Ok(Action::requeue(CASE_POLL_INTERVAL))
}
