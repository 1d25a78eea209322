//! The Creating stage: turn a bare CloudAccount entity into a real member
//! account of the organization.

use aws_sdk_organizations::types::CreateAccountState;
use kube::{
    api::{Api, Patch, PatchParams, ResourceExt},
    runtime::controller::Action,
};
use serde_json::json;
use tokio::time::{Duration, Instant};
use tracing::{info, warn};

use crate::{
    apis::cloudaccount_types::{AccountState, CloudAccount},
    controller::Context,
    errors::AwsError,
    Result,
};

use super::{account_email, set_account_state};

/// How long a provider account creation may pend before the entity fails.
pub const CREATE_PEND_TIME: Duration = Duration::from_secs(10 * 60);
const CREATE_POLL_INTERVAL: Duration = Duration::from_secs(10);

pub async fn handle_unset(account: &CloudAccount, ctx: &Context) -> Result<Action> {
    let name = account.name_any();

    if account.spec.byo {
        // The provider account pre-exists; the claim controller stamped its
        // id onto the spec when it spawned us.
        if account.spec.awsAccountID.is_empty() {
            set_account_state(
                ctx,
                account,
                AccountState::Failed,
                "MissingAccountID",
                "BYO account entity has no provider account id",
            )
            .await?;
            return Ok(Action::await_change());
        }
        set_account_state(
            ctx,
            account,
            AccountState::Creating,
            "AdoptedExistingAccount",
            "provider account supplied by tenant",
        )
        .await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    if !account.spec.awsAccountID.is_empty() {
        // Creation finished in an earlier incarnation of this reconcile.
        set_account_state(ctx, account, AccountState::Creating, "AccountCreated", "")
            .await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    // Budget gate: never issue a creation while the organization is at its
    // account limit.
    if !ctx.total_accounts.accounts_can_be_created() {
        warn!("account {name}: creation deferred, organization account limit reached");
        return Ok(Action::requeue(Duration::from_secs(5 * 60)));
    }

    let aws = ctx.operator_aws().await?;
    let email = account_email(&name, ctx);
    let request_id = match aws.create_account(&email, &name).await {
        Ok(id) => id,
        Err(e @ AwsError::Fatal { .. }) => {
            set_account_state(
                ctx,
                account,
                AccountState::Failed,
                "CreateAccountFailed",
                &e.to_string(),
            )
            .await?;
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e.into()),
    };
    info!("account {name}: creation request {request_id} submitted");

    let deadline = Instant::now() + CREATE_PEND_TIME;
    let account_id = loop {
        let status = aws.describe_create_account_status(&request_id).await?;
        match status.state() {
            Some(CreateAccountState::Succeeded) => {
                break status
                    .account_id()
                    .ok_or(AwsError::MissingField("CreateAccountStatus.AccountId"))?
                    .to_string();
            }
            Some(CreateAccountState::Failed) => {
                let reason = status
                    .failure_reason()
                    .map(|r| r.as_str().to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                set_account_state(
                    ctx,
                    account,
                    AccountState::Failed,
                    "CreateAccountFailed",
                    &reason,
                )
                .await?;
                return Ok(Action::await_change());
            }
            _ => {
                if Instant::now() >= deadline {
                    set_account_state(
                        ctx,
                        account,
                        AccountState::Failed,
                        "CreationTimedOut",
                        "provider account creation did not finish in time",
                    )
                    .await?;
                    return Ok(Action::await_change());
                }
                tokio::time::sleep(CREATE_POLL_INTERVAL).await;
            }
        }
    };

    // The account id is immutable from here on.
    let accounts: Api<CloudAccount> =
        Api::namespaced(ctx.client.clone(), &ctx.config.operator_namespace);
    let patch = json!({ "spec": { "awsAccountID": account_id } });
    accounts
        .patch(&name, &PatchParams::default(), &Patch::Merge(patch))
        .await?;
    info!("account {name}: provider account {account_id} created");

    set_account_state(ctx, account, AccountState::Creating, "AccountCreated", "")
        .await?;
    Ok(Action::requeue(Duration::from_secs(1)))
}
