//! Identity setup inside a freshly created member account: internal users,
//! administrator policy, long-lived keys, and the support-access role for
//! STS accounts.

use kube::{
    api::{Api, Patch, PatchParams, ResourceExt},
    runtime::controller::Action,
};
use serde_json::json;
use tokio::time::Duration;
use tracing::{info, instrument};

use crate::{
    apis::cloudaccount_types::{AccountState, CloudAccount},
    aws::{
        iam::AccessKey,
        policy::assume_role_trust_policy,
        AwsClients,
    },
    config, configmap,
    controller::Context,
    secret::publish_long_lived_secret,
    Result,
};

use super::{
    account_secret_name, administrator_policy_arn, set_account_state, support_role_name,
};

#[instrument(skip(account, ctx), fields(account = %account.name_any()))]
pub async fn handle_creating(account: &CloudAccount, ctx: &Context) -> Result<Action> {
    let name = account.name_any();
    let aws = ctx
        .account_aws(account, config::default_region(), None)
        .await?;

    if account.spec.manualSTS {
        ensure_support_role(account, ctx, &aws).await?;
    } else {
        setup_internal_users(account, ctx, &aws).await?;
    }

    set_account_state(
        ctx,
        account,
        AccountState::PendingVerification,
        "IdentityConfigured",
        "",
    )
    .await?;
    info!("account {name}: identity configured");
    Ok(Action::requeue(Duration::from_secs(1)))
}

/// Create the two internal users, grant them the administrator managed
/// policy, and publish fresh keys for the provisioning user.
async fn setup_internal_users(
    account: &CloudAccount,
    ctx: &Context,
    aws: &AwsClients,
) -> Result<()> {
    let admin_arn = administrator_policy_arn();
    for user in [super::ADMIN_USER, super::SRE_USER] {
        aws.ensure_user(user).await?;
        aws.attach_user_policy(user, &admin_arn).await?;
    }
    let key = mint_fresh_keys(aws, super::ADMIN_USER).await?;
    publish_long_lived_secret(
        ctx.client.clone(),
        &account_secret_name(&account.name_any()),
        &ctx.config.operator_namespace,
        &account.name_any(),
        &key,
    )
    .await
}

/// Support-access role for STS accounts, trusted by the well-known operator
/// principal. The resulting ARN lands on the spec.
async fn ensure_support_role(
    account: &CloudAccount,
    ctx: &Context,
    aws: &AwsClients,
) -> Result<()> {
    let role_name = support_role_name(account);
    let principal = support_trust_principal(ctx).await?;
    let trust = assume_role_trust_policy(&[principal]);

    let role_arn = match aws
        .create_role(&role_name, &trust, "Operator support access")
        .await
    {
        Ok(role) => role.arn().to_string(),
        Err(e) if e.code() == "EntityAlreadyExists" => {
            aws.get_role(&role_name).await?.arn().to_string()
        }
        Err(e) => return Err(e.into()),
    };

    let accounts: Api<CloudAccount> =
        Api::namespaced(ctx.client.clone(), &ctx.config.operator_namespace);
    let patch = json!({ "spec": { "supportRoleARN": role_arn } });
    accounts
        .patch(
            &account.name_any(),
            &PatchParams::default(),
            &Patch::Merge(patch),
        )
        .await?;
    Ok(())
}

/// The principal support roles trust: the resolved `CCS-Access-Arn` config
/// key, or the operator's own identity when it has not been written yet.
async fn support_trust_principal(ctx: &Context) -> Result<String> {
    let cm =
        configmap::get_operator_configmap(ctx.client.clone(), &ctx.config.operator_namespace)
            .await?;
    if let Ok(arn) = configmap::read_key(&cm, "CCS-Access-Arn") {
        return Ok(arn);
    }
    let operator = ctx.operator_aws().await?;
    let (_, arn) = operator.get_caller_identity().await?;
    Ok(arn)
}

/// Replace every key of the provisioning user with a fresh pair, staying
/// under the provider's two-key limit.
async fn mint_fresh_keys(aws: &AwsClients, user: &str) -> Result<AccessKey> {
    aws.delete_all_access_keys(user).await?;
    Ok(aws.create_access_key(user).await?)
}

/// Regenerate and republish the long-lived keys of a Ready account.
pub async fn rotate_credentials(account: &CloudAccount, ctx: &Context) -> Result<()> {
    let aws = ctx
        .account_aws(account, config::default_region(), None)
        .await?;
    let key = mint_fresh_keys(&aws, super::ADMIN_USER).await?;
    publish_long_lived_secret(
        ctx.client.clone(),
        &account_secret_name(&account.name_any()),
        &ctx.config.operator_namespace,
        &account.name_any(),
        &key,
    )
    .await
}
