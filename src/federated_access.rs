//! FederatedAccess realization: instantiate a validated FederatedRole in a
//! customer account, attach its policies, and publish the console-switch
//! URL. Drift between the deployed policy and the role definition is
//! detected and repaired on later reconciles.

use std::sync::Arc;

use chrono::Utc;
use kube::{
    api::{Api, Patch, PatchParams, ResourceExt},
    runtime::{
        controller::Action,
        finalizer::{finalizer, Event as Finalizer},
    },
};
use serde_json::json;
use tokio::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::{
    apis::{
        conditions::{self, CONDITION_FALSE, CONDITION_TRUE},
        federated_types::{
            CustomPolicy, FederatedAccess, FederatedAccessState, FederatedRole,
            FederatedRoleState,
        },
    },
    aws::{
        policy::{assume_role_trust_policy, PolicyDocument},
        AwsClients,
    },
    config,
    controller::{requeue_normal_with_jitter, short_uid, Context},
    Error, Result,
};

pub static FEDERATED_ACCESS_CONTROLLER: &str = "federatedaccess";
pub static FEDERATED_ACCESS_FINALIZER: &str = "federatedaccesses.awsfleet.io";

/// Six-character suffix making realised role/policy names unique.
pub const UID_LABEL: &str = "awsfleet.io/uid";
pub const ACCOUNT_ID_LABEL: &str = "awsfleet.io/account-id";

#[instrument(skip(ctx, access), fields(trace_id))]
pub async fn reconcile(access: Arc<FederatedAccess>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = crate::telemetry::get_trace_id();
    tracing::Span::current().record("trace_id", tracing::field::display(&trace_id));
    let _timer = ctx.metrics.count_and_measure(FEDERATED_ACCESS_CONTROLLER);
    ctx.diagnostics.write().await.last_event = Utc::now();

    let ns = access.namespace().unwrap(); // access is namespace scoped
    let accesses: Api<FederatedAccess> = Api::namespaced(ctx.client.clone(), &ns);

    finalizer(&accesses, FEDERATED_ACCESS_FINALIZER, access, |event| async {
        match event {
            Finalizer::Apply(access) => apply(access, ctx.clone()).await,
            Finalizer::Cleanup(access) => cleanup(access, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(Box::new(e)))
}

pub(crate) fn error_policy(
    _access: Arc<FederatedAccess>,
    error: &Error,
    ctx: Arc<Context>,
) -> Action {
    warn!("federated access reconcile failed: {:?}", error);
    ctx.metrics
        .reconcile_failure(FEDERATED_ACCESS_CONTROLLER, error);
    Action::requeue(Duration::from_secs(5 * 60))
}

fn uid_label(access: &FederatedAccess) -> Option<String> {
    access
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(UID_LABEL))
        .cloned()
}

fn custom_policy_name(custom: &CustomPolicy, uid: &str) -> String {
    format!("{}-{}", custom.name, uid)
}

fn realised_role_name(access: &FederatedAccess, uid: &str) -> String {
    format!("{}-{}", access.name_any(), uid)
}

fn policy_arn(account_id: &str, policy_name: &str) -> String {
    format!(
        "{}:iam::{}:policy/{}",
        config::partition_prefix(),
        account_id,
        policy_name
    )
}

fn console_url(account_id: &str, role_name: &str) -> String {
    format!("https://signin.aws.amazon.com/switchrole?account={account_id}&roleName={role_name}")
}

async fn apply(access: Arc<FederatedAccess>, ctx: Arc<Context>) -> Result<Action> {
    let name = access.name_any();
    let ns = access.namespace().unwrap();
    let accesses: Api<FederatedAccess> = Api::namespaced(ctx.client.clone(), &ns);

    // A short UID makes the realised names unique; persist it before any
    // provider call so retries reuse the same names.
    let uid = match uid_label(&access) {
        Some(uid) => uid,
        None => {
            let uid = short_uid();
            let patch = json!({ "metadata": { "labels": { UID_LABEL: uid } } });
            accesses
                .patch(&name, &PatchParams::default(), &Patch::Merge(patch))
                .await?;
            return Ok(Action::requeue(Duration::from_secs(1)));
        }
    };

    let role = fetch_federated_role(&ctx, &access).await?;
    let role = match role {
        Some(role) if role.status.as_ref().map(|s| s.state.clone())
            == Some(FederatedRoleState::Valid) =>
        {
            role
        }
        Some(_) => {
            debug!("access {name}: federated role not Valid yet");
            return Ok(Action::requeue(Duration::from_secs(60)));
        }
        None => {
            fail(&ctx, &access, "RoleLookup", "referenced FederatedRole not found").await?;
            return Ok(Action::await_change());
        }
    };

    // Clients scoped to the customer account via the per-entity secret.
    let aws = ctx
        .aws_builder
        .from_secret(
            &access.spec.awsCustomerCredentialSecret.name,
            &access.spec.awsCustomerCredentialSecret.namespace,
            config::default_region(),
        )
        .await?;
    let (account_id, _) = match aws.get_caller_identity().await {
        Ok(identity) => identity,
        Err(e) => {
            fail(&ctx, &access, "CallerIdentity", &e.to_string()).await?;
            return Err(e.into());
        }
    };
    let patch = json!({ "metadata": { "labels": { ACCOUNT_ID_LABEL: account_id } } });
    accesses
        .patch(&name, &PatchParams::default(), &Patch::Merge(patch))
        .await?;

    let role_name = realised_role_name(&access, &uid);

    if access.state() == FederatedAccessState::Ready {
        return repair_drift(&ctx, &access, &role, &aws, &account_id, &uid, &role_name).await;
    }

    realise(&ctx, &access, &role, &aws, &account_id, &uid, &role_name).await?;

    let mut status = access.status.clone().unwrap_or_default();
    status.state = FederatedAccessState::Ready;
    status.consoleURL = console_url(&account_id, &role_name);
    conditions::set_condition(
        &mut status.conditions,
        "Ready",
        CONDITION_TRUE,
        "AccessRealised",
        "",
    );
    patch_access_status(&ctx, &access, &status).await?;
    info!("federated access {ns}/{name} is Ready");
    Ok(requeue_normal_with_jitter())
}

async fn fetch_federated_role(
    ctx: &Context,
    access: &FederatedAccess,
) -> Result<Option<FederatedRole>> {
    let role_ns = if access.spec.federatedRole.namespace.is_empty() {
        access.namespace().unwrap_or_default()
    } else {
        access.spec.federatedRole.namespace.clone()
    };
    let roles: Api<FederatedRole> = Api::namespaced(ctx.client.clone(), &role_ns);
    match roles.get(&access.spec.federatedRole.name).await {
        Ok(role) => Ok(Some(role)),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Create the custom policy and the role, then wire up all attachments.
/// `EntityAlreadyExists` on either is resolved by recreating from scratch so
/// stale definitions never survive.
#[allow(clippy::too_many_arguments)]
async fn realise(
    ctx: &Context,
    access: &FederatedAccess,
    role: &FederatedRole,
    aws: &AwsClients,
    account_id: &str,
    uid: &str,
    role_name: &str,
) -> Result<()> {
    let mut custom_arn = None;
    if let Some(custom) = &role.spec.awsCustomPolicy {
        let policy_name = custom_policy_name(custom, uid);
        let document = PolicyDocument::from(custom);
        let arn = match aws
            .create_policy(&policy_name, &document, &custom.description)
            .await
        {
            Ok(arn) => arn,
            Err(e) if e.code() == "EntityAlreadyExists" => {
                let arn = policy_arn(account_id, &policy_name);
                aws.detach_role_policy(role_name, &arn).await?;
                aws.delete_policy(&arn).await?;
                aws.create_policy(&policy_name, &document, &custom.description)
                    .await
                    .map_err(|e| fail_error(ctx, access, "CreatePolicy", e))?
            }
            Err(e) => {
                fail(ctx, access, "CreatePolicy", &e.to_string()).await?;
                return Err(e.into());
            }
        };
        custom_arn = Some(arn);
    }

    let trust = assume_role_trust_policy(std::slice::from_ref(
        &access.spec.externalCustomerAWSIAMARN,
    ));
    if let Err(e) = aws
        .create_role(role_name, &trust, &role.spec.roleDescription)
        .await
    {
        if e.code() == "EntityAlreadyExists" {
            teardown_role(aws, role_name).await?;
            aws.create_role(role_name, &trust, &role.spec.roleDescription)
                .await
                .map_err(|e| {
                    warn!("recreating role {role_name} failed: {e}");
                    Error::AwsError(e)
                })?;
        } else {
            fail(ctx, access, "CreateRole", &e.to_string()).await?;
            return Err(e.into());
        }
    }

    for managed in &role.spec.awsManagedPolicies {
        let Some(arn) = aws.find_managed_policy_arn(managed).await? else {
            fail(ctx, access, "AttachManagedPolicy", managed).await?;
            return Err(Error::InvalidErr(format!("managed policy {managed} missing")));
        };
        aws.attach_role_policy(role_name, &arn).await?;
    }
    if let Some(arn) = custom_arn {
        aws.attach_role_policy(role_name, &arn).await?;
    }
    Ok(())
}

/// Compare the deployed custom policy with a fresh marshal of the role's
/// definition; on divergence detach, recreate and reattach.
#[allow(clippy::too_many_arguments)]
async fn repair_drift(
    ctx: &Context,
    access: &FederatedAccess,
    role: &FederatedRole,
    aws: &AwsClients,
    account_id: &str,
    uid: &str,
    role_name: &str,
) -> Result<Action> {
    let Some(custom) = &role.spec.awsCustomPolicy else {
        return Ok(requeue_normal_with_jitter());
    };
    let policy_name = custom_policy_name(custom, uid);
    let arn = policy_arn(account_id, &policy_name);
    let fresh = PolicyDocument::from(custom);

    let deployed = match aws.get_policy_document(&arn).await {
        Ok(encoded) => Some(PolicyDocument::from_url_encoded(&encoded)?),
        Err(e) if e.is_not_found() => None,
        Err(e) => return Err(e.into()),
    };

    if deployed.as_ref() == Some(&fresh) {
        return Ok(requeue_normal_with_jitter());
    }

    info!(
        "federated access {}: policy {policy_name} drifted, recreating",
        access.name_any()
    );
    aws.detach_role_policy(role_name, &arn).await?;
    aws.delete_policy(&arn).await?;
    let new_arn = aws
        .create_policy(&policy_name, &fresh, &custom.description)
        .await?;
    aws.attach_role_policy(role_name, &new_arn).await?;
    Ok(requeue_normal_with_jitter())
}

/// Detach everything from the realised role and delete it.
async fn teardown_role(aws: &AwsClients, role_name: &str) -> Result<()> {
    for (_, arn) in aws.list_attached_role_policies(role_name).await? {
        aws.detach_role_policy(role_name, &arn).await?;
    }
    for inline in aws.list_role_policies(role_name).await? {
        aws.delete_role_policy(role_name, &inline).await?;
    }
    aws.delete_role(role_name).await?;
    Ok(())
}

async fn cleanup(access: Arc<FederatedAccess>, ctx: Arc<Context>) -> Result<Action> {
    let name = access.name_any();
    let Some(uid) = uid_label(&access) else {
        // Never realised anything.
        return Ok(Action::await_change());
    };

    let aws = match ctx
        .aws_builder
        .from_secret(
            &access.spec.awsCustomerCredentialSecret.name,
            &access.spec.awsCustomerCredentialSecret.namespace,
            config::default_region(),
        )
        .await
    {
        Ok(aws) => aws,
        Err(e) => {
            // Customer secret already gone: nothing left we can touch.
            warn!("federated access {name}: no customer credentials for cleanup: {e}");
            return Ok(Action::await_change());
        }
    };

    let role_name = realised_role_name(&access, &uid);
    let attached = aws.list_attached_role_policies(&role_name).await?;
    for (_, arn) in &attached {
        aws.detach_role_policy(&role_name, arn).await?;
    }
    if let Some(role) = fetch_federated_role(&ctx, &access).await? {
        if let Some(custom) = &role.spec.awsCustomPolicy {
            if let Ok((account_id, _)) = aws.get_caller_identity().await {
                let arn = policy_arn(&account_id, &custom_policy_name(custom, &uid));
                aws.delete_policy(&arn).await?;
            }
        }
    }
    for inline in aws.list_role_policies(&role_name).await? {
        aws.delete_role_policy(&role_name, &inline).await?;
    }
    aws.delete_role(&role_name).await?;
    info!("federated access {name}: role {role_name} torn down");
    Ok(Action::await_change())
}

async fn patch_access_status(
    ctx: &Context,
    access: &FederatedAccess,
    status: &crate::apis::federated_types::FederatedAccessStatus,
) -> Result<()> {
    let ns = access.namespace().unwrap();
    let accesses: Api<FederatedAccess> = Api::namespaced(ctx.client.clone(), &ns);
    let patch = json!({
        "apiVersion": "awsfleet.io/v1alpha1",
        "kind": "FederatedAccess",
        "status": status
    });
    accesses
        .patch_status(&access.name_any(), &PatchParams::default(), &Patch::Merge(patch))
        .await?;
    Ok(())
}

/// Record which phase failed; Ready is sticky except on drift repair, so a
/// Failed entity stays Failed until its spec changes.
async fn fail(ctx: &Context, access: &FederatedAccess, phase: &str, message: &str) -> Result<()> {
    let mut status = access.status.clone().unwrap_or_default();
    status.state = FederatedAccessState::Failed;
    conditions::set_condition(
        &mut status.conditions,
        "Ready",
        CONDITION_FALSE,
        &format!("{phase}Failed"),
        message,
    );
    patch_access_status(ctx, access, &status).await
}

fn fail_error(
    _ctx: &Context,
    _access: &FederatedAccess,
    phase: &str,
    error: crate::errors::AwsError,
) -> Error {
    warn!("{phase} failed: {error}");
    Error::AwsError(error)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::apis::federated_types::FederatedAccessSpec;

    #[test]
    fn console_url_has_account_and_role() {
        assert_eq!(
            console_url("123456789012", "read-only-x1y2z3"),
            "https://signin.aws.amazon.com/switchrole?account=123456789012&roleName=read-only-x1y2z3"
        );
    }

    #[test]
    fn realised_names_carry_the_uid_suffix() {
        let access = FederatedAccess::new("audit-access", FederatedAccessSpec::default());
        assert_eq!(realised_role_name(&access, "a1b2c3"), "audit-access-a1b2c3");

        let custom = CustomPolicy {
            name: "audit-read".to_string(),
            ..CustomPolicy::default()
        };
        assert_eq!(custom_policy_name(&custom, "a1b2c3"), "audit-read-a1b2c3");
    }
}
