//! FederatedRole validation: prove the inline policy marshals into a
//! document the provider accepts, and that every referenced managed policy
//! actually exists.

use std::sync::Arc;

use chrono::Utc;
use kube::{
    api::{Api, ListParams, Patch, PatchParams, ResourceExt},
    runtime::controller::Action,
};
use serde_json::json;
use tokio::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::{
    apis::{
        conditions::{self, CONDITION_FALSE, CONDITION_TRUE},
        federated_types::{FederatedAccess, FederatedRole, FederatedRoleState},
    },
    aws::policy::PolicyDocument,
    config,
    controller::{requeue_normal_with_jitter, short_uid, Context},
    errors::AwsError,
    Error, Result,
};

pub static FEDERATED_ROLE_CONTROLLER: &str = "federatedrole";

/// Label tying a FederatedAccess to the FederatedRole it instantiates.
pub const ROLE_LABEL: &str = "awsfleet.io/federated-role";
/// Touched on dependent FederatedAccess entities to force a re-reconcile.
pub const LAST_ROLE_UPDATE_ANNOTATION: &str = "awsfleet.io/last-role-update";

#[instrument(skip(ctx, role))]
pub async fn reconcile(role: Arc<FederatedRole>, ctx: Arc<Context>) -> Result<Action> {
    // The isolated partition carries no federated access machinery.
    if config::is_fedramp() {
        return Ok(Action::await_change());
    }
    let _timer = ctx.metrics.count_and_measure(FEDERATED_ROLE_CONTROLLER);
    ctx.diagnostics.write().await.last_event = Utc::now();

    let name = role.name_any();
    let aws = ctx.operator_aws().await?;

    // Validate the inline policy by creating it for real and deleting it
    // again; only the provider knows its own dialect corner cases.
    if let Some(custom) = &role.spec.awsCustomPolicy {
        let document = PolicyDocument::from(custom);
        let probe_name = format!("{}-validation-{}", custom.name, short_uid());
        match aws
            .create_policy(&probe_name, &document, "policy validation probe")
            .await
        {
            Ok(arn) => {
                aws.delete_policy(&arn).await?;
                debug!("role {name}: inline policy validated");
            }
            Err(AwsError::Validation { message, .. }) => {
                warn!("role {name}: malformed inline policy: {message}");
                set_role_state(
                    &ctx,
                    &role,
                    FederatedRoleState::Invalid,
                    "MalformedPolicy",
                    &message,
                )
                .await?;
                return Ok(Action::await_change());
            }
            Err(e) => return Err(e.into()),
        }
    }

    for managed in &role.spec.awsManagedPolicies {
        if aws.find_managed_policy_arn(managed).await?.is_none() {
            warn!("role {name}: managed policy {managed} does not exist");
            set_role_state(
                &ctx,
                &role,
                FederatedRoleState::Invalid,
                "InvalidManagedPolicy",
                managed,
            )
            .await?;
            return Ok(Action::await_change());
        }
    }

    set_role_state(&ctx, &role, FederatedRoleState::Valid, "Validated", "").await?;
    touch_dependent_accesses(&ctx, &name).await?;
    info!("federated role {name} is Valid");
    Ok(requeue_normal_with_jitter())
}

pub(crate) fn error_policy(_role: Arc<FederatedRole>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("federated role reconcile failed: {:?}", error);
    ctx.metrics.reconcile_failure(FEDERATED_ROLE_CONTROLLER, error);
    Action::requeue(Duration::from_secs(5 * 60))
}

async fn set_role_state(
    ctx: &Context,
    role: &FederatedRole,
    state: FederatedRoleState,
    reason: &str,
    message: &str,
) -> Result<()> {
    let ns = role.namespace().unwrap();
    let roles: Api<FederatedRole> = Api::namespaced(ctx.client.clone(), &ns);
    let mut status = role.status.clone().unwrap_or_default();
    let condition_status = if state == FederatedRoleState::Valid {
        CONDITION_TRUE
    } else {
        CONDITION_FALSE
    };
    conditions::set_condition(
        &mut status.conditions,
        "Valid",
        condition_status,
        reason,
        message,
    );
    status.state = state;
    let patch = json!({
        "apiVersion": "awsfleet.io/v1alpha1",
        "kind": "FederatedRole",
        "status": status
    });
    roles
        .patch_status(&role.name_any(), &PatchParams::default(), &Patch::Merge(patch))
        .await?;
    Ok(())
}

/// Stamp every FederatedAccess instantiating this role so it re-reconciles
/// against the fresh definition.
async fn touch_dependent_accesses(ctx: &Context, role_name: &str) -> Result<()> {
    let accesses: Api<FederatedAccess> = Api::all(ctx.client.clone());
    let lp = ListParams::default().labels(&format!("{ROLE_LABEL}={role_name}"));
    for access in accesses.list(&lp).await?.items {
        let ns = access.namespace().unwrap_or_default();
        let scoped: Api<FederatedAccess> = Api::namespaced(ctx.client.clone(), &ns);
        let patch = json!({
            "metadata": {
                "annotations": {
                    LAST_ROLE_UPDATE_ANNOTATION: Utc::now().to_rfc3339()
                }
            }
        });
        scoped
            .patch(&access.name_any(), &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        debug!("touched federated access {ns}/{}", access.name_any());
    }
    Ok(())
}
