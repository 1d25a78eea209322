//! The AccountClaim controller: binds claims to pool accounts, onboards BYO
//! accounts, publishes tenant credentials, and scrubs accounts for reuse
//! when a claim goes away.

pub mod byo;
pub mod cleanup;
pub mod select;

use std::{collections::BTreeMap, sync::Arc};

use chrono::Utc;
use kube::{
    api::{Api, ListParams, Patch, PatchParams, PostParams, ResourceExt},
    runtime::{
        controller::Action,
        finalizer::{finalizer, Event as Finalizer},
    },
};
use serde_json::json;
use tokio::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::{
    account::{account_secret_name, account_short_uid, support_role_name, ADMIN_USER},
    apis::{
        claim_types::{AccountClaim, ClaimState, FleetManagerConfig},
        cloudaccount_types::CloudAccount,
        conditions::{self, CONDITION_TRUE},
    },
    aws::{
        assume,
        policy::{assume_role_trust_policy, PolicyDocument, PolicyStatement},
    },
    config, configmap,
    controller::{requeue_normal_with_jitter, Context},
    secret::{copy_secret_to_namespace, delete_secret, publish_fake_secret, publish_sts_secret},
    Error, Result,
};

pub static CLAIM_CONTROLLER: &str = "accountclaim";
pub static CLAIM_FINALIZER: &str = "accountclaims.awsfleet.io";

/// Claims carrying this annotation get placeholder credentials and no
/// provider interaction at all.
pub const FAKE_ANNOTATION: &str = "awsfleet.io/fake";

#[instrument(skip(ctx, claim), fields(trace_id))]
pub async fn reconcile(claim: Arc<AccountClaim>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = crate::telemetry::get_trace_id();
    tracing::Span::current().record("trace_id", tracing::field::display(&trace_id));
    let _timer = ctx.metrics.count_and_measure(CLAIM_CONTROLLER);
    ctx.diagnostics.write().await.last_event = Utc::now();

    let ns = claim.namespace().unwrap(); // claim is namespace scoped
    let claims: Api<AccountClaim> = Api::namespaced(ctx.client.clone(), &ns);

    update_claim_census(&ctx).await;

    debug!("Reconciling AccountClaim \"{}\" in {}", claim.name_any(), ns);
    finalizer(&claims, CLAIM_FINALIZER, claim, |event| async {
        match event {
            Finalizer::Apply(claim) => apply(claim, ctx.clone()).await,
            Finalizer::Cleanup(claim) => handle_delete(claim, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(Box::new(e)))
}

pub(crate) fn error_policy(_claim: Arc<AccountClaim>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("claim reconcile failed: {:?}", error);
    ctx.metrics.reconcile_failure(CLAIM_CONTROLLER, error);
    match error {
        // No account in the pool yet: the pool controller is on it.
        Error::NoSuitableAccount(_) => Action::requeue(Duration::from_secs(30)),
        _ => Action::requeue(Duration::from_secs(5 * 60)),
    }
}

fn is_fake(claim: &AccountClaim) -> bool {
    claim
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(FAKE_ANNOTATION))
        .map(|v| v == "true")
        .unwrap_or(false)
}

/// Where the tenant-facing credentials land.
fn tenant_secret_target(claim: &AccountClaim) -> (String, String) {
    let name = if claim.spec.awsCredentialSecret.name.is_empty() {
        format!("{}-aws-credentials", claim.name_any())
    } else {
        claim.spec.awsCredentialSecret.name.clone()
    };
    let namespace = if claim.spec.awsCredentialSecret.namespace.is_empty() {
        claim.namespace().unwrap_or_default()
    } else {
        claim.spec.awsCredentialSecret.namespace.clone()
    };
    (name, namespace)
}

async fn apply(claim: Arc<AccountClaim>, ctx: Arc<Context>) -> Result<Action> {
    let name = claim.name_any();
    let ns = claim.namespace().unwrap();
    let claims: Api<AccountClaim> = Api::namespaced(ctx.client.clone(), &ns);
    let accounts: Api<CloudAccount> =
        Api::namespaced(ctx.client.clone(), &ctx.config.operator_namespace);

    if is_fake(&claim) {
        return handle_fake(&claim, &ctx).await;
    }
    if claim.spec.byo {
        return byo::handle(&claim, &ctx).await;
    }

    if claim.state() == ClaimState::Unset {
        set_claim_state(&ctx, &claim, ClaimState::Pending).await?;
    }

    if !claim.is_bound() {
        let cm = configmap::get_operator_configmap(
            ctx.client.clone(),
            &ctx.config.operator_namespace,
        )
        .await?;
        let table = configmap::pool_table(&cm)?;
        let default_pool = configmap::default_pool_name(&table)
            .ok_or_else(|| Error::MissingConfigKey("accountpool (no default pool)".to_string()))?;

        let available = accounts.list(&ListParams::default()).await?.items;
        let selected = select::select_account(&claim, &available, &default_pool)
            .ok_or_else(|| Error::NoSuitableAccount(name.clone()))?;
        let selected_name = selected.name_any();

        bind_account(&ctx, &claim, &selected_name).await?;
        let patch = json!({ "spec": { "accountLink": selected_name } });
        claims
            .patch(&name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        info!("claim {ns}/{name} bound to account {selected_name}");
        return Ok(Action::requeue(Duration::from_secs(5)));
    }

    let account = match accounts.get(&claim.spec.accountLink).await {
        Ok(account) => account,
        Err(kube::Error::Api(e)) if e.code == 404 => {
            warn!("claim {name}: linked account {} is gone", claim.spec.accountLink);
            return Ok(Action::requeue(Duration::from_secs(30)));
        }
        Err(e) => return Err(e.into()),
    };

    if !claim.spec.manualSTS && claim.spec.supportRoleARN.is_empty() {
        let arn = assume::role_arn(&account.spec.awsAccountID, &support_role_name(&account));
        let patch = json!({ "spec": { "supportRoleARN": arn } });
        claims
            .patch(&name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
    }

    if claim.spec.accountOU.is_empty() || claim.spec.accountOU == "ROOT" {
        ensure_account_in_ou(&ctx, &account).await?;
    }

    if !account.is_ready() {
        debug!("claim {name}: account {} not Ready yet", account.name_any());
        return Ok(Action::requeue(Duration::from_secs(30)));
    }

    let default_pool_claim = claim.spec.accountPool.is_empty();
    match &claim.spec.fleetManager {
        Some(fm) if !fm.trustedARN.is_empty() && !default_pool_claim => {
            grant_fleet_manager_access(&ctx, &claim, &account, fm).await?;
        }
        _ => {
            publish_tenant_credentials(&ctx, &claim, &account).await?;
        }
    }

    set_claim_state(&ctx, &claim, ClaimState::Ready).await?;
    info!("claim {ns}/{name} is Ready");
    Ok(requeue_normal_with_jitter())
}

/// Atomically take the account: refetch, verify it is still free, and write
/// the claim link with the fetched resource version. A concurrent taker
/// loses with a conflict and this claim requeues.
///
/// Selection only yields Ready accounts, so `claimed` must flip in the same
/// bind step; deferring it to a later reconcile would leave a window where
/// the account is Ready and linked but not claimed.
async fn bind_account(ctx: &Context, claim: &AccountClaim, account_name: &str) -> Result<()> {
    let accounts: Api<CloudAccount> =
        Api::namespaced(ctx.client.clone(), &ctx.config.operator_namespace);
    let mut account = accounts.get(account_name).await?;
    if !account.spec.claimLink.is_empty() {
        return Err(Error::NoSuitableAccount(format!(
            "{account_name} was claimed concurrently"
        )));
    }
    account.spec.claimLink = claim.name_any();
    account.spec.claimLinkNamespace = claim.namespace().unwrap_or_default();
    account.spec.legalEntity = claim.spec.legalEntity.clone();
    accounts
        .replace(account_name, &PostParams::default(), &account)
        .await?;

    let patch = json!({ "status": { "claimed": true } });
    accounts
        .patch_status(account_name, &PatchParams::default(), &Patch::Merge(patch))
        .await?;
    Ok(())
}

/// Copy (or mint) the credentials the tenant consumes.
pub(crate) async fn publish_tenant_credentials(
    ctx: &Context,
    claim: &AccountClaim,
    account: &CloudAccount,
) -> Result<()> {
    let (secret_name, secret_ns) = tenant_secret_target(claim);
    if claim.spec.manualSTS {
        if account.spec.supportRoleARN.is_empty() {
            return Err(Error::MissingSecretError(format!(
                "account {} has no support role yet",
                account.name_any()
            )));
        }
        publish_sts_secret(
            ctx.client.clone(),
            &secret_name,
            &secret_ns,
            &claim.name_any(),
            &account.spec.supportRoleARN,
        )
        .await
    } else {
        copy_secret_to_namespace(
            ctx.client.clone(),
            &account_secret_name(&account.name_any()),
            &ctx.config.operator_namespace,
            &secret_name,
            &secret_ns,
            &claim.name_any(),
        )
        .await
    }
}

/// Park the account under the configured organizational unit, creating the
/// OU on first use.
async fn ensure_account_in_ou(ctx: &Context, account: &CloudAccount) -> Result<()> {
    if ctx.config.account_base_ou.is_empty() || account.spec.awsAccountID.is_empty() {
        return Ok(());
    }
    let aws = ctx.operator_aws().await?;
    let root_id = aws.organization_root_id().await?;
    let ou_id = aws
        .ensure_organizational_unit(&root_id, &ctx.config.account_base_ou)
        .await?;
    let already_there = aws
        .list_child_accounts(&ou_id)
        .await?
        .contains(&account.spec.awsAccountID);
    if already_there {
        return Ok(());
    }
    aws.move_account(&account.spec.awsAccountID, &root_id, &ou_id)
        .await?;
    info!(
        "moved account {} into OU {}",
        account.spec.awsAccountID, ctx.config.account_base_ou
    );
    Ok(())
}

/// Fixed delegation policy: the fleet manager may only assume roles inside
/// this one account.
fn fleet_manager_inline_policy(account_id: &str) -> PolicyDocument {
    PolicyDocument::new(vec![PolicyStatement {
        effect: "Allow".to_string(),
        action: vec!["sts:AssumeRole".to_string()],
        resource: Some(vec![format!(
            "{}:iam::{}:role/*",
            config::partition_prefix(),
            account_id
        )]),
        principal: None,
        condition: None,
    }])
}

/// Replace long-lived credentials with a role the fleet manager's principal
/// can assume. The account is already bound to this claim, so no concurrent
/// claim can observe the window where the user is gone.
async fn grant_fleet_manager_access(
    ctx: &Context,
    claim: &AccountClaim,
    account: &CloudAccount,
    fm: &FleetManagerConfig,
) -> Result<()> {
    let aws = ctx
        .account_aws(account, config::default_region(), None)
        .await?;

    aws.delete_user(ADMIN_USER).await?;

    let role_name = format!("FleetAccess-{}", account_short_uid(account));
    let trust = assume_role_trust_policy(std::slice::from_ref(&fm.trustedARN));
    let role_arn = match aws
        .create_role(&role_name, &trust, "Fleet manager delegation")
        .await
    {
        Ok(role) => role.arn().to_string(),
        Err(e) if e.code() == "EntityAlreadyExists" => {
            aws.get_role(&role_name).await?.arn().to_string()
        }
        Err(e) => return Err(e.into()),
    };
    aws.put_role_policy(
        &role_name,
        "fleet-access-scope",
        &fleet_manager_inline_policy(&account.spec.awsAccountID),
    )
    .await?;

    let (secret_name, secret_ns) = tenant_secret_target(claim);
    publish_sts_secret(
        ctx.client.clone(),
        &secret_name,
        &secret_ns,
        &claim.name_any(),
        &role_arn,
    )
    .await
}

async fn handle_fake(claim: &AccountClaim, ctx: &Context) -> Result<Action> {
    let (secret_name, secret_ns) = tenant_secret_target(claim);
    publish_fake_secret(
        ctx.client.clone(),
        &secret_name,
        &secret_ns,
        &claim.name_any(),
    )
    .await?;
    set_claim_state(ctx, claim, ClaimState::Ready).await?;
    debug!("fake claim {} satisfied", claim.name_any());
    Ok(Action::await_change())
}

async fn handle_delete(claim: Arc<AccountClaim>, ctx: Arc<Context>) -> Result<Action> {
    let name = claim.name_any();

    // Foreign finalizers mean another controller is orchestrating this
    // deletion; our cleanup must not interfere.
    let foreign = claim
        .finalizers()
        .iter()
        .any(|f| f != CLAIM_FINALIZER);
    if foreign {
        info!("claim {name}: other finalizers present, skipping cleanup");
        return Ok(Action::await_change());
    }

    let (secret_name, secret_ns) = tenant_secret_target(&claim);

    if is_fake(&claim) {
        delete_secret(ctx.client.clone(), &secret_name, &secret_ns).await?;
        return Ok(Action::await_change());
    }

    if claim.spec.accountLink.is_empty() {
        delete_secret(ctx.client.clone(), &secret_name, &secret_ns).await?;
        return Ok(Action::await_change());
    }

    let accounts: Api<CloudAccount> =
        Api::namespaced(ctx.client.clone(), &ctx.config.operator_namespace);
    let account = match accounts.get(&claim.spec.accountLink).await {
        Ok(account) => account,
        Err(kube::Error::Api(e)) if e.code == 404 => {
            delete_secret(ctx.client.clone(), &secret_name, &secret_ns).await?;
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e.into()),
    };

    // BYO and externally-managed accounts are deleted outright; their
    // cleanup must never block claim deletion.
    if account.spec.byo || account.spec.manualSTS {
        if let Err(e) = accounts
            .delete(&account.name_any(), &Default::default())
            .await
        {
            warn!("claim {name}: deleting account failed: {e}");
        }
        delete_secret(ctx.client.clone(), &secret_name, &secret_ns).await?;
        return Ok(Action::await_change());
    }

    match cleanup::scrub_account(&claim, &account, &ctx).await {
        Ok(()) => {
            cleanup::reset_account_for_reuse(&ctx, &account.name_any()).await?;
            delete_secret(ctx.client.clone(), &secret_name, &secret_ns).await?;
            info!("claim {name}: account {} returned to pool", account.name_any());
            Ok(Action::await_change())
        }
        Err(e) => {
            cleanup::mark_account_reuse_failed(&ctx, &account).await?;
            // Propagating keeps the finalizer for another attempt.
            Err(e)
        }
    }
}

pub(crate) async fn set_claim_state(
    ctx: &Context,
    claim: &AccountClaim,
    state: ClaimState,
) -> Result<()> {
    let reason = format!("ClaimState{state}");
    set_claim_state_with_condition(
        ctx,
        claim,
        state.clone(),
        &state.to_string(),
        CONDITION_TRUE,
        &reason,
        "",
    )
    .await
}

#[allow(clippy::too_many_arguments)]
pub(crate) async fn set_claim_state_with_condition(
    ctx: &Context,
    claim: &AccountClaim,
    state: ClaimState,
    condition_type: &str,
    condition_status: &str,
    reason: &str,
    message: &str,
) -> Result<()> {
    let ns = claim.namespace().unwrap();
    let claims: Api<AccountClaim> = Api::namespaced(ctx.client.clone(), &ns);
    let mut status = claim.status.clone().unwrap_or_default();
    conditions::set_condition(
        &mut status.conditions,
        condition_type,
        condition_status,
        reason,
        message,
    );
    status.state = state;
    let patch = json!({
        "apiVersion": "awsfleet.io/v1alpha1",
        "kind": "AccountClaim",
        "status": status
    });
    claims
        .patch_status(&claim.name_any(), &PatchParams::default(), &Patch::Merge(patch))
        .await?;
    Ok(())
}

/// Global claim census for the exposition endpoint.
async fn update_claim_census(ctx: &Context) {
    let claims: Api<AccountClaim> = Api::all(ctx.client.clone());
    let Ok(list) = claims.list(&ListParams::default()).await else {
        return;
    };
    let mut counts: BTreeMap<String, i64> = BTreeMap::new();
    for claim in &list.items {
        *counts.entry(claim.state().to_string()).or_default() += 1;
    }
    for (state, count) in counts {
        ctx.metrics
            .claim_crs
            .with_label_values(&[&state])
            .set(count);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::apis::claim_types::{AccountClaimSpec, SecretRef};

    #[test]
    fn fake_annotation_requires_true_value() {
        let mut claim = AccountClaim::new("c1", AccountClaimSpec::default());
        assert!(!is_fake(&claim));
        claim.metadata.annotations = Some(
            [(FAKE_ANNOTATION.to_string(), "true".to_string())]
                .into_iter()
                .collect(),
        );
        assert!(is_fake(&claim));
        claim.metadata.annotations = Some(
            [(FAKE_ANNOTATION.to_string(), "false".to_string())]
                .into_iter()
                .collect(),
        );
        assert!(!is_fake(&claim));
    }

    #[test]
    fn tenant_secret_defaults_to_claim_namespace() {
        let mut claim = AccountClaim::new("c1", AccountClaimSpec::default());
        claim.metadata.namespace = Some("tenant-ns".to_string());
        let (name, ns) = tenant_secret_target(&claim);
        assert_eq!(name, "c1-aws-credentials");
        assert_eq!(ns, "tenant-ns");

        claim.spec.awsCredentialSecret = SecretRef {
            name: "my-creds".to_string(),
            namespace: "elsewhere".to_string(),
        };
        let (name, ns) = tenant_secret_target(&claim);
        assert_eq!(name, "my-creds");
        assert_eq!(ns, "elsewhere");
    }

    #[tokio::test]
    async fn new_claims_without_finalizers_gets_a_finalizer() {
        let (testctx, fakeserver) = Context::test();
        let claim = AccountClaim::test();
        // verify that the claim gets a finalizer attached during reconcile
        let scenario = crate::fixtures::Scenario::ClaimFinalizerCreation(claim.clone());
        let handle = fakeserver.run(scenario);
        let res = reconcile(Arc::new(claim), testctx).await;
        assert!(res.is_ok(), "initial creation succeeds in adding finalizer");
        crate::fixtures::timeout_after_1s(handle).await;
    }

    #[tokio::test]
    async fn no_suitable_account_requeues_quickly() {
        let (testctx, _fakeserver) = Context::test();
        let claim = AccountClaim::test();
        let error = Error::NoSuitableAccount("testclaim".to_string());
        let action = error_policy(Arc::new(claim), &error, testctx);
        let action_str = format!("{:?}", action);
        let re = regex::Regex::new(r"requeue_after: Some\((\d+)s\)").unwrap();
        let captures = re.captures(&action_str).expect("requeue action");
        assert_eq!(captures[1].parse::<u64>().unwrap(), 30);
    }

    #[test]
    fn fleet_manager_policy_is_scoped_to_the_account() {
        crate::config::set_fedramp(false);
        let doc = fleet_manager_inline_policy("123456789012");
        let json: serde_json::Value =
            serde_json::from_str(&doc.marshal().unwrap()).unwrap();
        assert_eq!(
            json["Statement"][0]["Resource"][0],
            "arn:aws:iam::123456789012:role/*"
        );
        assert_eq!(json["Statement"][0]["Action"][0], "sts:AssumeRole");
    }
}
