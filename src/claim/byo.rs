//! Bring-your-own accounts: the tenant supplies an existing provider
//! account; the operator onboards it instead of drawing from the pool.

use kube::{
    api::{Api, Patch, PatchParams, PostParams, ResourceExt},
    runtime::controller::Action,
};
use serde_json::json;
use tokio::time::Duration;
use tracing::{info, warn};

use crate::{
    account::support_role_name,
    apis::{
        claim_types::{AccountClaim, ClaimState},
        cloudaccount_types::{CloudAccount, CloudAccountSpec},
        conditions::CONDITION_FALSE,
    },
    aws::assume,
    controller::Context,
    Result,
};

use super::{
    publish_tenant_credentials, set_claim_state, set_claim_state_with_condition,
};

pub async fn handle(claim: &AccountClaim, ctx: &Context) -> Result<Action> {
    let name = claim.name_any();
    let ns = claim.namespace().unwrap();
    let claims: Api<AccountClaim> = Api::namespaced(ctx.client.clone(), &ns);
    let accounts: Api<CloudAccount> =
        Api::namespaced(ctx.client.clone(), &ctx.config.operator_namespace);

    if claim.spec.accountLink.is_empty() {
        if let Err(reason) = claim.validate_byo() {
            warn!("BYO claim {name} invalid: {reason}");
            set_claim_state_with_condition(
                ctx,
                claim,
                ClaimState::Error,
                "Invalid",
                CONDITION_FALSE,
                "InvalidClaim",
                &reason,
            )
            .await?;
            return Ok(Action::await_change());
        }

        let account_name = format!("{name}-byo");
        let mut account = CloudAccount::new(
            &account_name,
            CloudAccountSpec {
                byo: true,
                awsAccountID: claim.spec.byoAWSAccountID.clone(),
                claimLink: name.clone(),
                claimLinkNamespace: ns.clone(),
                legalEntity: claim.spec.legalEntity.clone(),
                manualSTS: claim.spec.manualSTS,
                ..CloudAccountSpec::default()
            },
        );
        account.metadata.namespace = Some(ctx.config.operator_namespace.clone());
        match accounts.create(&PostParams::default(), &account).await {
            Ok(_) => info!("BYO claim {name}: spawned account {account_name}"),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                // Already spawned by an earlier pass.
            }
            Err(e) => return Err(e.into()),
        }

        let patch = json!({ "spec": { "accountLink": account_name } });
        claims
            .patch(&name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        set_claim_state(ctx, claim, ClaimState::Pending).await?;
        return Ok(Action::requeue(Duration::from_secs(10)));
    }

    let account = match accounts.get(&claim.spec.accountLink).await {
        Ok(account) => account,
        Err(kube::Error::Api(e)) if e.code == 404 => {
            // Race with deletion; try again later.
            return Ok(Action::requeue(Duration::from_secs(30)));
        }
        Err(e) => return Err(e.into()),
    };

    if !account.is_ready() {
        if claim.state() == ClaimState::Unset {
            set_claim_state(ctx, claim, ClaimState::Pending).await?;
        }
        return Ok(Action::requeue(Duration::from_secs(30)));
    }

    if !claim.spec.manualSTS && claim.spec.supportRoleARN.is_empty() {
        let arn = assume::role_arn(&account.spec.awsAccountID, &support_role_name(&account));
        let patch = json!({ "spec": { "supportRoleARN": arn } });
        claims
            .patch(&name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
    }

    publish_tenant_credentials(ctx, claim, &account).await?;
    set_claim_state(ctx, claim, ClaimState::Ready).await?;
    info!("BYO claim {name} is Ready");
    Ok(Action::requeue(Duration::from_secs(5 * 60)))
}
