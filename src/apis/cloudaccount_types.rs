use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{apis::conditions::Condition, defaults};

/// The legal entity a tenant account is provisioned for. Account reuse is
/// scoped to this identity.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
pub struct LegalEntity {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// Generate the Kubernetes wrapper struct `CloudAccount` from our Spec and Status struct
///
/// This provides a hook for generating the CRD yaml (in crdgen.rs)
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(kind = "CloudAccount", group = "awsfleet.io", version = "v1alpha1", namespaced)]
#[kube(status = "CloudAccountStatus", shortname = "ca")]
#[allow(non_snake_case)]
pub struct CloudAccountSpec {
    /// Provider account ID. Immutable once set.
    #[serde(default)]
    pub awsAccountID: String,

    /// Name of the AccountClaim this account is bound to; empty when unbound.
    #[serde(default)]
    pub claimLink: String,

    #[serde(default)]
    pub claimLinkNamespace: String,

    #[serde(default)]
    pub legalEntity: LegalEntity,

    /// The provider account pre-exists and was supplied by the tenant.
    #[serde(default)]
    pub byo: bool,

    /// Identity is handled externally; the operator publishes no credentials.
    #[serde(default)]
    pub manualSTS: bool,

    /// Owning pool. Empty means the default pool.
    #[serde(default)]
    pub accountPool: String,

    /// region -> quota code -> desired value
    #[serde(default)]
    pub regionalServiceQuotas: BTreeMap<String, BTreeMap<String, u32>>,

    #[serde(default)]
    pub supportCaseID: String,

    /// ARN of the support-access role created for STS accounts.
    #[serde(default)]
    pub supportRoleARN: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum AccountState {
    #[default]
    #[serde(rename = "")]
    Unset,
    Creating,
    PendingVerification,
    InitializingRegions,
    Ready,
    Failed,
}

impl std::fmt::Display for AccountState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AccountState::Unset => "",
            AccountState::Creating => "Creating",
            AccountState::PendingVerification => "PendingVerification",
            AccountState::InitializingRegions => "InitializingRegions",
            AccountState::Ready => "Ready",
            AccountState::Failed => "Failed",
        };
        f.write_str(s)
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum ServiceQuotaState {
    #[default]
    Todo,
    InProgress,
    Completed,
    Denied,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ServiceQuotaStatus {
    pub value: u32,
    pub status: ServiceQuotaState,
}

/// The status object of `CloudAccount`
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[allow(non_snake_case)]
pub struct CloudAccountStatus {
    #[serde(default)]
    pub state: AccountState,
    #[serde(default)]
    pub claimed: bool,
    #[serde(default = "defaults::default_false")]
    pub rotateCredentials: bool,
    #[serde(default = "defaults::default_false")]
    pub rotateConsoleCredentials: bool,
    #[serde(default)]
    pub reused: bool,
    /// region -> quota code -> observed request status
    #[serde(default)]
    pub regionalServiceQuotas: BTreeMap<String, BTreeMap<String, ServiceQuotaStatus>>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl CloudAccount {
    pub fn state(&self) -> AccountState {
        self.status
            .as_ref()
            .map(|s| s.state.clone())
            .unwrap_or_default()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == AccountState::Ready
    }

    pub fn is_failed(&self) -> bool {
        self.state() == AccountState::Failed
    }

    pub fn is_claimed(&self) -> bool {
        self.status.as_ref().map(|s| s.claimed).unwrap_or(false)
    }

    pub fn is_reused(&self) -> bool {
        self.status.as_ref().map(|s| s.reused).unwrap_or(false)
    }

    pub fn is_unclaimed_and_ready(&self) -> bool {
        self.is_ready() && !self.is_claimed() && self.spec.claimLink.is_empty()
    }

    /// An account is progressing while it is neither Ready nor Failed.
    pub fn is_progressing(&self) -> bool {
        !matches!(self.state(), AccountState::Ready | AccountState::Failed)
    }

    /// Pool membership: explicit pool name match, or an empty pool name when
    /// the candidate pool is the default one.
    pub fn belongs_to_pool(&self, pool_name: &str, pool_is_default: bool) -> bool {
        if self.spec.accountPool.is_empty() {
            pool_is_default
        } else {
            self.spec.accountPool == pool_name
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn account_state_serializes_with_empty_initial_variant() {
        assert_eq!(
            serde_json::to_string(&AccountState::Unset).unwrap(),
            "\"\""
        );
        assert_eq!(
            serde_json::to_string(&AccountState::PendingVerification).unwrap(),
            "\"PendingVerification\""
        );
        let parsed: AccountState = serde_json::from_str("\"\"").unwrap();
        assert_eq!(parsed, AccountState::Unset);
    }

    #[test]
    fn pool_membership_falls_back_to_default_pool() {
        let mut account = CloudAccount::new("a1", CloudAccountSpec::default());
        assert!(account.belongs_to_pool("default-pool", true));
        assert!(!account.belongs_to_pool("sq-pool", false));

        account.spec.accountPool = "sq-pool".to_string();
        assert!(account.belongs_to_pool("sq-pool", false));
        assert!(!account.belongs_to_pool("default-pool", true));
    }

    #[test]
    fn unclaimed_and_ready_requires_empty_claim_link() {
        let mut account = CloudAccount::new("a1", CloudAccountSpec::default());
        account.status = Some(CloudAccountStatus {
            state: AccountState::Ready,
            ..CloudAccountStatus::default()
        });
        assert!(account.is_unclaimed_and_ready());

        account.spec.claimLink = "some-claim".to_string();
        assert!(!account.is_unclaimed_and_ready());
    }
}
