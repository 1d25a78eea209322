use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::apis::{cloudaccount_types::LegalEntity, conditions::Condition};

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
pub struct SecretRef {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

/// When present, the operator additionally provisions a role in the target
/// account assumable by the named external principal instead of long-lived
/// user credentials.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[allow(non_snake_case)]
pub struct FleetManagerConfig {
    #[serde(default)]
    pub trustedARN: String,
}

/// Generate the Kubernetes wrapper struct `AccountClaim` from our Spec and Status struct
///
/// This provides a hook for generating the CRD yaml (in crdgen.rs)
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(kind = "AccountClaim", group = "awsfleet.io", version = "v1alpha1", namespaced)]
#[kube(status = "AccountClaimStatus", shortname = "claim")]
#[allow(non_snake_case)]
pub struct AccountClaimSpec {
    /// Name of the bound CloudAccount; empty until bound.
    #[serde(default)]
    pub accountLink: String,

    /// Where the tenant-facing credentials secret is published.
    #[serde(default)]
    pub awsCredentialSecret: SecretRef,

    #[serde(default)]
    pub byo: bool,

    #[serde(default)]
    pub byoAWSAccountID: String,

    /// Credentials for onboarding a BYO account.
    #[serde(default)]
    pub byoSecretRef: SecretRef,

    #[serde(default)]
    pub manualSTS: bool,

    #[serde(default)]
    pub supportRoleARN: String,

    #[serde(default)]
    pub legalEntity: LegalEntity,

    /// Regions the tenant wants warmed up.
    #[serde(default)]
    pub regions: Vec<String>,

    /// Desired organizational-unit path. Empty or "ROOT" means the operator
    /// places the account into its configured OU subtree.
    #[serde(default)]
    pub accountOU: String,

    /// Pool to claim from. Empty means the default pool.
    #[serde(default)]
    pub accountPool: String,

    pub fleetManager: Option<FleetManagerConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum ClaimState {
    #[default]
    #[serde(rename = "")]
    Unset,
    Pending,
    Ready,
    Error,
}

impl std::fmt::Display for ClaimState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ClaimState::Unset => "",
            ClaimState::Pending => "Pending",
            ClaimState::Ready => "Ready",
            ClaimState::Error => "Error",
        };
        f.write_str(s)
    }
}

/// The status object of `AccountClaim`
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
pub struct AccountClaimStatus {
    #[serde(default)]
    pub state: ClaimState,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl AccountClaim {
    pub fn state(&self) -> ClaimState {
        self.status
            .as_ref()
            .map(|s| s.state.clone())
            .unwrap_or_default()
    }

    pub fn is_bound(&self) -> bool {
        !self.spec.accountLink.is_empty()
    }

    /// BYO claims must name the pre-existing account and the secret holding
    /// its credentials.
    pub fn validate_byo(&self) -> Result<(), String> {
        if self.spec.byoAWSAccountID.is_empty() {
            return Err("missing BYO account ID".to_string());
        }
        if self.spec.byoSecretRef.name.is_empty() || self.spec.byoSecretRef.namespace.is_empty() {
            return Err("missing BYO credential secret reference".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn byo_validation_rejects_incomplete_specs() {
        let mut claim = AccountClaim::new("c1", AccountClaimSpec::default());
        claim.spec.byo = true;
        assert!(claim.validate_byo().is_err());

        claim.spec.byoAWSAccountID = "123456789012".to_string();
        assert!(claim.validate_byo().is_err());

        claim.spec.byoSecretRef = SecretRef {
            name: "byo-creds".to_string(),
            namespace: "tenant-ns".to_string(),
        };
        assert!(claim.validate_byo().is_ok());
    }

    #[test]
    fn claim_state_round_trips_empty_initial_variant() {
        let parsed: ClaimState = serde_json::from_str("\"\"").unwrap();
        assert_eq!(parsed, ClaimState::Unset);
        assert_eq!(serde_json::to_string(&ClaimState::Ready).unwrap(), "\"Ready\"");
    }
}
