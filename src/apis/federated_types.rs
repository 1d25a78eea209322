use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::apis::{claim_types::SecretRef, conditions::Condition};

/// One statement of an inline policy, in entity form. Marshalled into the
/// provider's policy-document JSON dialect before any IAM call.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[allow(non_snake_case)]
pub struct StatementEntry {
    #[serde(default = "crate::defaults::default_effect")]
    pub effect: String,
    #[serde(default)]
    pub action: Vec<String>,
    #[serde(default)]
    pub resource: Vec<String>,
    /// condition operator -> key -> values
    pub condition: Option<BTreeMap<String, BTreeMap<String, Vec<String>>>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
pub struct CustomPolicy {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub statements: Vec<StatementEntry>,
}

/// Generate the Kubernetes wrapper struct `FederatedRole` from our Spec and Status struct
///
/// This provides a hook for generating the CRD yaml (in crdgen.rs)
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(kind = "FederatedRole", group = "awsfleet.io", version = "v1alpha1", namespaced)]
#[kube(status = "FederatedRoleStatus")]
#[allow(non_snake_case)]
pub struct FederatedRoleSpec {
    #[serde(default)]
    pub roleDisplayName: String,
    #[serde(default)]
    pub roleDescription: String,
    /// At most one inline policy per role.
    pub awsCustomPolicy: Option<CustomPolicy>,
    /// Managed policies referenced by name, validated against the provider.
    #[serde(default)]
    pub awsManagedPolicies: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum FederatedRoleState {
    #[default]
    #[serde(rename = "")]
    Unset,
    Valid,
    Invalid,
}

/// The status object of `FederatedRole`
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
pub struct FederatedRoleStatus {
    #[serde(default)]
    pub state: FederatedRoleState,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Generate the Kubernetes wrapper struct `FederatedAccess` from our Spec and Status struct
///
/// This provides a hook for generating the CRD yaml (in crdgen.rs)
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(kind = "FederatedAccess", group = "awsfleet.io", version = "v1alpha1", namespaced)]
#[kube(status = "FederatedAccessStatus")]
#[allow(non_snake_case)]
pub struct FederatedAccessSpec {
    /// External principal allowed to assume the realised role.
    #[serde(default)]
    pub externalCustomerAWSIAMARN: String,
    /// The FederatedRole to instantiate.
    #[serde(default)]
    pub federatedRole: SecretRef,
    /// Credentials for the target account.
    #[serde(default)]
    pub awsCustomerCredentialSecret: SecretRef,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum FederatedAccessState {
    #[default]
    #[serde(rename = "")]
    Unset,
    InProgress,
    Ready,
    Failed,
}

/// The status object of `FederatedAccess`
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[allow(non_snake_case)]
pub struct FederatedAccessStatus {
    #[serde(default)]
    pub state: FederatedAccessState,
    /// Console-switch URL for the realised role.
    #[serde(default)]
    pub consoleURL: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl FederatedAccess {
    pub fn state(&self) -> FederatedAccessState {
        self.status
            .as_ref()
            .map(|s| s.state.clone())
            .unwrap_or_default()
    }
}
