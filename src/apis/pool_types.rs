use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::defaults;

/// Generate the Kubernetes wrapper struct `AccountPool` from our Spec and Status struct
///
/// This provides a hook for generating the CRD yaml (in crdgen.rs)
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(kind = "AccountPool", group = "awsfleet.io", version = "v1alpha1", namespaced)]
#[kube(status = "AccountPoolStatus", shortname = "apool")]
#[allow(non_snake_case)]
pub struct AccountPoolSpec {
    /// Desired number of unclaimed Ready accounts.
    #[serde(default = "defaults::default_pool_size")]
    pub poolSize: i32,
}

/// The status object of `AccountPool`
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[allow(non_snake_case)]
pub struct AccountPoolStatus {
    #[serde(default)]
    pub poolSize: i32,
    #[serde(default)]
    pub unclaimedAccounts: i32,
    #[serde(default)]
    pub claimedAccounts: i32,
    /// Ready and unclaimed.
    #[serde(default)]
    pub availableAccounts: i32,
    #[serde(default)]
    pub accountsProgressing: i32,
    /// Headroom against the organization account limit.
    #[serde(default)]
    pub awsLimitDelta: i32,
}
