use std::{
    env,
    sync::atomic::{AtomicBool, Ordering},
};

/// `FORCE_DEV_MODE` values. "local" and "cluster" skip support-case
/// interactions; "local" additionally serves metrics on a loopback port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DevMode {
    None,
    Local,
    Cluster,
}

impl DevMode {
    fn from_env(value: &str) -> Self {
        match value {
            "local" => DevMode::Local,
            "cluster" => DevMode::Cluster,
            _ => DevMode::None,
        }
    }

    pub fn skip_support_cases(&self) -> bool {
        !matches!(self, DevMode::None)
    }

    pub fn local_metrics(&self) -> bool {
        matches!(self, DevMode::Local)
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub operator_namespace: String,
    pub dev_mode: DevMode,
    /// Organization root OU under which claimed accounts are parked.
    pub account_base_ou: String,
    /// Email domain for the root address of newly created accounts.
    pub account_email_domain: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            operator_namespace: from_env_default("OPERATOR_NAMESPACE", "account-operator"),
            dev_mode: DevMode::from_env(&from_env_default("FORCE_DEV_MODE", "")),
            account_base_ou: from_env_default("ACCOUNT_BASE_OU", ""),
            account_email_domain: from_env_default("ACCOUNT_EMAIL_DOMAIN", "example.com"),
        }
    }
}

// Source the variable from the env - use default if not set
fn from_env_default(var: &str, default: &str) -> String {
    env::var(var).unwrap_or_else(|_| default.to_owned())
}

/// Name of the operator config map in the operator namespace.
pub const OPERATOR_CONFIGMAP_NAME: &str = "account-operator-configmap";

// Set once at init from the config map; read-mostly afterwards.
static FEDRAMP: AtomicBool = AtomicBool::new(false);

pub fn set_fedramp(enabled: bool) {
    FEDRAMP.store(enabled, Ordering::SeqCst);
}

pub fn is_fedramp() -> bool {
    FEDRAMP.load(Ordering::SeqCst)
}

/// ARN partition prefix for every constructed ARN.
pub fn partition_prefix() -> &'static str {
    if is_fedramp() {
        "arn:aws-us-gov"
    } else {
        "arn:aws"
    }
}

/// Home region for organization-level calls.
pub fn default_region() -> &'static str {
    if is_fedramp() {
        "us-gov-west-1"
    } else {
        "us-east-1"
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dev_mode_parsing() {
        assert_eq!(DevMode::from_env(""), DevMode::None);
        assert_eq!(DevMode::from_env("local"), DevMode::Local);
        assert_eq!(DevMode::from_env("cluster"), DevMode::Cluster);
        assert!(DevMode::Local.skip_support_cases());
        assert!(DevMode::Cluster.skip_support_cases());
        assert!(!DevMode::None.skip_support_cases());
        assert!(!DevMode::Cluster.local_metrics());
    }
}
