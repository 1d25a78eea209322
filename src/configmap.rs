use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    api::{Api, Patch, PatchParams},
    Client,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error};

use crate::{config::OPERATOR_CONFIGMAP_NAME, errors::ValueError, Error, Result};

/// Per-pool entry of the `accountpool` config-map table.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct PoolConfig {
    #[serde(default)]
    pub default: bool,
    /// region -> quota code -> desired value (stringly typed in the map)
    #[serde(default)]
    pub servicequotas: BTreeMap<String, BTreeMap<String, String>>,
}

impl PoolConfig {
    /// Convert the stringly-typed quota table into the numeric form carried
    /// on CloudAccount specs.
    pub fn regional_quotas(&self) -> Result<BTreeMap<String, BTreeMap<String, u32>>> {
        let mut out = BTreeMap::new();
        for (region, quotas) in &self.servicequotas {
            let mut per_region = BTreeMap::new();
            for (code, value) in quotas {
                let parsed = value
                    .parse::<u32>()
                    .map_err(|e| Error::ValueError(ValueError::IntError(e)))?;
                per_region.insert(code.clone(), parsed);
            }
            out.insert(region.clone(), per_region);
        }
        Ok(out)
    }
}

pub async fn get_operator_configmap(client: Client, namespace: &str) -> Result<ConfigMap> {
    let cm_api: Api<ConfigMap> = Api::namespaced(client, namespace);
    cm_api
        .get(OPERATOR_CONFIGMAP_NAME)
        .await
        .map_err(Error::KubeError)
}

pub fn read_key(cm: &ConfigMap, key: &str) -> Result<String> {
    cm.data
        .as_ref()
        .and_then(|d| d.get(key))
        .cloned()
        .ok_or_else(|| Error::MissingConfigKey(key.to_string()))
}

pub fn fedramp_enabled(cm: &ConfigMap) -> bool {
    read_key(cm, "fedramp")
        .map(|v| v.trim() == "true")
        .unwrap_or(false)
}

pub fn account_limit(cm: &ConfigMap) -> Result<i32> {
    let raw = read_key(cm, "account-limit")?;
    raw.trim()
        .parse::<i32>()
        .map_err(|e| Error::ValueError(ValueError::IntError(e)))
}

/// The full `accountpool` table: pool name -> pool config.
pub fn pool_table(cm: &ConfigMap) -> Result<BTreeMap<String, PoolConfig>> {
    let raw = read_key(cm, "accountpool")?;
    let table: BTreeMap<String, PoolConfig> = serde_yaml::from_str(&raw)?;
    Ok(table)
}

/// Look up one pool. Absence is an error: the controller must not silently
/// substitute another pool.
pub fn pool_config(cm: &ConfigMap, pool_name: &str) -> Result<PoolConfig> {
    let table = pool_table(cm)?;
    table
        .get(pool_name)
        .cloned()
        .ok_or_else(|| Error::MissingConfigKey(format!("accountpool.{pool_name}")))
}

pub fn default_pool_name(table: &BTreeMap<String, PoolConfig>) -> Option<String> {
    table
        .iter()
        .find(|(_, cfg)| cfg.default)
        .map(|(name, _)| name.clone())
}

/// `MaxConcurrentReconciles.<controller>`, defaulting to 1.
pub fn max_concurrent_reconciles(cm: &ConfigMap, controller: &str) -> i32 {
    read_key(cm, &format!("MaxConcurrentReconciles.{controller}"))
        .ok()
        .and_then(|v| v.trim().parse::<i32>().ok())
        .unwrap_or(1)
}

/// `quota.<name>` float values consumed during region initialization.
pub fn quota_value(cm: &ConfigMap, name: &str) -> Option<f64> {
    read_key(cm, &format!("quota.{name}"))
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
}

/// Merge a single key into the operator config map without clobbering the
/// rest of its data.
pub async fn write_key(client: Client, namespace: &str, key: &str, value: &str) -> Result<()> {
    let cm_api: Api<ConfigMap> = Api::namespaced(client, namespace);
    let patch = Patch::Merge(json!({ "data": { key: value } }));
    match cm_api
        .patch(OPERATOR_CONFIGMAP_NAME, &PatchParams::default(), &patch)
        .await
    {
        Ok(o) => {
            debug!("Set configmap key {} on {}", key, o.metadata.name.unwrap());
            Ok(())
        }
        Err(e) => {
            error!("Failed to set configmap key {}: {}", key, e);
            Err(Error::KubeError(e))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn cm_with(data: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..ConfigMap::default()
        }
    }

    const POOL_YAML: &str = r#"
default-pool:
  default: true
  servicequotas:
    us-east-1:
      L-1216C47A: "750"
      L-0263D0A3: "5"
sq-pool:
  servicequotas:
    eu-west-1:
      L-1216C47A: "200"
"#;

    #[test]
    fn pool_table_parses_defaults_and_quotas() {
        let cm = cm_with(&[("accountpool", POOL_YAML)]);
        let table = pool_table(&cm).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(default_pool_name(&table).as_deref(), Some("default-pool"));

        let quotas = table["default-pool"].regional_quotas().unwrap();
        assert_eq!(quotas["us-east-1"]["L-1216C47A"], 750);
        assert_eq!(quotas["us-east-1"]["L-0263D0A3"], 5);
        assert!(!table["sq-pool"].default);
    }

    #[test]
    fn missing_pool_is_an_error_not_a_fallback() {
        let cm = cm_with(&[("accountpool", POOL_YAML)]);
        let err = pool_config(&cm, "no-such-pool").unwrap_err();
        assert!(matches!(err, Error::MissingConfigKey(_)));
    }

    #[test]
    fn account_limit_parses_and_rejects_garbage() {
        let cm = cm_with(&[("account-limit", "4800")]);
        assert_eq!(account_limit(&cm).unwrap(), 4800);

        let cm = cm_with(&[("account-limit", "not-a-number")]);
        assert!(account_limit(&cm).is_err());
    }

    #[test]
    fn reconcile_concurrency_defaults_to_one() {
        let cm = cm_with(&[("MaxConcurrentReconciles.cloudaccount", "5")]);
        assert_eq!(max_concurrent_reconciles(&cm, "cloudaccount"), 5);
        assert_eq!(max_concurrent_reconciles(&cm, "accountclaim"), 1);
    }

    #[test]
    fn quota_values_parse_as_floats() {
        let cm = cm_with(&[("quota.vcpu", "32.0")]);
        assert_eq!(quota_value(&cm, "vcpu"), Some(32.0));
        assert_eq!(quota_value(&cm, "gpu"), None);
    }
}
