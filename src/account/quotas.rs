//! Service-quota sub-protocol: drive every (region, quota code) pair
//! towards its desired value without ever blocking the outer account state.
//!
//! Desired values come from two places: the per-pool table stamped onto the
//! account spec, and the operator-wide `quota.<name>` config keys, which
//! fill in every initialized region the spec is silent about.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ResourceExt;
use tracing::{debug, info};

use crate::{
    apis::cloudaccount_types::{CloudAccount, ServiceQuotaState, ServiceQuotaStatus},
    aws::quotas::QuotaRequestHistory,
    configmap,
    controller::Context,
    Result,
};

use super::{patch_account_status, regions};

/// All pool quota codes belong to the compute service.
const QUOTA_SERVICE_CODE: &str = "ec2";

/// Quota code behind the running on-demand instance vCPU cap.
const VCPU_QUOTA_CODE: &str = "L-1216C47A";

/// `quota.<name>` config keys and the quota codes they drive.
const QUOTA_CODES_BY_NAME: &[(&str, &str)] = &[("vcpu", VCPU_QUOTA_CODE)];

/// Whether any desired quota has not reached a terminal state yet. Looks at
/// both the spec'd entries and everything already observed in status, so
/// config-derived requests keep getting nudged after Ready too.
pub fn has_open_quota_requests(account: &CloudAccount) -> bool {
    let status = account.status.as_ref();
    let spec_open = account
        .spec
        .regionalServiceQuotas
        .iter()
        .flat_map(|(region, quotas)| quotas.keys().map(move |code| (region, code)))
        .any(|(region, code)| {
            let observed = status
                .and_then(|s| s.regionalServiceQuotas.get(region))
                .and_then(|m| m.get(code));
            !matches!(
                observed.map(|o| o.status),
                Some(ServiceQuotaState::Completed) | Some(ServiceQuotaState::Denied)
            )
        });
    let status_open = status
        .map(|s| {
            s.regionalServiceQuotas.values().any(|quotas| {
                quotas.values().any(|o| {
                    !matches!(
                        o.status,
                        ServiceQuotaState::Completed | ServiceQuotaState::Denied
                    )
                })
            })
        })
        .unwrap_or(false);
    spec_open || status_open
}

/// Merge the per-pool spec quotas with the operator-wide `quota.<name>`
/// values. The spec wins where both name a (region, code) pair; config
/// values apply to every region this account initializes.
fn merged_desired_quotas(
    account: &CloudAccount,
    cm: &ConfigMap,
) -> BTreeMap<String, BTreeMap<String, u32>> {
    let mut desired = account.spec.regionalServiceQuotas.clone();
    for (name, code) in QUOTA_CODES_BY_NAME {
        let Some(value) = configmap::quota_value(cm, name) else {
            continue;
        };
        let value = value as u32;
        for region in regions::init_regions(account) {
            desired
                .entry(region)
                .or_default()
                .entry(code.to_string())
                .or_insert(value);
        }
    }
    desired
}

/// One pass over every non-terminal quota entry.
///
/// Completed is monotone: a terminal observation is never revisited, even if
/// the provider later reports a lower applied value.
pub async fn reconcile_service_quotas(account: &CloudAccount, ctx: &Context) -> Result<()> {
    let cm =
        configmap::get_operator_configmap(ctx.client.clone(), &ctx.config.operator_namespace)
            .await?;
    let desired_quotas = merged_desired_quotas(account, &cm);
    if desired_quotas.is_empty() {
        return Ok(());
    }
    let mut status = account.status.clone().unwrap_or_default();
    let mut changed = false;

    for (region, quotas) in &desired_quotas {
        let aws = ctx.account_aws(account, region, None).await?;
        for (code, desired) in quotas {
            let observed = status
                .regionalServiceQuotas
                .get(region)
                .and_then(|m| m.get(code))
                .cloned()
                .unwrap_or(ServiceQuotaStatus {
                    value: *desired,
                    status: ServiceQuotaState::Todo,
                });
            if matches!(
                observed.status,
                ServiceQuotaState::Completed | ServiceQuotaState::Denied
            ) {
                continue;
            }

            let desired_value = *desired as f64;
            let applied = match aws.get_service_quota(QUOTA_SERVICE_CODE, code).await {
                Ok(value) => value,
                Err(e) if e.is_not_found() => 0.0,
                Err(e) => return Err(e.into()),
            };

            let next = if applied >= desired_value {
                ServiceQuotaState::Completed
            } else {
                match aws
                    .quota_request_history(QUOTA_SERVICE_CODE, code, desired_value)
                    .await?
                {
                    QuotaRequestHistory::Approved => ServiceQuotaState::Completed,
                    QuotaRequestHistory::Pending => ServiceQuotaState::InProgress,
                    QuotaRequestHistory::Denied => {
                        info!(
                            "account {}: quota increase {code} in {region} denied",
                            account.name_any()
                        );
                        ServiceQuotaState::Denied
                    }
                    QuotaRequestHistory::None => {
                        aws.request_service_quota_increase(
                            QUOTA_SERVICE_CODE,
                            code,
                            desired_value,
                        )
                        .await?;
                        debug!(
                            "account {}: requested {code}={desired} in {region}",
                            account.name_any()
                        );
                        ServiceQuotaState::InProgress
                    }
                }
            };

            if next != observed.status {
                status
                    .regionalServiceQuotas
                    .entry(region.clone())
                    .or_default()
                    .insert(
                        code.clone(),
                        ServiceQuotaStatus {
                            value: *desired,
                            status: next,
                        },
                    );
                changed = true;
            }
        }
    }

    if changed {
        patch_account_status(ctx, &account.name_any(), &status).await?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::apis::cloudaccount_types::{CloudAccountSpec, CloudAccountStatus};
    use std::collections::BTreeMap;

    fn account_with_quota(observed: Option<ServiceQuotaState>) -> CloudAccount {
        let mut account = CloudAccount::new(
            "a1",
            CloudAccountSpec {
                regionalServiceQuotas: BTreeMap::from([(
                    "us-east-1".to_string(),
                    BTreeMap::from([("L-1216C47A".to_string(), 750)]),
                )]),
                ..CloudAccountSpec::default()
            },
        );
        if let Some(state) = observed {
            account.status = Some(CloudAccountStatus {
                regionalServiceQuotas: BTreeMap::from([(
                    "us-east-1".to_string(),
                    BTreeMap::from([(
                        "L-1216C47A".to_string(),
                        ServiceQuotaStatus {
                            value: 750,
                            status: state,
                        },
                    )]),
                )]),
                ..CloudAccountStatus::default()
            });
        }
        account
    }

    #[test]
    fn unobserved_quotas_count_as_open() {
        assert!(has_open_quota_requests(&account_with_quota(None)));
        assert!(has_open_quota_requests(&account_with_quota(Some(
            ServiceQuotaState::InProgress
        ))));
    }

    #[test]
    fn terminal_quotas_are_closed() {
        assert!(!has_open_quota_requests(&account_with_quota(Some(
            ServiceQuotaState::Completed
        ))));
        assert!(!has_open_quota_requests(&account_with_quota(Some(
            ServiceQuotaState::Denied
        ))));
    }

    #[test]
    fn config_derived_quotas_in_status_count_as_open() {
        // No spec quotas at all, but a non-terminal entry landed in status
        // from the operator-wide config values.
        let mut account = CloudAccount::new("a1", CloudAccountSpec::default());
        account.status = Some(CloudAccountStatus {
            regionalServiceQuotas: BTreeMap::from([(
                "us-east-1".to_string(),
                BTreeMap::from([(
                    VCPU_QUOTA_CODE.to_string(),
                    ServiceQuotaStatus {
                        value: 32,
                        status: ServiceQuotaState::InProgress,
                    },
                )]),
            )]),
            ..CloudAccountStatus::default()
        });
        assert!(has_open_quota_requests(&account));
    }

    fn cm_with_quota(name: &str, value: &str) -> ConfigMap {
        ConfigMap {
            data: Some(BTreeMap::from([(
                format!("quota.{name}"),
                value.to_string(),
            )])),
            ..ConfigMap::default()
        }
    }

    #[test]
    fn operator_wide_quota_fills_silent_regions() {
        crate::config::set_fedramp(false);
        let account = CloudAccount::new("a1", CloudAccountSpec::default());
        let merged = merged_desired_quotas(&account, &cm_with_quota("vcpu", "32"));
        assert_eq!(merged["us-east-1"][VCPU_QUOTA_CODE], 32);
    }

    #[test]
    fn spec_quota_wins_over_operator_wide_value() {
        let account = account_with_quota(None);
        let merged = merged_desired_quotas(&account, &cm_with_quota("vcpu", "32"));
        // The spec'd code keeps its per-pool value...
        assert_eq!(merged["us-east-1"]["L-1216C47A"], 750);
        // ...and no extra region shows up beyond the ones being initialized.
        assert_eq!(merged.len(), 1);
    }
}
