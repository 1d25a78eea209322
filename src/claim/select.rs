//! CloudAccount selection for an incoming claim.
//!
//! Candidates come in two flavours: scrubbed (`reused`) accounts, which may
//! only go back to the legal entity they served before, and fresh accounts,
//! which anyone may take. Iteration order of the store is not part of the
//! contract; only the reuse preference is.

use crate::apis::{claim_types::AccountClaim, cloudaccount_types::CloudAccount};

fn owned_by_pool(account: &CloudAccount) -> bool {
    account
        .metadata
        .owner_references
        .as_ref()
        .map(|refs| refs.iter().any(|r| r.kind == "AccountPool"))
        .unwrap_or(false)
}

/// Pick an account for `claim` out of `accounts`.
///
/// `default_pool` names the pool used when the claim does not specify one.
pub fn select_account<'a>(
    claim: &AccountClaim,
    accounts: &'a [CloudAccount],
    default_pool: &str,
) -> Option<&'a CloudAccount> {
    let target_pool = if claim.spec.accountPool.is_empty() {
        default_pool
    } else {
        claim.spec.accountPool.as_str()
    };
    let target_is_default = target_pool == default_pool;

    let candidates: Vec<&CloudAccount> = accounts
        .iter()
        .filter(|a| owned_by_pool(a))
        .filter(|a| a.belongs_to_pool(target_pool, target_is_default))
        .filter(|a| a.is_unclaimed_and_ready())
        .collect();

    // Warm reuse: a scrubbed account that served this legal entity before.
    let legal_id = &claim.spec.legalEntity.id;
    if !legal_id.is_empty() {
        if let Some(reused) = candidates
            .iter()
            .find(|a| a.is_reused() && &a.spec.legalEntity.id == legal_id)
        {
            return Some(reused);
        }
    }

    // Otherwise any fresh candidate; reused accounts stay reserved for
    // their legal entity.
    candidates.into_iter().find(|a| !a.is_reused())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::apis::{
        claim_types::AccountClaimSpec,
        cloudaccount_types::{
            AccountState, CloudAccountSpec, CloudAccountStatus, LegalEntity,
        },
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use kube::api::ResourceExt;
    use rand::seq::SliceRandom;

    fn pool_owner_ref() -> OwnerReference {
        OwnerReference {
            api_version: "awsfleet.io/v1alpha1".to_string(),
            kind: "AccountPool".to_string(),
            name: "default-pool".to_string(),
            uid: "uid".to_string(),
            ..OwnerReference::default()
        }
    }

    fn ready_account(name: &str, pool: &str, reused: bool, legal_id: &str) -> CloudAccount {
        let mut a = CloudAccount::new(
            name,
            CloudAccountSpec {
                accountPool: pool.to_string(),
                legalEntity: LegalEntity {
                    id: legal_id.to_string(),
                    name: String::new(),
                },
                ..CloudAccountSpec::default()
            },
        );
        a.metadata.owner_references = Some(vec![pool_owner_ref()]);
        a.status = Some(CloudAccountStatus {
            state: AccountState::Ready,
            reused,
            ..CloudAccountStatus::default()
        });
        a
    }

    fn claim(pool: &str, legal_id: &str) -> AccountClaim {
        AccountClaim::new(
            "c1",
            AccountClaimSpec {
                accountPool: pool.to_string(),
                legalEntity: LegalEntity {
                    id: legal_id.to_string(),
                    name: String::new(),
                },
                ..AccountClaimSpec::default()
            },
        )
    }

    #[test]
    fn prefers_reused_account_of_same_legal_entity() {
        let accounts = vec![
            ready_account("fresh", "default-pool", false, ""),
            ready_account("warm", "default-pool", true, "org-42"),
        ];
        let picked = select_account(&claim("", "org-42"), &accounts, "default-pool").unwrap();
        assert_eq!(picked.name_any(), "warm");
    }

    #[test]
    fn reused_accounts_of_other_tenants_are_skipped() {
        let accounts = vec![
            ready_account("warm-other", "default-pool", true, "org-1"),
            ready_account("fresh", "default-pool", false, ""),
        ];
        let picked = select_account(&claim("", "org-42"), &accounts, "default-pool").unwrap();
        assert_eq!(picked.name_any(), "fresh");

        let only_foreign = vec![ready_account("warm-other", "default-pool", true, "org-1")];
        assert!(select_account(&claim("", "org-42"), &only_foreign, "default-pool").is_none());
    }

    #[test]
    fn non_default_pool_claims_only_matching_accounts() {
        let accounts = vec![
            ready_account("default-acct", "", false, ""),
            ready_account("sq-acct", "sq-pool", false, ""),
        ];
        let picked = select_account(&claim("sq-pool", ""), &accounts, "default-pool").unwrap();
        assert_eq!(picked.name_any(), "sq-acct");

        // And the default-pool claim never takes the sq-pool account.
        let picked = select_account(&claim("", ""), &accounts, "default-pool").unwrap();
        assert_eq!(picked.name_any(), "default-acct");
    }

    #[test]
    fn accounts_without_a_pool_owner_are_never_picked() {
        let mut byo = ready_account("byo", "", false, "");
        byo.metadata.owner_references = None;
        assert!(select_account(&claim("", ""), &[byo], "default-pool").is_none());
    }

    #[test]
    fn reuse_preference_holds_under_any_iteration_order() {
        let mut rng = rand::thread_rng();
        let base = vec![
            ready_account("fresh-1", "default-pool", false, ""),
            ready_account("fresh-2", "default-pool", false, ""),
            ready_account("warm", "default-pool", true, "org-42"),
            ready_account("warm-other", "default-pool", true, "org-7"),
        ];
        for _ in 0..20 {
            let mut shuffled = base.clone();
            shuffled.shuffle(&mut rng);
            let picked =
                select_account(&claim("", "org-42"), &shuffled, "default-pool").unwrap();
            assert_eq!(picked.name_any(), "warm");
        }
    }
}
