// Include the #[ignore] macro on slow tests.
// That way, 'cargo test' does not run them by default.
// To run just these tests, use 'cargo test -- --ignored'
// To run all tests, use 'cargo test -- --include-ignored'
//
// These tests assume there is already kubernetes running and you have a context configured.
// It also assumes that the CRDs and operator are already installed for this cluster.
// In this way, it can be used as a conformance test on a target, separate from installation.
//
// Claims are created with the fake annotation so no provider account is ever
// touched; the scenarios exercise the store-side contracts only.

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::Secret;
    use kube::{
        api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
        Client,
    };
    use operator::{
        apis::{
            claim_types::{AccountClaim, AccountClaimSpec, ClaimState, SecretRef},
            pool_types::{AccountPool, AccountPoolSpec},
        },
        claim::FAKE_ANNOTATION,
    };
    use rand::Rng;
    use tokio::time::{sleep, Duration};

    const OPERATOR_NAMESPACE: &str = "account-operator";

    fn rand_suffix() -> String {
        let mut rng = rand::thread_rng();
        (0..6)
            .map(|_| char::from(rng.gen_range(b'a'..=b'z')))
            .collect()
    }

    async fn wait_for_claim_state(
        claims: &Api<AccountClaim>,
        name: &str,
        state: ClaimState,
    ) -> AccountClaim {
        for _ in 0..60 {
            if let Ok(claim) = claims.get(name).await {
                if claim.status.as_ref().map(|s| s.state.clone()) == Some(state.clone()) {
                    return claim;
                }
            }
            sleep(Duration::from_secs(2)).await;
        }
        panic!("claim {name} never reached {state:?}");
    }

    #[tokio::test]
    #[ignore = "requires a cluster with the operator installed"]
    async fn functional_test_fake_claim_reaches_ready_with_secret() {
        let client = Client::try_default().await.expect("cluster context");
        let suffix = rand_suffix();
        let name = format!("fake-claim-{suffix}");
        let secret_name = format!("{name}-creds");
        let claims: Api<AccountClaim> = Api::namespaced(client.clone(), "default");
        let secrets: Api<Secret> = Api::namespaced(client.clone(), "default");

        let mut claim = AccountClaim::new(
            &name,
            AccountClaimSpec {
                awsCredentialSecret: SecretRef {
                    name: secret_name.clone(),
                    namespace: "default".to_string(),
                },
                ..AccountClaimSpec::default()
            },
        );
        claim.metadata.annotations = Some(BTreeMap::from([(
            FAKE_ANNOTATION.to_string(),
            "true".to_string(),
        )]));
        claims
            .create(&PostParams::default(), &claim)
            .await
            .expect("claim created");

        let ready = wait_for_claim_state(&claims, &name, ClaimState::Ready).await;
        assert_eq!(ready.status.unwrap().state, ClaimState::Ready);

        let secret = secrets.get(&secret_name).await.expect("tenant secret");
        let data = secret.data.expect("secret data");
        assert!(data.contains_key("aws_access_key_id"));
        assert!(data.contains_key("aws_secret_access_key"));

        // Deletion must remove the placeholder secret and release the claim.
        claims
            .delete(&name, &DeleteParams::default())
            .await
            .expect("claim deleted");
        for _ in 0..30 {
            if claims.get(&name).await.is_err() {
                break;
            }
            sleep(Duration::from_secs(2)).await;
        }
        assert!(claims.get(&name).await.is_err(), "finalizer released");
    }

    #[tokio::test]
    #[ignore = "requires a cluster with the operator installed"]
    async fn functional_test_pool_reports_status_counters() {
        let client = Client::try_default().await.expect("cluster context");
        let pools: Api<AccountPool> = Api::namespaced(client.clone(), OPERATOR_NAMESPACE);
        let suffix = rand_suffix();
        let name = format!("test-pool-{suffix}");

        // The pool must be present in the accountpool config map table for
        // the controller to accept it; this test assumes a table entry named
        // like the pool was provisioned by the test harness beforehand.
        let pool = AccountPool::new(&name, AccountPoolSpec { poolSize: 0 });
        pools
            .create(&PostParams::default(), &pool)
            .await
            .expect("pool created");

        let mut observed = None;
        for _ in 0..30 {
            if let Ok(p) = pools.get(&name).await {
                if let Some(status) = p.status {
                    observed = Some(status);
                    break;
                }
            }
            sleep(Duration::from_secs(2)).await;
        }
        let status = observed.expect("pool status written");
        assert_eq!(status.poolSize, 0);
        assert!(status.unclaimedAccounts >= 0);

        pools
            .delete(&name, &DeleteParams::default())
            .await
            .expect("pool deleted");
    }

    #[tokio::test]
    #[ignore = "requires a cluster with the operator installed"]
    async fn functional_test_claim_census_metric_exposed() {
        let client = Client::try_default().await.expect("cluster context");
        let claims: Api<AccountClaim> = Api::all(client);
        // A list must succeed for the census to work at all.
        let list = claims.list(&ListParams::default()).await.expect("list claims");
        let _ = list.items.len();

        let body = reqwest::get("http://127.0.0.1:8080/metrics")
            .await
            .expect("metrics endpoint reachable")
            .text()
            .await
            .expect("metrics body");
        assert!(body.contains("operator_account_claim_crs"));
    }

    #[tokio::test]
    #[ignore = "requires a cluster with the operator installed"]
    async fn functional_test_fake_claim_is_patchable_while_pending() {
        let client = Client::try_default().await.expect("cluster context");
        let claims: Api<AccountClaim> = Api::namespaced(client, "default");
        let suffix = rand_suffix();
        let name = format!("fake-claim-{suffix}");

        let mut claim = AccountClaim::new(&name, AccountClaimSpec::default());
        claim.metadata.annotations = Some(BTreeMap::from([(
            FAKE_ANNOTATION.to_string(),
            "true".to_string(),
        )]));
        claims
            .create(&PostParams::default(), &claim)
            .await
            .expect("claim created");

        // Spec updates while the controller works must not conflict.
        let patch = serde_json::json!({ "spec": { "accountOU": "ROOT" } });
        claims
            .patch(&name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .expect("spec patch applied");

        claims
            .delete(&name, &DeleteParams::default())
            .await
            .expect("claim deleted");
    }
}
