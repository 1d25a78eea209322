//! Helper methods only available for tests
use crate::{
    apis::{
        claim_types::{AccountClaim, AccountClaimSpec, AccountClaimStatus},
        cloudaccount_types::{CloudAccount, CloudAccountSpec, CloudAccountStatus},
    },
    aws::AwsClientBuilder,
    claim::CLAIM_FINALIZER,
    config::Config,
    watchers::TotalAccountWatcher,
    Context, Metrics,
};
use assert_json_diff::assert_json_include;
use http::{Request, Response};
use hyper::Body;
use kube::{Client, Resource, ResourceExt};
use std::sync::Arc;
use tokio::task::JoinHandle;

impl CloudAccount {
    /// A normal test CloudAccount
    pub fn test() -> Self {
        let mut a = CloudAccount::new("testaccount", CloudAccountSpec::default());
        a.meta_mut().namespace = Some("account-operator".into());
        a.meta_mut().uid = Some("752d59ef-2671-4890-9feb-0097459b18c8".into());
        a
    }

    /// Modify an account to have an expected status
    pub fn with_status(mut self, status: CloudAccountStatus) -> Self {
        self.status = Some(status);
        self
    }
}

impl AccountClaim {
    /// A normal test AccountClaim
    pub fn test() -> Self {
        let mut c = AccountClaim::new("testclaim", AccountClaimSpec::default());
        c.meta_mut().namespace = Some("testns".into());
        c.meta_mut().uid = Some("41febad4-2b26-40f8-aa71-ae869a52aab7".into());
        c
    }

    /// Modify a claim to have the expected finalizer
    pub fn finalized(mut self) -> Self {
        self.finalizers_mut().push(CLAIM_FINALIZER.to_string());
        self
    }

    /// Modify a claim to have an expected status
    pub fn with_status(mut self, status: AccountClaimStatus) -> Self {
        self.status = Some(status);
        self
    }
}

type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;
pub struct ApiServerVerifier(ApiServerHandle);

/// Scenarios we test for in ApiServerVerifier
pub enum Scenario {
    /// claims without finalizers will get a finalizer applied (and not call the apply loop)
    ClaimFinalizerCreation(AccountClaim),
    /// no API requests are expected at all
    RadioSilence,
}

pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
    tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .expect("timeout on mock apiserver")
        .expect("scenario succeeded")
}

/// Create a responder + verifier object that deals with the main reconcile scenarios
///
/// NB: If the controller is making more calls than we are handling in the scenario,
/// you then typically see a `KubeError(Service(Closed(())))` from the reconciler.
///
/// You should await the `JoinHandle` (with a timeout) from this function to ensure that the
/// scenario runs to completion (i.e. all expected calls were responded to),
/// using the timeout to catch missing api calls to Kubernetes.
impl ApiServerVerifier {
    pub fn run(self, scenario: Scenario) -> JoinHandle<()> {
        tokio::spawn(async move {
            // moving self => one scenario per test
            match scenario {
                Scenario::ClaimFinalizerCreation(claim) => {
                    self.handle_claim_census()
                        .await
                        .unwrap()
                        .handle_claim_finalizer_creation(claim)
                        .await
                }
                Scenario::RadioSilence => Ok(self),
            }
            .expect("scenario completed without errors");
        })
    }

    /// The claim reconciler always refreshes the census first with a
    /// cluster-wide list.
    async fn handle_claim_census(mut self) -> Result<Self, kube::Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::GET);
        assert!(request
            .uri()
            .to_string()
            .starts_with("/apis/awsfleet.io/v1alpha1/accountclaims"));
        let response = serde_json::json!({
            "apiVersion": "awsfleet.io/v1alpha1",
            "kind": "AccountClaimList",
            "metadata": {},
            "items": []
        });
        send.send_response(
            Response::builder()
                .body(Body::from(serde_json::to_vec(&response).unwrap()))
                .unwrap(),
        );
        Ok(self)
    }

    async fn handle_claim_finalizer_creation(
        mut self,
        claim: AccountClaim,
    ) -> Result<Self, kube::Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        // We expect a json patch to the specified claim adding our finalizer
        assert_eq!(request.method(), http::Method::PATCH);
        assert_eq!(
            request.uri().to_string(),
            format!(
                "/apis/awsfleet.io/v1alpha1/namespaces/testns/accountclaims/{}?",
                claim.name_any()
            )
        );
        let expected_patch = serde_json::json!([
            { "op": "test", "path": "/metadata/finalizers", "value": null },
            { "op": "add", "path": "/metadata/finalizers", "value": vec![CLAIM_FINALIZER] }
        ]);
        let req_body = hyper::body::to_bytes(request.into_body()).await.unwrap();
        let runtime_patch: serde_json::Value =
            serde_json::from_slice(&req_body).expect("valid document from runtime");
        assert_json_include!(actual: runtime_patch, expected: expected_patch);

        let response = serde_json::to_vec(&claim.finalized()).unwrap();
        send.send_response(Response::builder().body(Body::from(response)).unwrap());
        Ok(self)
    }
}

impl Context {
    // Create a test context with a mocked kube client, locally registered
    // metrics, a primed budget guard and default diagnostics
    pub fn test() -> (Arc<Self>, ApiServerVerifier) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let mock_client = Client::new(mock_service, "default");
        let total_accounts = TotalAccountWatcher::new();
        total_accounts.set_for_test(true, 10);
        let ctx = Self {
            client: mock_client.clone(),
            metrics: Metrics::default(),
            diagnostics: Arc::default(),
            aws_builder: AwsClientBuilder::new(mock_client),
            config: Config::default(),
            total_accounts,
        };
        (Arc::new(ctx), ApiServerVerifier(handle))
    }
}
