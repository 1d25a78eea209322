use chrono::{DateTime, Utc};
use futures::stream::StreamExt;
use prometheus::Encoder;

use crate::{
    account::{self, ACCOUNT_CONTROLLER},
    apis::{
        claim_types::AccountClaim,
        cloudaccount_types::CloudAccount,
        federated_types::{FederatedAccess, FederatedRole},
        pool_types::AccountPool,
    },
    aws::{assume, AwsClientBuilder, AwsClients},
    claim::{self, CLAIM_CONTROLLER},
    config::{self, Config},
    configmap, federated_access, federated_role,
    federated_access::FEDERATED_ACCESS_CONTROLLER,
    federated_role::FEDERATED_ROLE_CONTROLLER,
    pool::{self, POOL_CONTROLLER},
    watchers::{self, TotalAccountWatcher, OPERATOR_CREDENTIALS_SECRET, TOTAL_WATCH_INTERVAL},
    Error, Metrics, Result,
};
use kube::{
    api::{Api, ListParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        events::{Recorder, Reporter},
        watcher::Config as watcherConfig,
    },
    Resource,
};
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use tokio::{
    sync::{watch, RwLock},
    time::Duration,
};
use tracing::*;

// Context for our reconcilers
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
    /// Per-reconcile AWS client factory
    pub aws_builder: AwsClientBuilder,
    /// Process configuration from the environment
    pub config: Config,
    /// Organization account budget guard
    pub total_accounts: TotalAccountWatcher,
}

impl Context {
    /// Clients carrying the operator's own credentials, in the home region.
    pub async fn operator_aws(&self) -> Result<AwsClients> {
        self.aws_builder
            .from_secret(
                OPERATOR_CREDENTIALS_SECRET,
                &self.config.operator_namespace,
                config::default_region(),
            )
            .await
    }

    /// Clients scoped to a member account via cross-account role assumption.
    pub async fn account_aws(
        &self,
        account: &CloudAccount,
        region: &str,
        expected_role_id: Option<&str>,
    ) -> Result<AwsClients> {
        let setup = self.operator_aws().await?;
        assume::assume_role_for_account(
            &setup,
            &account.spec.awsAccountID,
            assume::ORG_ACCESS_ROLE,
            region,
            expected_role_id,
        )
        .await
        .map_err(Error::AwsError)
    }
}

pub fn requeue_normal_with_jitter() -> Action {
    // Check back every 90-150 seconds
    let jitter = rand::thread_rng().gen_range(0..60);
    Action::requeue(Duration::from_secs(90 + jitter))
}

/// Six random lowercase alphanumerics, for realised resource names.
pub fn short_uid() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..6)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "account-operator".into(),
        }
    }
}
impl Diagnostics {
    pub fn recorder(&self, client: Client, account: &CloudAccount) -> Recorder {
        Recorder::new(client, self.reporter.clone(), account.object_ref(&()))
    }
}

/// State shared between the controllers and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the reconcilers
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
    /// Budget guard shared with the watcher task
    total_accounts: TotalAccountWatcher,
}

/// State wrapper around the controller outputs for the web server
impl State {
    /// Rendered metrics exposition
    pub fn metrics(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = prometheus::TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    // Create a Context that can update State
    pub fn create_context(&self, client: Client) -> Arc<Context> {
        Arc::new(Context {
            client: client.clone(),
            metrics: Metrics::new(&self.registry).expect("metrics registered once"),
            diagnostics: self.diagnostics.clone(),
            aws_builder: AwsClientBuilder::new(client),
            config: Config::default(),
            total_accounts: self.total_accounts.clone(),
        })
    }
}

/// One-time setup read from the operator config map: the partition flag, the
/// concurrency table, and the `CCS-Access-Arn` write-back.
async fn startup_config(ctx: &Context) -> Result<()> {
    let cm = configmap::get_operator_configmap(ctx.client.clone(), &ctx.config.operator_namespace)
        .await?;
    config::set_fedramp(configmap::fedramp_enabled(&cm));
    info!(
        "partition: {}, dev mode: {:?}",
        config::partition_prefix(),
        ctx.config.dev_mode
    );
    for controller in [
        ACCOUNT_CONTROLLER,
        CLAIM_CONTROLLER,
        POOL_CONTROLLER,
        FEDERATED_ROLE_CONTROLLER,
        FEDERATED_ACCESS_CONTROLLER,
    ] {
        info!(
            "MaxConcurrentReconciles.{controller} = {}",
            configmap::max_concurrent_reconciles(&cm, controller)
        );
    }

    if configmap::read_key(&cm, "CCS-Access-Arn").is_err() {
        let aws = ctx.operator_aws().await?;
        let (_, arn) = aws.get_caller_identity().await?;
        configmap::write_key(
            ctx.client.clone(),
            &ctx.config.operator_namespace,
            "CCS-Access-Arn",
            &arn,
        )
        .await?;
        info!("resolved CCS-Access-Arn to {arn}");
    }
    Ok(())
}

/// Initialize all controllers and shared state (given the crds are installed)
pub async fn run(state: State) {
    // Initialize the Kubernetes client
    let client_future = Client::try_default();
    let client = match client_future.await {
        Ok(wrapped_client) => wrapped_client,
        Err(_) => panic!("Please configure your Kubernetes Context"),
    };

    let accounts = Api::<CloudAccount>::all(client.clone());
    if let Err(e) = accounts.list(&ListParams::default().limit(1)).await {
        error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        std::process::exit(1);
    }

    let ctx = state.create_context(client.clone());
    if let Err(e) = startup_config(&ctx).await {
        warn!("startup configuration incomplete: {e}");
    }

    // Background watchers share one shutdown signal.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(ctx.total_accounts.clone().run(
        client.clone(),
        ctx.aws_builder.clone(),
        ctx.config.clone(),
        ctx.metrics.clone(),
        TOTAL_WATCH_INTERVAL,
        shutdown_rx.clone(),
    ));
    tokio::spawn(watchers::run_credential_rotation_watcher(
        client.clone(),
        ctx.config.clone(),
        Duration::from_secs(60 * 60),
        shutdown_rx,
    ));

    let account_controller = Controller::new(accounts, watcherConfig::default().any_semantic())
        .shutdown_on_signal()
        .run(account::reconcile, account::error_policy, ctx.clone())
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    let claim_controller = Controller::new(
        Api::<AccountClaim>::all(client.clone()),
        watcherConfig::default().any_semantic(),
    )
    .shutdown_on_signal()
    .run(claim::reconcile, claim::error_policy, ctx.clone())
    .filter_map(|x| async move { std::result::Result::ok(x) })
    .for_each(|_| futures::future::ready(()));

    // Pools re-reconcile whenever one of their accounts changes.
    let pool_controller = Controller::new(
        Api::<AccountPool>::all(client.clone()),
        watcherConfig::default().any_semantic(),
    )
    .owns(
        Api::<CloudAccount>::all(client.clone()),
        watcherConfig::default(),
    )
    .shutdown_on_signal()
    .run(pool::reconcile, pool::error_policy, ctx.clone())
    .filter_map(|x| async move { std::result::Result::ok(x) })
    .for_each(|_| futures::future::ready(()));

    let federated_role_controller = Controller::new(
        Api::<FederatedRole>::all(client.clone()),
        watcherConfig::default().any_semantic(),
    )
    .shutdown_on_signal()
    .run(
        federated_role::reconcile,
        federated_role::error_policy,
        ctx.clone(),
    )
    .filter_map(|x| async move { std::result::Result::ok(x) })
    .for_each(|_| futures::future::ready(()));

    let federated_access_controller = Controller::new(
        Api::<FederatedAccess>::all(client.clone()),
        watcherConfig::default().any_semantic(),
    )
    .shutdown_on_signal()
    .run(
        federated_access::reconcile,
        federated_access::error_policy,
        ctx.clone(),
    )
    .filter_map(|x| async move { std::result::Result::ok(x) })
    .for_each(|_| futures::future::ready(()));

    tokio::join!(
        account_controller,
        claim_controller,
        pool_controller,
        federated_role_controller,
        federated_access_controller,
    );
    let _ = shutdown_tx.send(true);
}
