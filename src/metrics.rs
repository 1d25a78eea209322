use prometheus::{
    histogram_opts, opts, Histogram, HistogramTimer, HistogramVec, IntCounterVec, IntGauge,
    IntGaugeVec, Registry,
};

use crate::Error;

/// All exported series. Registered once on the shared registry held by
/// `State`.
#[derive(Clone)]
pub struct Metrics {
    /// Total Active accounts in the organization, as last polled.
    pub aws_accounts: IntGauge,
    pub account_crs: IntGaugeVec,
    pub claim_crs: IntGaugeVec,
    pub pool_size: IntGaugeVec,
    pub reuse_cleanup_duration: Histogram,
    pub reuse_cleanup_failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
    pub reconcile_failures: IntCounterVec,
    pub api_request_duration: HistogramVec,
}

impl Metrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let aws_accounts = IntGauge::with_opts(opts!(
            "operator_aws_accounts",
            "Active accounts in the organization"
        ))?;
        let account_crs = IntGaugeVec::new(
            opts!("operator_account_crs", "CloudAccount census"),
            &["claimed", "reused", "state"],
        )?;
        let claim_crs = IntGaugeVec::new(
            opts!("operator_account_claim_crs", "AccountClaim census"),
            &["state"],
        )?;
        let pool_size = IntGaugeVec::new(
            opts!("operator_account_pool_size", "Desired pool sizes"),
            &["pool"],
        )?;
        let reuse_cleanup_duration = Histogram::with_opts(histogram_opts!(
            "operator_account_reuse_cleanup_duration_seconds",
            "Time spent scrubbing an account for reuse",
            vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]
        ))?;
        let reuse_cleanup_failures = IntCounterVec::new(
            opts!(
                "operator_account_reuse_cleanup_failures_total",
                "Reuse cleanups that reported at least one error"
            ),
            &["claim"],
        )?;
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "operator_reconcile_duration_seconds",
                "Reconcile latency per controller",
                vec![0.01, 0.1, 0.25, 0.5, 1.0, 5.0, 15.0, 60.0]
            ),
            &["controller"],
        )?;
        let reconcile_failures = IntCounterVec::new(
            opts!("operator_reconcile_failures_total", "Reconcile errors"),
            &["controller", "error"],
        )?;
        let api_request_duration = HistogramVec::new(
            histogram_opts!(
                "operator_api_request_duration_seconds",
                "Provider API latency",
                vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
            ),
            &["controller", "method", "resource", "status"],
        )?;

        registry.register(Box::new(aws_accounts.clone()))?;
        registry.register(Box::new(account_crs.clone()))?;
        registry.register(Box::new(claim_crs.clone()))?;
        registry.register(Box::new(pool_size.clone()))?;
        registry.register(Box::new(reuse_cleanup_duration.clone()))?;
        registry.register(Box::new(reuse_cleanup_failures.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;
        registry.register(Box::new(reconcile_failures.clone()))?;
        registry.register(Box::new(api_request_duration.clone()))?;

        Ok(Self {
            aws_accounts,
            account_crs,
            claim_crs,
            pool_size,
            reuse_cleanup_duration,
            reuse_cleanup_failures,
            reconcile_duration,
            reconcile_failures,
            api_request_duration,
        })
    }

    /// Start a reconcile timer; the observation lands when the timer drops.
    pub fn count_and_measure(&self, controller: &str) -> HistogramTimer {
        self.reconcile_duration
            .with_label_values(&[controller])
            .start_timer()
    }

    pub fn reconcile_failure(&self, controller: &str, error: &Error) {
        self.reconcile_failures
            .with_label_values(&[controller, &error.metric_label()])
            .inc();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics::new(&Registry::new()).expect("metrics construction is infallible on a fresh registry")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn metric_names_follow_the_exposition_contract() {
        let registry = Registry::new();
        let metrics = Metrics::new(&registry).unwrap();
        metrics.aws_accounts.set(12);
        metrics
            .account_crs
            .with_label_values(&["true", "false", "Ready"])
            .set(3);
        metrics.claim_crs.with_label_values(&["Pending"]).set(1);
        metrics.pool_size.with_label_values(&["default-pool"]).set(4);

        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|f| f.get_name().to_string())
            .collect();
        for expected in [
            "operator_aws_accounts",
            "operator_account_crs",
            "operator_account_claim_crs",
            "operator_account_pool_size",
            "operator_reconcile_duration_seconds",
        ] {
            assert!(names.contains(&expected.to_string()), "{expected}");
        }
    }

    #[test]
    fn registering_twice_on_one_registry_fails() {
        let registry = Registry::new();
        let _first = Metrics::new(&registry).unwrap();
        assert!(Metrics::new(&registry).is_err());
    }
}
