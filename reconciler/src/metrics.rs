//! Metrics collection for observability
//!
//! # Metrics
//!
//! - `reconciliations_total{outcome}` - Finished reconciliations by outcome
//! - `reconciliation_rows_updated_total` - Rows rewritten by applied plans
//! - `reconciliation_duration_seconds` - Histogram of end-to-end latencies
//! - `reconciliation_failures_total{kind}` - Failed reconciliations by error kind
//! - `ledger_drift` - Difference left by the last verification
//! - `reconciliation_unrecorded_writes_total` - Rows rewritten by cycles that
//!   failed before their audit record was stored

use crate::Result;
use prometheus::{
    register_gauge_with_registry, register_histogram_with_registry,
    register_int_counter_vec_with_registry, register_int_counter_with_registry, Encoder, Gauge,
    Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Finished reconciliations by outcome
    pub reconciliations_total: IntCounterVec,

    /// Rows rewritten
    pub rows_updated_total: IntCounter,

    /// End-to-end duration histogram
    pub duration: Histogram,

    /// Failures by error kind
    pub failures_total: IntCounterVec,

    /// Last verification difference
    pub drift: Gauge,

    /// Rows committed without an audit record
    pub unrecorded_writes_total: IntCounter,

    registry: Registry,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    /// Create new metrics collector on a private registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let reconciliations_total = register_int_counter_vec_with_registry!(
            Opts::new("reconciliations_total", "Finished reconciliations by outcome"),
            &["outcome"],
            registry
        )?;

        let rows_updated_total = register_int_counter_with_registry!(
            Opts::new(
                "reconciliation_rows_updated_total",
                "Rows rewritten by applied reconciliation plans"
            ),
            registry
        )?;

        let duration = register_histogram_with_registry!(
            HistogramOpts::new(
                "reconciliation_duration_seconds",
                "Reconciliation latency including the oracle call"
            )
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            registry
        )?;

        let failures_total = register_int_counter_vec_with_registry!(
            Opts::new("reconciliation_failures_total", "Failed reconciliations by error kind"),
            &["kind"],
            registry
        )?;

        let drift = register_gauge_with_registry!(
            Opts::new("ledger_drift", "Difference between ledger and target after the last verification"),
            registry
        )?;

        let unrecorded_writes_total = register_int_counter_with_registry!(
            Opts::new(
                "reconciliation_unrecorded_writes_total",
                "Rows rewritten by reconciliations that failed before recording"
            ),
            registry
        )?;

        Ok(Self {
            reconciliations_total,
            rows_updated_total,
            duration,
            failures_total,
            drift,
            unrecorded_writes_total,
            registry,
        })
    }

    /// Record a finished reconciliation
    pub fn record_outcome(&self, outcome: &str, rows_updated: usize, duration_seconds: f64) {
        self.reconciliations_total.with_label_values(&[outcome]).inc();
        self.rows_updated_total.inc_by(rows_updated as u64);
        self.duration.observe(duration_seconds);
    }

    /// Record a failed reconciliation
    pub fn record_failure(&self, kind: &str) {
        self.failures_total.with_label_values(&[kind]).inc();
    }

    /// Record rows that were written by a cycle that then failed
    pub fn record_unrecorded_writes(&self, rows: usize) {
        self.unrecorded_writes_total.inc_by(rows as u64);
    }

    /// Record the difference left after verification
    pub fn record_drift(&self, difference: Decimal) {
        self.drift.set(difference.to_f64().unwrap_or(f64::MAX));
    }

    /// Text exposition of all collectors
    pub fn export(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_metrics_creation() {
        // Private registries, so two collectors never clash
        let first = Metrics::new().unwrap();
        let second = Metrics::new().unwrap();
        first.record_failure("oracle");
        assert_eq!(second.failures_total.with_label_values(&["oracle"]).get(), 0);
    }

    #[test]
    fn test_export() {
        let metrics = Metrics::new().unwrap();
        metrics.record_outcome("rebalanced", 2, 0.02);
        metrics.record_drift(dec!(0.0005));

        let text = metrics.export().unwrap();
        assert!(text.contains("reconciliations_total{outcome=\"rebalanced\"} 1"));
        assert!(text.contains("reconciliation_rows_updated_total 2"));
        assert!(text.contains("ledger_drift 0.0005"));
    }
}
