// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Prometheus metrics for the migration handler.
//!
//! All metrics carry the namespace prefix `kubevirt_handoff_`.
//!
//! # Metrics Categories
//!
//! - **Reconciliation Metrics** - Outcomes and durations of source and target syncs
//! - **Migration Metrics** - Migrations started and finished on this node
//! - **Tunnel Metrics** - Open listeners and relayed bytes
//!
//! # Example
//!
//! ```rust,no_run
//! use handoff::metrics::record_reconciliation_success;
//!
//! record_reconciliation_success("source", std::time::Duration::from_millis(12));
//! ```

use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::LazyLock;
use std::time::Duration;

// ============================================================================
// Metric Name Constants
// ============================================================================

/// Namespace prefix for all handler metrics
const METRICS_NAMESPACE: &str = "kubevirt_handoff";

// ============================================================================
// Global Metrics Registry
// ============================================================================

/// Global Prometheus metrics registry
///
/// All metrics are registered in this registry and exposed via `/metrics` endpoint.
pub static METRICS_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// ============================================================================
// Reconciliation Metrics
// ============================================================================

/// Total number of reconciliations by controller and outcome
///
/// Labels:
/// - `controller`: `source` or `target`
/// - `status`: Outcome (`success`, `error`, `requeue`)
pub static RECONCILIATION_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_reconciliations_total"),
        "Total number of reconciliations by controller and status",
    );
    let counter = CounterVec::new(opts, &["controller", "status"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

/// Duration of reconciliations in seconds
///
/// Labels:
/// - `controller`: `source` or `target`
pub static RECONCILIATION_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let opts = HistogramOpts::new(
        format!("{METRICS_NAMESPACE}_reconciliation_duration_seconds"),
        "Duration of reconciliations in seconds by controller",
    )
    .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]);
    let histogram = HistogramVec::new(opts, &["controller"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(histogram.clone()))
        .unwrap();
    histogram
});

/// Total number of requeue operations
///
/// Labels:
/// - `controller`: `source` or `target`
/// - `reason`: Why the key was requeued (`waiting_for_target_ports`, `retry_backoff`, ...)
pub static REQUEUE_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_requeues_total"),
        "Total number of requeue operations by controller and reason",
    );
    let counter = CounterVec::new(opts, &["controller", "reason"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

// ============================================================================
// Migration Metrics
// ============================================================================

/// Total number of migration transitions observed on this node
///
/// Labels:
/// - `role`: `source` or `target`
/// - `outcome`: `started`, `succeeded`, `failed`, `aborted`
pub static MIGRATIONS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_migrations_total"),
        "Total number of migration transitions by node role and outcome",
    );
    let counter = CounterVec::new(opts, &["role", "outcome"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

// ============================================================================
// Tunnel Metrics
// ============================================================================

/// Number of open tunnel listeners
pub static OPEN_TUNNEL_LISTENERS: LazyLock<IntGauge> = LazyLock::new(|| {
    let gauge = IntGauge::new(
        format!("{METRICS_NAMESPACE}_open_tunnel_listeners"),
        "Number of open migration tunnel listeners across both roles",
    )
    .unwrap();
    METRICS_REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

/// Total bytes relayed through migration tunnels
///
/// Labels:
/// - `role`: `source` or `target`
/// - `direction`: `outbound` (from the local hypervisor) or `inbound`
pub static TUNNEL_BYTES_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_tunnel_bytes_total"),
        "Total bytes relayed through migration tunnels by role and direction",
    );
    let counter = CounterVec::new(opts, &["role", "direction"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

// ============================================================================
// Helper Functions
// ============================================================================

/// Record a successful reconciliation
///
/// # Arguments
/// * `controller` - `source` or `target`
/// * `duration` - Duration of the reconciliation
pub fn record_reconciliation_success(controller: &str, duration: Duration) {
    RECONCILIATION_TOTAL
        .with_label_values(&[controller, "success"])
        .inc();
    RECONCILIATION_DURATION_SECONDS
        .with_label_values(&[controller])
        .observe(duration.as_secs_f64());
}

/// Record a failed reconciliation
///
/// # Arguments
/// * `controller` - `source` or `target`
/// * `duration` - Duration of the reconciliation before failure
pub fn record_reconciliation_error(controller: &str, duration: Duration) {
    RECONCILIATION_TOTAL
        .with_label_values(&[controller, "error"])
        .inc();
    RECONCILIATION_DURATION_SECONDS
        .with_label_values(&[controller])
        .observe(duration.as_secs_f64());
}

/// Record a reconciliation requeue
///
/// # Arguments
/// * `controller` - `source` or `target`
/// * `reason` - Reason for requeue
pub fn record_reconciliation_requeue(controller: &str, reason: &str) {
    RECONCILIATION_TOTAL
        .with_label_values(&[controller, "requeue"])
        .inc();
    REQUEUE_TOTAL.with_label_values(&[controller, reason]).inc();
}

/// Record a migration transition
pub fn record_migration(role: &str, outcome: &str) {
    MIGRATIONS_TOTAL.with_label_values(&[role, outcome]).inc();
}

/// Publish the current number of open tunnel listeners
pub fn set_open_tunnel_listeners(count: usize) {
    OPEN_TUNNEL_LISTENERS.set(i64::try_from(count).unwrap_or(i64::MAX));
}

/// Add relayed bytes
#[allow(clippy::cast_precision_loss)]
pub fn record_tunnel_bytes(role: &str, direction: &str, bytes: u64) {
    if bytes > 0 {
        TUNNEL_BYTES_TOTAL
            .with_label_values(&[role, direction])
            .inc_by(bytes as f64);
    }
}

/// Gather and encode all metrics in Prometheus text format
///
/// # Errors
/// Returns error if encoding fails
pub fn gather_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = METRICS_REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(format!("UTF-8 error: {e}")))
}
