//! Relay metric definitions.
//!
//! Names carry the `relay_` prefix; counters end in `_total`. Labels are
//! bounded: `status` is `success`/`error`/`malformed`/`skipped`, `outcome` is
//! one of the admission outcomes (`admitted`, `unauthorized`, `forbidden`,
//! `not_found`, `conflict`, `internal_error`). Room and user ids are never
//! used as labels.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return the handle `/metrics` renders.
///
/// Must run before any metric is recorded.
///
/// # Errors
///
/// Returns an error if a global recorder is already installed.
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Gauges
// ============================================================================

/// Metric: `relay_connections_active`
pub fn set_connections_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("relay_connections_active").set(count as f64);
}

/// Metric: `relay_rooms_active`
///
/// Number of rooms with at least one local member (live hubs).
pub fn set_rooms_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("relay_rooms_active").set(count as f64);
}

// ============================================================================
// Counters
// ============================================================================

/// Record the outcome of one hub broadcast.
///
/// Metrics: `relay_broadcast_deliveries_total`, `relay_broadcast_drops_total`
///
/// A drop is a member whose outbound queue was full.
pub fn record_broadcast(delivered: usize, dropped: usize) {
    if delivered > 0 {
        counter!("relay_broadcast_deliveries_total").increment(delivered as u64);
    }
    if dropped > 0 {
        counter!("relay_broadcast_drops_total").increment(dropped as u64);
    }
}

/// Metric: `relay_backbone_publish_total`
/// Labels: `status` (success, error)
pub fn record_backbone_publish(status: &'static str) {
    counter!("relay_backbone_publish_total", "status" => status).increment(1);
}

/// Metric: `relay_backbone_consume_total`
/// Labels: `status` (success, malformed, skipped)
///
/// `skipped` counts frames this instance originated.
pub fn record_backbone_consume(status: &'static str) {
    counter!("relay_backbone_consume_total", "status" => status).increment(1);
}

/// Metric: `relay_admissions_total`
/// Labels: `outcome`
pub fn record_admission(outcome: &'static str) {
    counter!("relay_admissions_total", "outcome" => outcome).increment(1);
}

/// Metric: `relay_connections_replaced_total`
///
/// Incremented when a reconnecting user tears down their previous
/// connection in the same room.
pub fn record_connection_replaced() {
    counter!("relay_connections_replaced_total").increment(1);
}
