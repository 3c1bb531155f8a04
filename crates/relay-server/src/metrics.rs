//! Metrics collection and export for Relay.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use relay_core::RegistryStats;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const SUBSCRIBERS_TOTAL: &str = "relay_subscribers_total";
    pub const SUBSCRIBERS_ACTIVE: &str = "relay_subscribers_active";
    pub const MESSAGES_TOTAL: &str = "relay_messages_total";
    pub const STREAMED_BYTES: &str = "relay_streamed_bytes";
    pub const REJECTED_TOTAL: &str = "relay_rejected_total";
    pub const DELIVERED: &str = "relay_envelopes_delivered";
    pub const DROPPED: &str = "relay_envelopes_dropped";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::SUBSCRIBERS_TOTAL,
        "Total number of subscriber streams since server start"
    );
    metrics::describe_gauge!(
        names::SUBSCRIBERS_ACTIVE,
        "Current number of open subscriber streams"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Messages accepted for publishing");
    metrics::describe_counter!(names::STREAMED_BYTES, "Bytes written to subscriber streams");
    metrics::describe_counter!(names::REJECTED_TOTAL, "Publish requests rejected");
    metrics::describe_gauge!(
        names::DELIVERED,
        "Envelopes accepted by subscriber queues since server start"
    );
    metrics::describe_gauge!(
        names::DROPPED,
        "Envelopes dropped on full subscriber queues since server start"
    );

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record bytes written to a subscriber.
pub fn record_streamed(bytes: usize) {
    counter!(names::STREAMED_BYTES).increment(bytes as u64);
}

/// Record a rejected publish.
pub fn record_rejected(reason: &'static str) {
    counter!(names::REJECTED_TOTAL, "reason" => reason).increment(1);
}

/// Mirror registry totals. The registry owns these numbers, so they are
/// set absolutely rather than incremented here.
pub fn set_registry_stats(stats: RegistryStats) {
    for (kind, count) in stats.published_kinds() {
        counter!(names::MESSAGES_TOTAL, "kind" => kind).absolute(count);
    }
    gauge!(names::SUBSCRIBERS_ACTIVE).set(stats.subscriber_count as f64);
    gauge!(names::DELIVERED).set(stats.delivered as f64);
    gauge!(names::DROPPED).set(stats.dropped as f64);
}

/// Metrics guard held by a subscriber stream.
///
/// Only counts streams; the active gauge comes from [`set_registry_stats`].
pub struct SubscriberMetricsGuard;

impl SubscriberMetricsGuard {
    /// Create a new metrics guard, recording a subscriber.
    #[must_use]
    pub fn new() -> Self {
        counter!(names::SUBSCRIBERS_TOTAL).increment(1);
        Self
    }
}

impl Default for SubscriberMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}
