//! Prometheus metrics for the message bus.
//!
//! `lazy_static!` is used here because the `prometheus` crate's default
//! registry is process-global by design; this is the one place in the crate
//! that pattern is appropriate.

use lazy_static::lazy_static;
use prometheus::{register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, GaugeVec, HistogramVec};

lazy_static! {
    /// Total publish attempts, labeled by event type and outcome.
    pub static ref PUBLISH_TOTAL: CounterVec = register_counter_vec!(
        "message_bus_publish_total",
        "Total publish attempts",
        &["event_type", "status"]
    )
    .unwrap();

    /// Publish latency.
    pub static ref PUBLISH_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "message_bus_publish_duration_seconds",
        "Publish duration in seconds",
        &["event_type"]
    )
    .unwrap();

    /// Per-message consume outcomes (success, validation_error, transient_error, permanent_error).
    pub static ref CONSUME_OUTCOME_TOTAL: CounterVec = register_counter_vec!(
        "message_bus_consume_outcome_total",
        "Consumer loop outcomes per message",
        &["event_type", "outcome"]
    )
    .unwrap();

    /// Listener dispatch latency.
    pub static ref DISPATCH_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "message_bus_dispatch_duration_seconds",
        "Listener dispatch duration in seconds",
        &["event_type"]
    )
    .unwrap();

    /// Approximate DLQ depth, sampled by the monitor tool.
    pub static ref DLQ_DEPTH: GaugeVec = register_gauge_vec!(
        "message_bus_dlq_depth",
        "Approximate DLQ depth",
        &["queue"]
    )
    .unwrap();
}
