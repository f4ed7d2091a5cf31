//! Prometheus Metrics Module
//!
//! Exposes pipeline metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Messages**: counts of messages ingested and dropped, by symbol/reason
//! - **Quality**: sequence gaps detected per symbol
//! - **Connection**: feed connection state and reconnect attempts
//! - **Persistence**: flush latency, rows written, backlog depth
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::infrastructure::feed::ConnectionState;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let builder = PrometheusBuilder::new();
            #[allow(clippy::expect_used)]
            let handle = builder
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "ingest_messages_total",
        "Total validated messages ingested, by symbol"
    );
    describe_counter!(
        "ingest_drops_total",
        "Total messages dropped anywhere in the pipeline, by reason"
    );
    describe_counter!(
        "ingest_gap_total",
        "Total sequence gaps detected, by symbol"
    );
    describe_counter!(
        "ingest_reconnects_total",
        "Total feed reconnection attempts"
    );
    describe_counter!(
        "ingest_connection_attempts_total",
        "Total feed connection attempts, including the first"
    );
    describe_counter!(
        "ingest_disconnects_total",
        "Total established feed connections that ended"
    );

    describe_gauge!(
        "connection_state",
        "Feed connection state (0=disconnected 1=connecting 2=subscribing 3=streaming 4=degraded 5=closing)"
    );
    describe_gauge!(
        "ingest_queue_depth",
        "Current depth of a consumer sub-queue"
    );
    describe_gauge!(
        "ingest_persistence_backlog_rows",
        "Rows parked in the persistence backlog"
    );
    describe_gauge!(
        "ingest_fanout_subscribers",
        "Number of registered fan-out subscribers"
    );

    describe_histogram!(
        "persistence_flush_latency_seconds",
        "Wall time of one storage flush including retries"
    );
    describe_histogram!(
        "ingest_persistence_batch_rows",
        "Rows per flushed batch"
    );
}

// =============================================================================
// Metric Labels
// =============================================================================

/// Why a message or row was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Structurally invalid frame.
    Malformed,
    /// Sequence at or below the per-symbol cursor.
    Duplicate,
    /// Evicted from a full consumer sub-queue.
    QueueFull,
    /// Evicted from a full fan-out subscriber mailbox.
    SubscriberLagging,
    /// Evicted from the persistence backlog.
    BacklogOverflow,
}

impl DropReason {
    /// Label value used on `ingest_drops_total`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::Duplicate => "duplicate",
            Self::QueueFull => "queue_full",
            Self::SubscriberLagging => "subscriber_lagging",
            Self::BacklogOverflow => "backlog_overflow",
        }
    }
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record a validated message accepted into the pipeline.
pub fn record_message_ingested(symbol: &str) {
    counter!("ingest_messages_total", "symbol" => symbol.to_string()).increment(1);
}

/// Record dropped messages, labeled by reason.
pub fn record_drops(reason: DropReason, count: u64) {
    counter!("ingest_drops_total", "reason" => reason.as_str()).increment(count);
}

/// Record a detected sequence gap.
pub fn record_gap(symbol: &str) {
    counter!("ingest_gap_total", "symbol" => symbol.to_string()).increment(1);
}

/// Record a feed reconnection attempt.
pub fn record_reconnect(feed: &str) {
    counter!("ingest_reconnects_total", "feed" => feed.to_string()).increment(1);
}

/// Record a feed connection attempt.
pub fn record_connection_attempt(feed: &str) {
    counter!("ingest_connection_attempts_total", "feed" => feed.to_string()).increment(1);
}

/// Record the end of an established feed connection.
pub fn record_disconnect(feed: &str) {
    counter!("ingest_disconnects_total", "feed" => feed.to_string()).increment(1);
}

/// Update the connection state gauge for a feed.
pub fn record_connection_state(feed: &str, state: ConnectionState) {
    gauge!("connection_state", "feed" => feed.to_string()).set(state.gauge_value());
}

/// Update the depth gauge for a consumer sub-queue.
pub fn set_queue_depth(consumer: &'static str, depth: f64) {
    gauge!("ingest_queue_depth", "consumer" => consumer).set(depth);
}

/// Update the persistence backlog gauge.
pub fn set_backlog_rows(rows: f64) {
    gauge!("ingest_persistence_backlog_rows").set(rows);
}

/// Update the fan-out subscriber count gauge.
pub fn set_fanout_subscribers(count: f64) {
    gauge!("ingest_fanout_subscribers").set(count);
}

/// Record the wall time of one storage flush, including retries.
pub fn record_flush_latency(duration: Duration) {
    histogram!("persistence_flush_latency_seconds").record(duration.as_secs_f64());
}

/// Record the size of one flushed batch.
pub fn record_batch_rows(rows: usize) {
    #[allow(clippy::cast_precision_loss)]
    histogram!("ingest_persistence_batch_rows").record(rows as f64);
}

// =============================================================================
// Tests
// =============================================================================
