//! Health Check and Metrics Endpoint
//!
//! Aggregates the pipeline's component stats into one report and serves it
//! over HTTP for container orchestrators and monitoring systems.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns the JSON health report
//! - `GET /healthz` - Kubernetes liveness probe (simple OK)
//! - `GET /readyz` - Kubernetes readiness probe (checks the feed connection)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::fanout::FanoutHub;
use crate::infrastructure::feed::{ConnectionState, ConnectionStateCell};
use crate::infrastructure::metrics::get_metrics_handle;
use crate::infrastructure::persistence::WriterStats;
use crate::infrastructure::queue::IngestQueue;
use crate::infrastructure::validator::ValidatorStats;

// =============================================================================
// Health Report Types
// =============================================================================

/// Overall pipeline status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Streaming, persisting, and broadcasting normally.
    Healthy,
    /// Ingesting with reduced fidelity (reconnecting, dropping, or retrying).
    Degraded,
    /// Not ingesting or not persisting; operator attention required.
    Failing,
}

/// Aggregated health report served at `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Overall status.
    pub status: HealthStatus,
    /// Pipeline version.
    pub version: String,
    /// Seconds since startup.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Feed connection section.
    pub connection: ConnectionReport,
    /// Ingestion queue section.
    pub queue: QueueReport,
    /// Validator section.
    pub validator: ValidatorReport,
    /// Persistence section.
    pub persistence: PersistenceReport,
    /// Fan-out section.
    pub fanout: FanoutReport,
}

/// Feed connection status.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionReport {
    /// Logical feed name.
    pub feed: String,
    /// Current connection state.
    pub state: String,
    /// Reconnection attempts since startup.
    pub reconnects: u64,
    /// Seconds since the last frame, absent before the first one.
    pub seconds_since_last_message: Option<u64>,
    /// Whether the reconnect circuit breaker has opened.
    pub circuit_broken: bool,
}

/// Depth of one consumer's sub-queue.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerDepth {
    /// Consumer name given at registration.
    pub consumer: &'static str,
    /// Messages currently waiting in its sub-queue.
    pub depth: usize,
}

/// Ingestion queue counters.
#[derive(Debug, Clone, Serialize)]
pub struct QueueReport {
    /// Messages pushed by the validator.
    pub pushed: u64,
    /// Messages evicted across all sub-queues.
    pub dropped: u64,
    /// dropped / pushed.
    pub drop_ratio: f64,
    /// Per-consumer sub-queue depths.
    pub depths: Vec<ConsumerDepth>,
}

/// Validator counters.
#[derive(Debug, Clone, Serialize)]
pub struct ValidatorReport {
    /// Messages accepted into the queue.
    pub accepted: u64,
    /// Frames rejected as malformed.
    pub malformed: u64,
    /// Messages dropped as duplicates.
    pub duplicates: u64,
    /// Sequence gaps detected.
    pub gaps: u64,
}

/// Batch writer counters.
#[derive(Debug, Clone, Serialize)]
pub struct PersistenceReport {
    /// Rows flushed to storage.
    pub flushed_rows: u64,
    /// Batches flushed to storage.
    pub flushed_batches: u64,
    /// Batches that exhausted retries or were rejected.
    pub failed_batches: u64,
    /// Rows currently parked in the backlog.
    pub backlog_rows: u64,
    /// Rows evicted from the backlog.
    pub backlog_dropped: u64,
    /// Whether a flush is currently retrying.
    pub retrying: bool,
    /// Whether the backlog is at its bound and evicting rows.
    pub backlog_saturated: bool,
    /// Seconds since the last successful flush, absent before the first one.
    pub last_flush_age_secs: Option<u64>,
}

/// Fan-out counters.
#[derive(Debug, Clone, Serialize)]
pub struct FanoutReport {
    /// Registered subscribers.
    pub subscribers: usize,
    /// Messages dropped across all subscriber mailboxes.
    pub dropped: u64,
}

// =============================================================================
// Pipeline Health State
// =============================================================================

/// Read-only view over every component's counters.
pub struct PipelineHealth {
    version: String,
    feed_name: String,
    started_at: Instant,
    drop_rate_threshold: f64,
    connection: Arc<ConnectionStateCell>,
    queue: IngestQueue,
    validator: Arc<ValidatorStats>,
    writer: Arc<WriterStats>,
    fanout: Arc<FanoutHub>,
    circuit_broken: AtomicBool,
}

impl PipelineHealth {
    /// Bundle the component handles health reporting reads from.
    #[must_use]
    pub fn new(
        feed_name: String,
        drop_rate_threshold: f64,
        connection: Arc<ConnectionStateCell>,
        queue: IngestQueue,
        validator: Arc<ValidatorStats>,
        writer: Arc<WriterStats>,
        fanout: Arc<FanoutHub>,
    ) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            feed_name,
            started_at: Instant::now(),
            drop_rate_threshold,
            connection,
            queue,
            validator,
            writer,
            fanout,
            circuit_broken: AtomicBool::new(false),
        }
    }

    /// Record that the feed client gave up reconnecting.
    pub fn mark_circuit_broken(&self) {
        self.circuit_broken.store(true, Ordering::Relaxed);
    }

    /// Whether the reconnect circuit breaker has opened.
    #[must_use]
    pub fn is_circuit_broken(&self) -> bool {
        self.circuit_broken.load(Ordering::Relaxed)
    }

    /// Build the current health report.
    #[must_use]
    pub fn report(&self) -> HealthReport {
        let state = self.connection.get();
        let queue_stats = self.queue.stats();

        let connection = ConnectionReport {
            feed: self.feed_name.clone(),
            state: state.as_str().to_string(),
            reconnects: self.connection.reconnects(),
            seconds_since_last_message: self.connection.seconds_since_last_message(),
            circuit_broken: self.is_circuit_broken(),
        };
        let queue = QueueReport {
            pushed: queue_stats.pushed,
            dropped: queue_stats.dropped,
            drop_ratio: queue_stats.drop_ratio(),
            depths: self
                .queue
                .depths()
                .into_iter()
                .map(|(consumer, depth)| ConsumerDepth { consumer, depth })
                .collect(),
        };
        let validator = ValidatorReport {
            accepted: self.validator.accepted(),
            malformed: self.validator.malformed(),
            duplicates: self.validator.duplicates(),
            gaps: self.validator.gaps(),
        };
        let persistence = PersistenceReport {
            flushed_rows: self.writer.flushed_rows(),
            flushed_batches: self.writer.flushed_batches(),
            failed_batches: self.writer.failed_batches(),
            backlog_rows: self.writer.backlog_rows(),
            backlog_dropped: self.writer.backlog_dropped(),
            retrying: self.writer.is_retrying(),
            backlog_saturated: self.writer.is_backlog_saturated(),
            last_flush_age_secs: self.writer.last_flush_age().map(|age| age.as_secs()),
        };
        let fanout = FanoutReport {
            subscribers: self.fanout.subscriber_count(),
            dropped: self.fanout.total_dropped(),
        };

        HealthReport {
            status: self.evaluate(state, &queue, &persistence),
            version: self.version.clone(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            current_time: Utc::now(),
            connection,
            queue,
            validator,
            persistence,
            fanout,
        }
    }

    /// Collapse component states into one overall status.
    ///
    /// Failing reflects current conditions only: the reconnect circuit
    /// breaker is open, or the backlog is at its bound and evicting rows
    /// right now. A parked backlog or an active retry is Degraded, and the
    /// status recovers as soon as the backlog drains.
    fn evaluate(
        &self,
        state: ConnectionState,
        queue: &QueueReport,
        persistence: &PersistenceReport,
    ) -> HealthStatus {
        if self.is_circuit_broken() || persistence.backlog_saturated {
            return HealthStatus::Failing;
        }

        if state != ConnectionState::Streaming
            || queue.drop_ratio > self.drop_rate_threshold
            || persistence.retrying
            || persistence.backlog_rows > 0
        {
            return HealthStatus::Degraded;
        }

        HealthStatus::Healthy
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    health: Arc<PipelineHealth>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, health: Arc<PipelineHealth>, cancel: CancellationToken) -> Self {
        Self {
            port,
            health,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = Router::new()
            .route("/health", get(health_handler))
            .route("/healthz", get(liveness_handler))
            .route("/readyz", get(readiness_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self.health);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(health): State<Arc<PipelineHealth>>) -> impl IntoResponse {
    let report = health.report();
    let status_code = match report.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Failing => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(report))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(health): State<Arc<PipelineHealth>>) -> impl IntoResponse {
    let report = health.report();

    // Ready once the feed produces data, even at reduced fidelity.
    let connected = report.connection.state == ConnectionState::Streaming.as_str()
        || report.connection.state == ConnectionState::Degraded.as_str();
    if connected && report.status != HealthStatus::Failing {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::*;
    use crate::domain::message::{FeedMessage, TickerMessage};

    fn make_health() -> (Arc<PipelineHealth>, Arc<ConnectionStateCell>, IngestQueue) {
        let connection = Arc::new(ConnectionStateCell::new());
        let queue = IngestQueue::new(100);
        let health = Arc::new(PipelineHealth::new(
            "primary".to_string(),
            0.01,
            Arc::clone(&connection),
            queue.clone(),
            Arc::new(ValidatorStats::default()),
            Arc::new(WriterStats::default()),
            Arc::new(FanoutHub::new(10)),
        ));
        (health, connection, queue)
    }

    fn ticker(sequence: u64) -> FeedMessage {
        FeedMessage::Ticker(TickerMessage {
            symbol: "BTC-USD".to_string(),
            price: Decimal::ONE,
            volume: Decimal::ONE,
            bid: Decimal::ONE,
            ask: Decimal::ONE,
            exchange_ts: Utc::now(),
            sequence,
        })
    }

    #[test]
    fn status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            "\"degraded\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Failing).unwrap(),
            "\"failing\""
        );
    }

    #[test]
    fn streaming_pipeline_is_healthy() {
        let (health, connection, _queue) = make_health();
        connection.set(ConnectionState::Streaming);

        let report = health.report();
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.connection.state, "streaming");
    }

    #[test]
    fn disconnected_pipeline_is_degraded() {
        let (health, _connection, _queue) = make_health();

        let report = health.report();
        assert_eq!(report.status, HealthStatus::Degraded);
    }

    #[test]
    fn degraded_connection_is_degraded() {
        let (health, connection, _queue) = make_health();
        connection.set(ConnectionState::Degraded);

        assert_eq!(health.report().status, HealthStatus::Degraded);
    }

    #[test]
    fn excessive_queue_drops_degrade_health() {
        let (health, connection, queue) = make_health();
        connection.set(ConnectionState::Streaming);

        // Capacity 100 with a single registered consumer: 150 pushes evict
        // 50 messages, a 33% drop ratio, far above the 1% threshold.
        let _consumer = queue.register("writer");
        for seq in 1..=150 {
            queue.push(ticker(seq));
        }

        let report = health.report();
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(report.queue.drop_ratio > 0.01);
    }

    #[test]
    fn circuit_breaker_means_failing() {
        let (health, connection, _queue) = make_health();
        connection.set(ConnectionState::Streaming);

        health.mark_circuit_broken();

        let report = health.report();
        assert_eq!(report.status, HealthStatus::Failing);
        assert!(report.connection.circuit_broken);
    }

    #[test]
    fn report_carries_version_and_feed_name() {
        let (health, _connection, _queue) = make_health();
        let report = health.report();
        assert_eq!(report.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(report.connection.feed, "primary");
    }
}
