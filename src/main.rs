//! Market Ingest Binary
//!
//! Starts the market data ingestion pipeline.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-ingest
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `FEED_URL`: WebSocket URL of the exchange feed
//! - `FEED_SYMBOLS`: Comma-separated symbols to subscribe to
//!
//! ## Optional
//! - `FEED_NAME`: Logical feed name for metrics (default: primary)
//! - `FEED_API_KEY` / `FEED_API_SECRET`: Credentials for authenticated feeds
//! - `INGEST_HEALTH_PORT`: Health check HTTP port (default: 8083)
//! - `INGEST_QUEUE_CAPACITY`: Per-consumer sub-queue capacity (default: 10000)
//! - `INGEST_BATCH_MAX_ROWS`: Rows per persisted batch (default: 500)
//! - `INGEST_BATCH_FLUSH_INTERVAL_MS`: Max age of an unflushed row (default: 500)
//! - `INGEST_QUALITY_LOG_PATH`: Gap log path (default: data/gaps.jsonl)
//! - `INGEST_SPOOL_PATH`: Tick spool path (default: data/ticks.jsonl)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4318>)
//! - `OTEL_SERVICE_NAME`: Service name (default: market-ingest)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use market_ingest::infrastructure::fanout::{FanoutHub, FanoutPump};
use market_ingest::infrastructure::feed::{ConnectionStateCell, FeedClient, FeedClientConfig};
use market_ingest::infrastructure::health::{HealthServer, PipelineHealth};
use market_ingest::infrastructure::persistence::{BatchWriter, JsonlSink, WriterStats};
use market_ingest::infrastructure::queue::IngestQueue;
use market_ingest::infrastructure::telemetry;
use market_ingest::infrastructure::validator::{QualityLog, Validator, ValidatorStats};
use market_ingest::{FeedClientError, IngestConfig, RawFrame, StorageSink, init_metrics};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout, covering the writer's drain deadline.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting market ingest pipeline");

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics();

    let config = IngestConfig::from_env().context("invalid pipeline configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // Ingestion queue with one sub-queue per consumer
    let queue = IngestQueue::new(config.queue.capacity);
    let persistence_consumer = queue.register("persistence");
    let fanout_consumer = queue.register("fanout");

    // Validator: raw frames in, validated messages out
    let quality_log =
        QualityLog::open(&config.quality_log_path).context("failed to open quality log")?;
    let validator_stats = Arc::new(ValidatorStats::default());
    let validator = Validator::new(queue.clone(), quality_log, Arc::clone(&validator_stats));
    let (frame_tx, frame_rx) = mpsc::channel::<RawFrame>(1024);

    let validator_token = shutdown_token.clone();
    let validator_handle = tokio::spawn(async move {
        validator.run(frame_rx, validator_token).await;
    });

    // Batch writer flushing to the local JSONL spool
    let sink: Arc<dyn StorageSink> =
        Arc::new(JsonlSink::open(&config.spool_path).context("failed to open tick spool")?);
    let writer_stats = Arc::new(WriterStats::default());
    let writer = BatchWriter::new(
        persistence_consumer,
        sink,
        config.batch.clone(),
        Arc::clone(&writer_stats),
        shutdown_token.clone(),
    );
    let writer_handle = tokio::spawn(writer.run());

    // Fan-out hub for in-process subscribers
    let fanout_hub = Arc::new(FanoutHub::new(config.fanout.mailbox_capacity));
    let pump = FanoutPump::new(
        fanout_consumer,
        Arc::clone(&fanout_hub),
        shutdown_token.clone(),
    );
    let pump_handle = tokio::spawn(pump.run());

    // Health report and HTTP endpoint
    let connection_state = Arc::new(ConnectionStateCell::new());
    let health = Arc::new(PipelineHealth::new(
        config.feed.name.clone(),
        config.health.drop_rate_threshold,
        Arc::clone(&connection_state),
        queue.clone(),
        Arc::clone(&validator_stats),
        Arc::clone(&writer_stats),
        Arc::clone(&fanout_hub),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        Arc::clone(&health),
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    // Feed client
    let client_config = FeedClientConfig::from_config(&config);
    let feed_client = Arc::new(FeedClient::new(
        client_config,
        Arc::clone(&connection_state),
        frame_tx,
        shutdown_token.clone(),
    ));

    let client_health = Arc::clone(&health);
    tokio::spawn(async move {
        match feed_client.run().await {
            Ok(()) => {}
            Err(e @ FeedClientError::CircuitBreakerOpen(_)) => {
                client_health.mark_circuit_broken();
                tracing::error!(error = %e, "Feed client gave up reconnecting");
            }
            Err(e) => {
                tracing::error!(error = %e, "Feed client error");
            }
        }
    });

    tracing::info!("Pipeline ready");

    await_shutdown(shutdown_token).await;

    // Give the writer time to drain its final batch.
    let drain = async {
        let _ = validator_handle.await;
        let _ = pump_handle.await;
        let _ = writer_handle.await;
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
        tracing::warn!("Shutdown timeout exceeded, exiting with tasks still running");
    }

    tracing::info!("Pipeline stopped");
    Ok(())
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &IngestConfig) {
    tracing::info!(
        feed = %config.feed.name,
        url = %config.feed.url,
        symbols = ?config.feed.symbols,
        authenticated = config.credentials.is_some(),
        health_port = config.server.health_port,
        queue_capacity = config.queue.capacity,
        batch_max_rows = config.batch.max_rows,
        "Configuration loaded"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
