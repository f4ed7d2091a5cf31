//! Pipeline Configuration Settings
//!
//! Configuration types for the ingestion pipeline, loaded from environment
//! variables.

use std::path::PathBuf;
use std::time::Duration;

/// Exchange feed connection settings.
#[derive(Debug, Clone)]
pub struct FeedSettings {
    /// WebSocket URL of the exchange feed.
    pub url: String,
    /// Logical feed name, used as the `feed` label on metrics.
    pub name: String,
    /// Symbols to subscribe to.
    pub symbols: Vec<String>,
}

/// Exchange API credentials, required only by authenticated feeds.
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
    api_secret: String,
}

impl Credentials {
    /// Create new credentials.
    #[must_use]
    pub const fn new(api_key: String, api_secret: String) -> Self {
        Self {
            api_key,
            api_secret,
        }
    }

    /// Get the API key.
    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Get the API secret.
    #[must_use]
    pub fn api_secret(&self) -> &str {
        &self.api_secret
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"[REDACTED]")
            .field("api_secret", &"[REDACTED]")
            .finish()
    }
}

/// WebSocket liveness and reconnection settings.
#[derive(Debug, Clone)]
pub struct WebSocketSettings {
    /// No message within this window marks the connection Degraded.
    pub heartbeat_timeout: Duration,
    /// No message within this window forces a disconnect and reconnect.
    pub connection_timeout: Duration,
    /// How often the liveness watchdog checks message staleness.
    pub check_interval: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Consecutive failures before the reconnect circuit breaks (0 = never).
    pub max_consecutive_failures: u32,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(5),
            connection_timeout: Duration::from_secs(30),
            check_interval: Duration::from_secs(1),
            reconnect_delay_initial: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            max_consecutive_failures: 10,
        }
    }
}

/// Bounded ingestion queue settings.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Capacity of each per-consumer sub-queue.
    pub capacity: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self { capacity: 10_000 }
    }
}

/// Batch persistence writer settings.
#[derive(Debug, Clone)]
pub struct BatchSettings {
    /// Flush when the batch reaches this many rows.
    pub max_rows: usize,
    /// Flush when the oldest unflushed row reaches this age.
    pub max_flush_interval: Duration,
    /// Write retries before a batch is parked in the backlog.
    pub max_retries: u32,
    /// Initial delay between write retries.
    pub retry_backoff_initial: Duration,
    /// Maximum delay between write retries.
    pub retry_backoff_max: Duration,
    /// Rows retained in memory after exhausted retries; oldest beyond this
    /// bound are dropped and counted.
    pub max_backlog_rows: usize,
    /// How long shutdown may spend flushing the final batch.
    pub drain_deadline: Duration,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_rows: 500,
            max_flush_interval: Duration::from_millis(500),
            max_retries: 3,
            retry_backoff_initial: Duration::from_millis(250),
            retry_backoff_max: Duration::from_secs(5),
            max_backlog_rows: 50_000,
            drain_deadline: Duration::from_secs(5),
        }
    }
}

/// Fan-out broadcaster settings.
#[derive(Debug, Clone)]
pub struct FanoutSettings {
    /// Capacity of each subscriber's mailbox.
    pub mailbox_capacity: usize,
}

impl Default for FanoutSettings {
    fn default() -> Self {
        Self {
            mailbox_capacity: 1_000,
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health check and metrics HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Health evaluation thresholds.
#[derive(Debug, Clone)]
pub struct HealthSettings {
    /// Queue drop ratio (dropped / pushed) above which health is Degraded.
    pub drop_rate_threshold: f64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            drop_rate_threshold: 0.01,
        }
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Exchange feed settings.
    pub feed: FeedSettings,
    /// Optional API credentials; the abstract feed may not require auth.
    pub credentials: Option<Credentials>,
    /// WebSocket liveness and reconnection settings.
    pub websocket: WebSocketSettings,
    /// Ingestion queue settings.
    pub queue: QueueSettings,
    /// Batch writer settings.
    pub batch: BatchSettings,
    /// Fan-out settings.
    pub fanout: FanoutSettings,
    /// Server port settings.
    pub server: ServerSettings,
    /// Health thresholds.
    pub health: HealthSettings,
    /// Append-only sequence-gap quality log path.
    pub quality_log_path: PathBuf,
    /// Local JSONL spool path used by the default storage sink.
    pub spool_path: PathBuf,
}

impl IngestConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `FEED_URL` or `FEED_SYMBOLS` is missing or empty.
    pub fn from_env() -> Result<Self, ConfigError> {
        let url = std::env::var("FEED_URL")
            .map_err(|_| ConfigError::MissingEnvVar("FEED_URL".to_string()))?;
        if url.is_empty() {
            return Err(ConfigError::EmptyValue("FEED_URL".to_string()));
        }

        let symbols: Vec<String> = std::env::var("FEED_SYMBOLS")
            .map_err(|_| ConfigError::MissingEnvVar("FEED_SYMBOLS".to_string()))?
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if symbols.is_empty() {
            return Err(ConfigError::EmptyValue("FEED_SYMBOLS".to_string()));
        }

        let name = std::env::var("FEED_NAME").unwrap_or_else(|_| "primary".to_string());

        let credentials = match (std::env::var("FEED_API_KEY"), std::env::var("FEED_API_SECRET")) {
            (Ok(key), Ok(secret)) if !key.is_empty() => Some(Credentials::new(key, secret)),
            _ => None,
        };

        let websocket = WebSocketSettings {
            heartbeat_timeout: parse_env_duration_millis(
                "INGEST_HEARTBEAT_TIMEOUT_MS",
                WebSocketSettings::default().heartbeat_timeout,
            ),
            connection_timeout: parse_env_duration_millis(
                "INGEST_CONNECTION_TIMEOUT_MS",
                WebSocketSettings::default().connection_timeout,
            ),
            check_interval: parse_env_duration_millis(
                "INGEST_LIVENESS_CHECK_INTERVAL_MS",
                WebSocketSettings::default().check_interval,
            ),
            reconnect_delay_initial: parse_env_duration_millis(
                "INGEST_RECONNECT_DELAY_INITIAL_MS",
                WebSocketSettings::default().reconnect_delay_initial,
            ),
            reconnect_delay_max: parse_env_duration_secs(
                "INGEST_RECONNECT_DELAY_MAX_SECS",
                WebSocketSettings::default().reconnect_delay_max,
            ),
            reconnect_delay_multiplier: parse_env_f64(
                "INGEST_RECONNECT_DELAY_MULTIPLIER",
                WebSocketSettings::default().reconnect_delay_multiplier,
            ),
            max_consecutive_failures: parse_env_u32(
                "INGEST_MAX_CONSECUTIVE_FAILURES",
                WebSocketSettings::default().max_consecutive_failures,
            ),
        };

        let queue = QueueSettings {
            capacity: parse_env_usize("INGEST_QUEUE_CAPACITY", QueueSettings::default().capacity),
        };

        let batch = BatchSettings {
            max_rows: parse_env_usize("INGEST_BATCH_MAX_ROWS", BatchSettings::default().max_rows),
            max_flush_interval: parse_env_duration_millis(
                "INGEST_BATCH_FLUSH_INTERVAL_MS",
                BatchSettings::default().max_flush_interval,
            ),
            max_retries: parse_env_u32(
                "INGEST_BATCH_MAX_RETRIES",
                BatchSettings::default().max_retries,
            ),
            retry_backoff_initial: parse_env_duration_millis(
                "INGEST_BATCH_RETRY_BACKOFF_MS",
                BatchSettings::default().retry_backoff_initial,
            ),
            retry_backoff_max: parse_env_duration_secs(
                "INGEST_BATCH_RETRY_BACKOFF_MAX_SECS",
                BatchSettings::default().retry_backoff_max,
            ),
            max_backlog_rows: parse_env_usize(
                "INGEST_BATCH_MAX_BACKLOG_ROWS",
                BatchSettings::default().max_backlog_rows,
            ),
            drain_deadline: parse_env_duration_secs(
                "INGEST_DRAIN_DEADLINE_SECS",
                BatchSettings::default().drain_deadline,
            ),
        };

        let fanout = FanoutSettings {
            mailbox_capacity: parse_env_usize(
                "INGEST_FANOUT_MAILBOX_CAPACITY",
                FanoutSettings::default().mailbox_capacity,
            ),
        };

        let server = ServerSettings {
            health_port: parse_env_u16(
                "INGEST_HEALTH_PORT",
                ServerSettings::default().health_port,
            ),
        };

        let health = HealthSettings {
            drop_rate_threshold: parse_env_f64(
                "INGEST_DROP_RATE_THRESHOLD",
                HealthSettings::default().drop_rate_threshold,
            ),
        };

        let quality_log_path = std::env::var("INGEST_QUALITY_LOG_PATH")
            .map_or_else(|_| PathBuf::from("data/gaps.jsonl"), PathBuf::from);

        let spool_path = std::env::var("INGEST_SPOOL_PATH")
            .map_or_else(|_| PathBuf::from("data/ticks.jsonl"), PathBuf::from);

        Ok(Self {
            feed: FeedSettings { url, name, symbols },
            credentials,
            websocket,
            queue,
            batch,
            fanout,
            server,
            health,
            quality_log_path,
            spool_path,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
}

fn parse_env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_duration_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_env_duration_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}
