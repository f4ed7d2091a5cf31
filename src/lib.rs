#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Market Ingest - Real-Time Market Data Pipeline
//!
//! Ingests a WebSocket market data feed, validates and sequences the stream,
//! persists ticker rows in batches, and fans messages out to in-process
//! subscribers. Built so a failure in any one stage degrades the pipeline
//! instead of stopping it.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core message and sequencing types
//!   - `message`: feed message schema and persisted row shape
//!   - `sequence`: per-symbol sequence continuity tracking
//!
//! - **Application**: Port definitions
//!   - `ports`: the storage sink contract
//!
//! - **Infrastructure**: Adapters and pipeline stages
//!   - `feed`: WebSocket client, codec, reconnect policy, liveness watchdog
//!   - `validator`: frame validation, dedup, gap detection, quality log
//!   - `queue`: bounded per-consumer ingestion queue
//!   - `persistence`: batch writer, retry/backlog, storage sinks
//!   - `fanout`: non-blocking broadcast to subscribers
//!   - `config`: environment-based configuration
//!   - `health`: health report and HTTP endpoint
//!
//! # Data Flow
//!
//! ```text
//! Exchange WS ──► Feed Client ──► Validator ──► Ingestion Queue ──┬──► Batch Writer ──► Storage
//!                                     │                           │
//!                                     ▼                           └──► Fan-Out Hub ──► Subscribers
//!                                Quality Log
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core message types with no external system dependencies.
pub mod domain;

/// Application layer - Port definitions.
pub mod application;

/// Infrastructure layer - Adapters and pipeline stages.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::message::{
    FeedMessage, HeartbeatMessage, Level2Message, MalformedFrame, RawFrame, Side, TickRow,
    TickerMessage,
};
pub use domain::sequence::{GapRecord, SequenceOutcome, SequenceTracker};

// Ports
pub use application::ports::{StorageError, StorageSink};

// Infrastructure config
pub use infrastructure::config::{
    BatchSettings, ConfigError, Credentials, FanoutSettings, FeedSettings, HealthSettings,
    IngestConfig, QueueSettings, ServerSettings, WebSocketSettings,
};

// Feed client (for integration tests)
pub use infrastructure::feed::{
    ConnectionState, ConnectionStateCell, FeedClient, FeedClientConfig, FeedClientError,
};

// Pipeline stages (for integration tests)
pub use infrastructure::fanout::{FanoutHub, FanoutPump, Subscription};
pub use infrastructure::persistence::{BatchWriter, JsonlSink, MemorySink, WriterStats};
pub use infrastructure::queue::{IngestQueue, QueueConsumer, QueueStats};
pub use infrastructure::validator::{QualityLog, Validator, ValidatorStats};

// Health server
pub use infrastructure::health::{
    HealthReport, HealthServer, HealthServerError, HealthStatus, PipelineHealth,
};

// Metrics
pub use infrastructure::metrics::{DropReason, init_metrics};

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
