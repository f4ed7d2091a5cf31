//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Exchange feed WebSocket adapter (client, codec, reconnect, liveness).
pub mod feed;

/// Frame validation and sequence tracking.
pub mod validator;

/// Bounded per-consumer ingestion queue.
pub mod queue;

/// Batch persistence writer and storage sinks.
pub mod persistence;

/// Fan-out broadcasting to in-process subscribers.
pub mod fanout;

/// Configuration loaded from environment variables.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;
