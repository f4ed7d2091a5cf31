//! Exchange Feed Adapter
//!
//! WebSocket connection manager for the exchange feed, plus the wire-format
//! types and codec the validator uses to parse raw frames.
//!
//! # Modules
//!
//! - `messages`: wire envelope and subscription/auth request types
//! - `codec`: raw frame decoding into typed messages
//! - `reconnect`: exponential backoff with jitter and a circuit breaker
//! - `watchdog`: liveness monitoring (Degraded / forced-disconnect events)
//! - `client`: the connection state machine and read loop

/// Wire message types.
pub mod messages;

/// Frame decoding.
pub mod codec;

/// Reconnection policy.
pub mod reconnect;

/// Liveness watchdog.
pub mod watchdog;

/// WebSocket feed client.
pub mod client;

pub use client::{ConnectionState, ConnectionStateCell, FeedClient, FeedClientConfig, FeedClientError};
pub use codec::{DecodedFrame, FeedCodec};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use watchdog::{LivenessConfig, LivenessEvent, LivenessState, LivenessWatchdog};
