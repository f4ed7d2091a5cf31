//! WebSocket Feed Client
//!
//! Owns the connection lifecycle for the exchange feed: connect, optional
//! auth, subscribe, stream, reconnect with backoff, and forced disconnects
//! when the liveness watchdog fires. Raw frames are forwarded untouched;
//! parsing and validation happen downstream so a slow parser can never stall
//! the socket.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::codec::{DecodedFrame, FeedCodec};
use super::messages::{AuthRequest, SubscribeRequest};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use super::watchdog::{LivenessConfig, LivenessEvent, LivenessState, LivenessWatchdog};
use crate::domain::message::RawFrame;
use crate::infrastructure::config::{Credentials, IngestConfig};
use crate::infrastructure::metrics;

// =============================================================================
// Connection State
// =============================================================================

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket open.
    Disconnected,
    /// TCP/TLS handshake in progress.
    Connecting,
    /// Socket open, auth/subscribe sent, waiting for data.
    Subscribing,
    /// Receiving messages normally.
    Streaming,
    /// Connected but silent past the heartbeat timeout.
    Degraded,
    /// Shutdown in progress.
    Closing,
}

impl ConnectionState {
    /// Human-readable state name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Subscribing => "subscribing",
            Self::Streaming => "streaming",
            Self::Degraded => "degraded",
            Self::Closing => "closing",
        }
    }

    /// Numeric encoding exported on the connection state gauge.
    #[must_use]
    pub const fn gauge_value(self) -> f64 {
        match self {
            Self::Disconnected => 0.0,
            Self::Connecting => 1.0,
            Self::Subscribing => 2.0,
            Self::Streaming => 3.0,
            Self::Degraded => 4.0,
            Self::Closing => 5.0,
        }
    }
}

/// Shared, readable connection state.
///
/// The feed client is the only writer; health reporting and tests read it.
#[derive(Debug)]
pub struct ConnectionStateCell {
    state: parking_lot::RwLock<ConnectionState>,
    reconnects: AtomicU64,
    last_message_ms: AtomicI64,
}

impl Default for ConnectionStateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateCell {
    /// Create a cell in the `Disconnected` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: parking_lot::RwLock::new(ConnectionState::Disconnected),
            reconnects: AtomicU64::new(0),
            last_message_ms: AtomicI64::new(0),
        }
    }

    /// Read the current state.
    #[must_use]
    pub fn get(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Replace the current state.
    pub fn set(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    /// Record a reconnection attempt.
    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Reconnection attempts since startup.
    #[must_use]
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Record that a frame arrived on the connection.
    pub fn record_message(&self) {
        self.last_message_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Seconds since the last frame, or `None` before the first one.
    #[must_use]
    pub fn seconds_since_last_message(&self) -> Option<u64> {
        let last = self.last_message_ms.load(Ordering::Relaxed);
        if last == 0 {
            return None;
        }
        let elapsed_ms = (Utc::now().timestamp_millis() - last).max(0);
        #[allow(clippy::cast_sign_loss)]
        Some(elapsed_ms as u64 / 1000)
    }
}

// =============================================================================
// Error Type
// =============================================================================

/// Errors that can occur in the feed client.
#[derive(Debug, thiserror::Error)]
pub enum FeedClientError {
    /// WebSocket connection failed.
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Downstream frame channel closed.
    #[error("frame channel closed")]
    ChannelClosed,

    /// Connection closed by the server or by liveness timeout.
    #[error("connection closed")]
    ConnectionClosed,

    /// Circuit breaker opened after too many consecutive failures.
    #[error("reconnect circuit breaker open after {0} consecutive failures")]
    CircuitBreakerOpen(u32),
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the feed client.
#[derive(Debug, Clone)]
pub struct FeedClientConfig {
    /// WebSocket URL.
    pub url: String,
    /// Logical feed name, used as the metric label.
    pub name: String,
    /// Symbols to subscribe to.
    pub symbols: Vec<String>,
    /// Optional credentials; unauthenticated feeds leave this unset.
    pub credentials: Option<Credentials>,
    /// Reconnection configuration.
    pub reconnect: ReconnectConfig,
    /// Liveness configuration.
    pub liveness: LivenessConfig,
}

impl FeedClientConfig {
    /// Build client configuration from the pipeline configuration.
    #[must_use]
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            url: config.feed.url.clone(),
            name: config.feed.name.clone(),
            symbols: config.feed.symbols.clone(),
            credentials: config.credentials.clone(),
            reconnect: ReconnectConfig::from_websocket_settings(&config.websocket),
            liveness: LivenessConfig::from_websocket_settings(&config.websocket),
        }
    }
}

// =============================================================================
// Feed Client
// =============================================================================

/// WebSocket client for the exchange feed.
///
/// Manages the connection lifecycle:
/// - optional authentication, then subscription
/// - liveness monitoring with Degraded reporting and forced disconnects
/// - automatic reconnection with exponential backoff and a circuit breaker
pub struct FeedClient {
    config: FeedClientConfig,
    state: Arc<ConnectionStateCell>,
    frame_tx: mpsc::Sender<RawFrame>,
    cancel: CancellationToken,
    codec: FeedCodec,
}

impl FeedClient {
    /// Create a new feed client.
    #[must_use]
    pub const fn new(
        config: FeedClientConfig,
        state: Arc<ConnectionStateCell>,
        frame_tx: mpsc::Sender<RawFrame>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            frame_tx,
            cancel,
            codec: FeedCodec::new(),
        }
    }

    /// Run the connection loop until cancelled or the circuit breaker opens.
    pub async fn run(self: Arc<Self>) -> Result<(), FeedClientError> {
        let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());

        loop {
            if self.cancel.is_cancelled() {
                self.transition(ConnectionState::Disconnected);
                tracing::info!("Feed client cancelled");
                return Ok(());
            }

            match self.connect_and_stream(&mut policy).await {
                Ok(()) => {
                    self.transition(ConnectionState::Disconnected);
                    tracing::info!("Feed connection closed gracefully");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Feed connection error");
                    self.transition(ConnectionState::Disconnected);

                    if let Some(delay) = policy.next_delay() {
                        tracing::info!(
                            consecutive_failures = policy.consecutive_failures(),
                            delay_ms = delay.as_millis(),
                            "Reconnecting to feed"
                        );
                        self.state.record_reconnect();
                        metrics::record_reconnect(&self.config.name);

                        tokio::select! {
                            () = self.cancel.cancelled() => {
                                tracing::info!("Feed client cancelled during reconnect delay");
                                return Ok(());
                            }
                            () = tokio::time::sleep(delay) => {}
                        }
                    } else {
                        let failures = policy.consecutive_failures();
                        tracing::error!(
                            consecutive_failures = failures,
                            "Reconnect circuit breaker open, manual intervention required"
                        );
                        return Err(FeedClientError::CircuitBreakerOpen(failures));
                    }
                }
            }
        }
    }

    /// Connect, subscribe, and stream frames until error or cancellation.
    async fn connect_and_stream(
        &self,
        policy: &mut ReconnectPolicy,
    ) -> Result<(), FeedClientError> {
        self.transition(ConnectionState::Connecting);
        metrics::record_connection_attempt(&self.config.name);
        tracing::info!(url = %self.config.url, "Connecting to feed");

        let (ws_stream, _response) = tokio_tungstenite::connect_async(&self.config.url).await?;
        let (mut write, mut read) = ws_stream.split();

        self.transition(ConnectionState::Subscribing);

        if let Some(credentials) = &self.config.credentials {
            let auth = AuthRequest::new(
                credentials.api_key().to_string(),
                credentials.api_secret().to_string(),
            );
            send_json(&mut write, &auth).await?;
        }

        let subscribe = SubscribeRequest::new(self.config.symbols.clone());
        send_json(&mut write, &subscribe).await?;
        tracing::debug!(symbols = ?self.config.symbols, "Sent subscribe request");

        let liveness = Arc::new(LivenessState::new());
        let (liveness_tx, mut liveness_rx) = mpsc::channel::<LivenessEvent>(10);
        let watchdog_cancel = CancellationToken::new();
        let watchdog = LivenessWatchdog::new(
            self.config.liveness.clone(),
            Arc::clone(&liveness),
            liveness_tx,
            watchdog_cancel.clone(),
        );
        let _watchdog_handle = tokio::spawn(watchdog.run());

        let result = loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    self.transition(ConnectionState::Closing);
                    break Ok(());
                }
                event = liveness_rx.recv() => {
                    match event {
                        Some(LivenessEvent::Stale) => {
                            if self.state.get() == ConnectionState::Streaming {
                                self.transition(ConnectionState::Degraded);
                            }
                        }
                        Some(LivenessEvent::Timeout) => {
                            break Err(FeedClientError::ConnectionClosed);
                        }
                        None => {
                            tracing::debug!("Watchdog channel closed");
                        }
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            liveness.record_message();
                            self.state.record_message();

                            let frame = RawFrame::new(text.as_str());

                            // Only a frame the protocol recognizes proves the
                            // subscription is live again; garbage must not
                            // reset the reconnect policy.
                            match self.state.get() {
                                ConnectionState::Subscribing | ConnectionState::Degraded
                                    if self.frame_is_valid(&frame) =>
                                {
                                    self.transition(ConnectionState::Streaming);
                                    policy.reset();
                                }
                                _ => {}
                            }

                            if self.frame_tx.send(frame).await.is_err() {
                                break Err(FeedClientError::ChannelClosed);
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            liveness.record_message();
                            self.state.record_message();
                            if let Err(e) = write.send(Message::Pong(data)).await {
                                break Err(e.into());
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            liveness.record_message();
                        }
                        Some(Ok(Message::Close(_))) => {
                            tracing::info!("Server sent close frame");
                            break Err(FeedClientError::ConnectionClosed);
                        }
                        Some(Ok(_)) => {
                            // Ignore binary and raw frames.
                        }
                        Some(Err(e)) => {
                            break Err(e.into());
                        }
                        None => {
                            tracing::info!("WebSocket stream ended");
                            break Err(FeedClientError::ConnectionClosed);
                        }
                    }
                }
            }
        };

        watchdog_cancel.cancel();
        // This point is only reached after the socket was established.
        metrics::record_disconnect(&self.config.name);
        result
    }

    /// Whether a frame decodes to at least one well-formed feed message.
    fn frame_is_valid(&self, frame: &RawFrame) -> bool {
        self.codec.decode(frame).iter().any(|decoded| match decoded {
            DecodedFrame::Message(msg) => !msg.is_malformed(),
            DecodedFrame::SubscriptionAck(_) => true,
            DecodedFrame::FeedError(_) => false,
        })
    }

    /// Update the shared state cell and the connection state gauge.
    fn transition(&self, state: ConnectionState) {
        tracing::debug!(state = state.as_str(), "Connection state changed");
        self.state.set(state);
        metrics::record_connection_state(&self.config.name, state);
    }
}

async fn send_json<W, T>(write: &mut W, value: &T) -> Result<(), FeedClientError>
where
    W: SinkExt<Message> + Unpin,
    W::Error: std::fmt::Display,
    T: serde::Serialize,
{
    let json = serde_json::to_string(value)
        .map_err(|e| FeedClientError::ConnectionFailed(format!("failed to serialize: {e}")))?;
    write
        .send(Message::Text(json.into()))
        .await
        .map_err(|e| FeedClientError::ConnectionFailed(format!("failed to send: {e}")))?;
    Ok(())
}
