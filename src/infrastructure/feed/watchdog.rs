//! Liveness Watchdog
//!
//! Monitors time since the last received frame. Two thresholds apply: past
//! the heartbeat timeout the connection is reported stale (Degraded), and
//! past the connection timeout the watchdog demands a forced disconnect so
//! the client can reconnect.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::config::WebSocketSettings;

/// Configuration for liveness monitoring.
#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// Silence longer than this marks the connection stale.
    pub heartbeat_timeout: Duration,
    /// Silence longer than this forces a disconnect.
    pub connection_timeout: Duration,
    /// How often staleness is checked.
    pub check_interval: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(5),
            connection_timeout: Duration::from_secs(30),
            check_interval: Duration::from_secs(1),
        }
    }
}

impl LivenessConfig {
    /// Create configuration from [`WebSocketSettings`].
    #[must_use]
    pub const fn from_websocket_settings(settings: &WebSocketSettings) -> Self {
        Self {
            heartbeat_timeout: settings.heartbeat_timeout,
            connection_timeout: settings.connection_timeout,
            check_interval: settings.check_interval,
        }
    }
}

/// Events emitted by the watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessEvent {
    /// No frame within the heartbeat timeout; connection is Degraded.
    Stale,
    /// No frame within the connection timeout; force a disconnect.
    Timeout,
}

/// State shared between the watchdog and the feed read loop.
#[derive(Debug)]
pub struct LivenessState {
    last_message: RwLock<Instant>,
    stale_reported: AtomicBool,
}

impl Default for LivenessState {
    fn default() -> Self {
        Self::new()
    }
}

impl LivenessState {
    /// Create new liveness state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_message: RwLock::new(Instant::now()),
            stale_reported: AtomicBool::new(false),
        }
    }

    /// Record that a frame arrived. Clears any stale latch.
    pub fn record_message(&self) {
        *self.last_message.write() = Instant::now();
        self.stale_reported.store(false, Ordering::SeqCst);
    }

    /// Time since the last frame.
    #[must_use]
    pub fn time_since_message(&self) -> Duration {
        self.last_message.read().elapsed()
    }

    /// Latch the stale report; returns `true` the first time only.
    fn try_report_stale(&self) -> bool {
        !self.stale_reported.swap(true, Ordering::SeqCst)
    }

    /// Reset state for a new connection.
    pub fn reset(&self) {
        *self.last_message.write() = Instant::now();
        self.stale_reported.store(false, Ordering::SeqCst);
    }
}

/// Watchdog that periodically checks frame staleness.
///
/// Emits [`LivenessEvent::Stale`] once per silent stretch and
/// [`LivenessEvent::Timeout`] when the silence exceeds the connection
/// timeout, then exits. The read loop owns the response to both events.
pub struct LivenessWatchdog {
    config: LivenessConfig,
    state: Arc<LivenessState>,
    event_tx: mpsc::Sender<LivenessEvent>,
    cancel: CancellationToken,
}

impl LivenessWatchdog {
    /// Create a new watchdog.
    #[must_use]
    pub const fn new(
        config: LivenessConfig,
        state: Arc<LivenessState>,
        event_tx: mpsc::Sender<LivenessEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            event_tx,
            cancel,
        }
    }

    /// Run the monitoring loop until cancelled or a timeout fires.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.config.check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Liveness watchdog cancelled");
                    break;
                }
                _ = interval.tick() => {
                    if self.check().await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    /// Evaluate staleness against both thresholds.
    ///
    /// Returns `Err(())` when the loop should exit.
    async fn check(&self) -> Result<(), ()> {
        let elapsed = self.state.time_since_message();

        if elapsed > self.config.connection_timeout {
            tracing::warn!(
                elapsed_secs = elapsed.as_secs(),
                timeout_secs = self.config.connection_timeout.as_secs(),
                "Connection timeout, forcing disconnect"
            );
            let _ = self.event_tx.send(LivenessEvent::Timeout).await;
            return Err(());
        }

        if elapsed > self.config.heartbeat_timeout && self.state.try_report_stale() {
            tracing::warn!(
                elapsed_secs = elapsed.as_secs(),
                timeout_secs = self.config.heartbeat_timeout.as_secs(),
                "No frames within heartbeat timeout, connection is stale"
            );
            if self.event_tx.send(LivenessEvent::Stale).await.is_err() {
                tracing::debug!("Event channel closed, stopping watchdog");
                return Err(());
            }
        }

        Ok(())
    }
}
