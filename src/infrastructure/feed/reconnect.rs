//! Reconnection Policy
//!
//! Exponential backoff with jitter for WebSocket reconnection, plus a circuit
//! breaker that stops reconnecting after too many consecutive failures. The
//! breaker stays open until an operator restarts the process; the health
//! endpoint reports the pipeline as failing while it is open.

use std::time::Duration;

use rand::Rng;

use crate::infrastructure::config::WebSocketSettings;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Maximum delay between reconnection attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 doubles each attempt).
    pub multiplier: f64,
    /// Jitter factor as a fraction (e.g., 0.1 = ±10% randomization).
    pub jitter_factor: f64,
    /// Consecutive failures before the circuit breaker opens (0 = never).
    pub max_consecutive_failures: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_consecutive_failures: 10,
        }
    }
}

impl ReconnectConfig {
    /// Create configuration from [`WebSocketSettings`].
    #[must_use]
    pub const fn from_websocket_settings(settings: &WebSocketSettings) -> Self {
        Self {
            initial_delay: settings.reconnect_delay_initial,
            max_delay: settings.reconnect_delay_max,
            multiplier: settings.reconnect_delay_multiplier,
            jitter_factor: 0.1,
            max_consecutive_failures: settings.max_consecutive_failures,
        }
    }
}

/// Reconnection policy implementing exponential backoff with jitter and a
/// consecutive-failure circuit breaker.
///
/// Call [`next_delay`](Self::next_delay) after each failed connection attempt
/// and [`reset`](Self::reset) once a connection reaches a healthy streaming
/// state. A `None` delay means the breaker has opened.
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    current_delay: Duration,
    consecutive_failures: u32,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        let initial_delay = config.initial_delay;
        Self {
            config,
            current_delay: initial_delay,
            consecutive_failures: 0,
        }
    }

    /// Record a failure and get the delay before the next attempt.
    ///
    /// Returns `None` once the circuit breaker has opened.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_circuit_open() {
            return None;
        }

        self.consecutive_failures += 1;
        if self.is_circuit_open() {
            return None;
        }

        let delay_with_jitter = self.apply_jitter(self.current_delay);

        #[allow(clippy::cast_precision_loss)]
        let scaled = (self.current_delay.as_millis() as f64 * self.config.multiplier).round();
        let next_millis = if scaled.is_finite() && scaled > 0.0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                scaled as u128
            }
        } else {
            0
        };
        let capped = next_millis.min(self.config.max_delay.as_millis());
        let capped_u64 = u64::try_from(capped).unwrap_or(u64::MAX);
        self.current_delay = Duration::from_millis(capped_u64);

        Some(delay_with_jitter)
    }

    /// Reset the policy after a connection reaches streaming state.
    pub const fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
        self.consecutive_failures = 0;
    }

    /// Get the current consecutive failure count.
    #[must_use]
    pub const fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Check whether the circuit breaker has opened.
    #[must_use]
    pub const fn is_circuit_open(&self) -> bool {
        self.config.max_consecutive_failures > 0
            && self.consecutive_failures >= self.config.max_consecutive_failures
    }

    /// Apply jitter to a duration.
    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let mut rng = rand::rng();
        let jitter: f64 = rng.random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted_u64 = adjusted_millis as u64;
        Duration::from_millis(adjusted_u64)
    }
}
