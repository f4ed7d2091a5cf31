//! Feed Wire Message Types
//!
//! Wire format for the exchange feed. Every data message carries a `type`
//! discriminator, the symbol it concerns, a per-symbol monotonic `sequence`
//! number, and an exchange-reported timestamp.
//!
//! # Message Kinds
//!
//! - `ticker`: top-of-book price/volume update
//! - `l2update`: one order-book level change
//! - `heartbeat`: liveness signal
//! - `subscriptions`: subscription confirmation (control)
//! - `error`: exchange-reported error (control)

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::message::{
    FeedMessage, HeartbeatMessage, Level2Message, Side, TickerMessage,
};

// =============================================================================
// Data Messages
// =============================================================================

/// Wire form of a ticker update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireTicker {
    /// Instrument symbol.
    pub symbol: String,
    /// Last trade price.
    pub price: Decimal,
    /// Trade volume.
    pub volume: Decimal,
    /// Best bid.
    pub bid: Decimal,
    /// Best ask.
    pub ask: Decimal,
    /// Exchange-reported timestamp.
    pub time: DateTime<Utc>,
    /// Per-symbol monotonic sequence number.
    pub sequence: u64,
}

impl From<WireTicker> for FeedMessage {
    fn from(w: WireTicker) -> Self {
        Self::Ticker(TickerMessage {
            symbol: w.symbol,
            price: w.price,
            volume: w.volume,
            bid: w.bid,
            ask: w.ask,
            exchange_ts: w.time,
            sequence: w.sequence,
        })
    }
}

/// Wire form of a level-2 update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireLevel2 {
    /// Instrument symbol.
    pub symbol: String,
    /// Book side.
    pub side: Side,
    /// Affected price level.
    pub price: Decimal,
    /// New size at the level.
    pub size: Decimal,
    /// Per-symbol monotonic sequence number.
    pub sequence: u64,
}

impl From<WireLevel2> for FeedMessage {
    fn from(w: WireLevel2) -> Self {
        Self::Level2(Level2Message {
            symbol: w.symbol,
            side: w.side,
            price_level: w.price,
            size: w.size,
            sequence: w.sequence,
        })
    }
}

/// Wire form of a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireHeartbeat {
    /// Exchange-reported timestamp.
    pub time: DateTime<Utc>,
}

impl From<WireHeartbeat> for FeedMessage {
    fn from(w: WireHeartbeat) -> Self {
        Self::Heartbeat(HeartbeatMessage { exchange_ts: w.time })
    }
}

// =============================================================================
// Control Messages
// =============================================================================

/// Subscription confirmation sent by the exchange after a subscribe request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionAck {
    /// Channels the exchange acknowledged.
    pub channels: Vec<String>,
    /// Symbols the exchange acknowledged.
    pub symbols: Vec<String>,
}

/// Error frame sent by the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    /// Human-readable error message.
    pub message: String,
    /// Optional exchange error code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
}

// =============================================================================
// Outbound Requests
// =============================================================================

/// Channels this pipeline subscribes to.
pub const SUBSCRIBED_CHANNELS: [&str; 3] = ["ticker", "level2", "heartbeat"];

/// Subscription request enumerating channels and symbols.
#[derive(Debug, Clone, Serialize)]
pub struct SubscribeRequest {
    /// Operation name, always `"subscribe"`.
    pub op: &'static str,
    /// Requested channels.
    pub channels: Vec<String>,
    /// Requested symbols.
    pub symbols: Vec<String>,
}

impl SubscribeRequest {
    /// Build a subscribe request for the standard channel set.
    #[must_use]
    pub fn new(symbols: Vec<String>) -> Self {
        Self {
            op: "subscribe",
            channels: SUBSCRIBED_CHANNELS.iter().map(ToString::to_string).collect(),
            symbols,
        }
    }
}

/// Authentication request, sent before subscribing on authenticated feeds.
#[derive(Debug, Clone, Serialize)]
pub struct AuthRequest {
    /// Operation name, always `"auth"`.
    pub op: &'static str,
    /// API key.
    pub key: String,
    /// API secret.
    pub secret: String,
}

impl AuthRequest {
    /// Build an auth request.
    #[must_use]
    pub const fn new(key: String, secret: String) -> Self {
        Self {
            op: "auth",
            key,
            secret,
        }
    }
}
