//! Feed Message Schema
//!
//! Typed variants for the message kinds the exchange feed produces.
//! These are pure data: parsing lives in the feed codec, sequencing in the
//! validator. Downstream code matches exhaustively, so a new message kind
//! is a compile-time-visible change.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Raw Frames
// =============================================================================

/// An unparsed frame as received from the transport.
///
/// Owned by the connection manager until handed to the validator; dies at
/// parse time.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Raw frame payload.
    pub payload: String,
    /// Local receipt timestamp.
    pub received_at: DateTime<Utc>,
}

impl RawFrame {
    /// Wrap a payload received now.
    #[must_use]
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }
}

// =============================================================================
// Messages
// =============================================================================

/// Order book side for level-2 updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Buy side.
    Bid,
    /// Sell side.
    Ask,
}

impl Side {
    /// Side name as used on the wire and in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bid => "bid",
            Self::Ask => "ask",
        }
    }
}

/// A top-of-book price/volume update for one symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickerMessage {
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
    pub exchange_ts: DateTime<Utc>,
    /// Per-symbol monotonic sequence number.
    pub sequence: u64,
}

/// An incremental change to one price level of the order book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level2Message {
    /// Instrument symbol.
    pub symbol: String,
    /// Book side the level belongs to.
    pub side: Side,
    /// Price of the affected level.
    pub price_level: Decimal,
    /// New size at the level (zero removes it).
    pub size: Decimal,
    /// Per-symbol monotonic sequence number.
    pub sequence: u64,
}

/// Feed liveness signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    /// Exchange-reported timestamp.
    pub exchange_ts: DateTime<Utc>,
}

/// A frame that failed structural validation.
///
/// Logged and counted by the validator, never queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MalformedFrame {
    /// Why the frame was rejected.
    pub reason: String,
    /// The offending payload, truncated for logging.
    pub raw: String,
}

/// A validated (or rejected) feed message.
///
/// Every non-heartbeat, non-malformed message carries a `sequence` scoped
/// per symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedMessage {
    /// Top-of-book update.
    Ticker(TickerMessage),
    /// Order book level change.
    Level2(Level2Message),
    /// Liveness signal.
    Heartbeat(HeartbeatMessage),
    /// Structurally invalid frame.
    Malformed(MalformedFrame),
}

impl FeedMessage {
    /// Symbol this message concerns, if it carries one.
    #[must_use]
    pub fn symbol(&self) -> Option<&str> {
        match self {
            Self::Ticker(t) => Some(&t.symbol),
            Self::Level2(l) => Some(&l.symbol),
            Self::Heartbeat(_) | Self::Malformed(_) => None,
        }
    }

    /// Per-symbol sequence number, if the message kind carries one.
    #[must_use]
    pub const fn sequence(&self) -> Option<u64> {
        match self {
            Self::Ticker(t) => Some(t.sequence),
            Self::Level2(l) => Some(l.sequence),
            Self::Heartbeat(_) | Self::Malformed(_) => None,
        }
    }

    /// Whether this message failed validation.
    #[must_use]
    pub const fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed(_))
    }
}

// =============================================================================
// Persisted Rows
// =============================================================================

/// Row shape accepted by the storage sink, keyed by `(timestamp, symbol)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickRow {
    /// Exchange timestamp; half of the conflict key.
    pub timestamp: DateTime<Utc>,
    /// Instrument symbol; half of the conflict key.
    pub symbol: String,
    /// Last trade price.
    pub price: Decimal,
    /// Trade volume.
    pub volume: Decimal,
    /// Best bid.
    pub bid: Decimal,
    /// Best ask.
    pub ask: Decimal,
    /// Source sequence number, kept for provenance.
    pub sequence: u64,
}

impl TickRow {
    /// The `(timestamp, symbol)` upsert key.
    #[must_use]
    pub fn key(&self) -> (DateTime<Utc>, &str) {
        (self.timestamp, &self.symbol)
    }
}

impl From<TickerMessage> for TickRow {
    fn from(msg: TickerMessage) -> Self {
        Self {
            timestamp: msg.exchange_ts,
            symbol: msg.symbol,
            price: msg.price,
            volume: msg.volume,
            bid: msg.bid,
            ask: msg.ask,
            sequence: msg.sequence,
        }
    }
}
