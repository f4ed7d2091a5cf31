//! Feed Frame Codec
//!
//! Decodes raw frames into typed messages. The feed sends JSON, either a
//! single object or an array of objects, each with a `type` discriminator.
//!
//! Decoding is infallible by design: any structural failure is represented
//! as a [`FeedMessage::Malformed`] value rather than an error, so protocol
//! garbage is counted and dropped without ever crashing the pipeline.

use serde_json::Value;

use super::messages::{SubscriptionAck, WireError, WireHeartbeat, WireLevel2, WireTicker};
use crate::domain::message::{FeedMessage, MalformedFrame, RawFrame};

/// How much of a bad payload is kept for logging.
const RAW_SNIPPET_LEN: usize = 256;

/// One decoded element of a frame.
#[derive(Debug, Clone)]
pub enum DecodedFrame {
    /// A data message (including `Malformed`).
    Message(FeedMessage),
    /// Subscription confirmation.
    SubscriptionAck(SubscriptionAck),
    /// Exchange-reported error frame.
    FeedError(WireError),
}

/// JSON codec for the exchange feed.
#[derive(Debug, Default, Clone)]
pub struct FeedCodec;

impl FeedCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode a raw frame into typed messages.
    ///
    /// A frame may carry a single message object or an array of them.
    #[must_use]
    pub fn decode(&self, frame: &RawFrame) -> Vec<DecodedFrame> {
        let value: Value = match serde_json::from_str(&frame.payload) {
            Ok(v) => v,
            Err(e) => {
                return vec![malformed(
                    format!("invalid JSON: {e}"),
                    &frame.payload,
                )];
            }
        };

        match value {
            Value::Array(items) => items
                .into_iter()
                .map(|item| Self::decode_value(item, &frame.payload))
                .collect(),
            other @ Value::Object(_) => vec![Self::decode_value(other, &frame.payload)],
            _ => vec![malformed(
                "expected JSON object or array".to_string(),
                &frame.payload,
            )],
        }
    }

    fn decode_value(value: Value, payload: &str) -> DecodedFrame {
        let Some(kind) = value.get("type").and_then(Value::as_str) else {
            return malformed("missing `type` field".to_string(), payload);
        };

        match kind {
            "ticker" => match serde_json::from_value::<WireTicker>(value) {
                Ok(t) => DecodedFrame::Message(FeedMessage::from(t)),
                Err(e) => malformed(format!("invalid ticker: {e}"), payload),
            },
            "l2update" => match serde_json::from_value::<WireLevel2>(value) {
                Ok(l) => DecodedFrame::Message(FeedMessage::from(l)),
                Err(e) => malformed(format!("invalid l2update: {e}"), payload),
            },
            "heartbeat" => match serde_json::from_value::<WireHeartbeat>(value) {
                Ok(h) => DecodedFrame::Message(FeedMessage::from(h)),
                Err(e) => malformed(format!("invalid heartbeat: {e}"), payload),
            },
            "subscriptions" => match serde_json::from_value::<SubscriptionAck>(value) {
                Ok(ack) => DecodedFrame::SubscriptionAck(ack),
                Err(e) => malformed(format!("invalid subscription ack: {e}"), payload),
            },
            "error" => match serde_json::from_value::<WireError>(value) {
                Ok(err) => DecodedFrame::FeedError(err),
                Err(e) => malformed(format!("invalid error frame: {e}"), payload),
            },
            other => malformed(format!("unknown message kind: {other}"), payload),
        }
    }
}

fn malformed(reason: String, payload: &str) -> DecodedFrame {
    let mut cut = RAW_SNIPPET_LEN.min(payload.len());
    while !payload.is_char_boundary(cut) {
        cut -= 1;
    }
    let raw = payload[..cut].to_string();
    DecodedFrame::Message(FeedMessage::Malformed(MalformedFrame { reason, raw }))
}
