//! Sequence Continuity Tracking
//!
//! Tracks the last-seen sequence number per symbol so the validator can
//! classify incoming messages as in-order, duplicate, or gapped. The tracker
//! is owned by exactly one task (the validator) and needs no locking.
//!
//! A gap never causes a message to be discarded: the message is accepted and
//! a [`GapRecord`] documents the discontinuity so downstream consumers never
//! silently treat a value as the immediate successor of a different value.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classification of an observed sequence number relative to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceOutcome {
    /// First message ever seen for this symbol.
    FirstSeen,
    /// Exactly `last + 1`.
    InOrder,
    /// At or below the last-seen sequence; expected on reconnect replay.
    Duplicate,
    /// Above `last + 1`; one or more messages were missed.
    Gap {
        /// The sequence number that was expected (`last + 1`).
        expected: u64,
    },
}

/// A detected sequence discontinuity, written to the append-only quality log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapRecord {
    /// Symbol the gap was observed on.
    pub symbol: String,
    /// Sequence number that was expected.
    pub expected_sequence: u64,
    /// Sequence number that actually arrived.
    pub observed_sequence: u64,
    /// Local detection time.
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct SymbolCursor {
    sequence: u64,
    seen_at: DateTime<Utc>,
}

/// Per-symbol last-seen sequence state.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    cursors: HashMap<String, SymbolCursor>,
}

impl SequenceTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify `sequence` for `symbol` and advance the cursor.
    ///
    /// Duplicates do not move the cursor. Gapped sequences advance the cursor
    /// to the observed value so a replayed range is still deduplicated.
    pub fn observe(&mut self, symbol: &str, sequence: u64) -> SequenceOutcome {
        let now = Utc::now();
        match self.cursors.get_mut(symbol) {
            None => {
                self.cursors.insert(
                    symbol.to_string(),
                    SymbolCursor {
                        sequence,
                        seen_at: now,
                    },
                );
                SequenceOutcome::FirstSeen
            }
            Some(cursor) if sequence <= cursor.sequence => SequenceOutcome::Duplicate,
            Some(cursor) => {
                let expected = cursor.sequence + 1;
                cursor.sequence = sequence;
                cursor.seen_at = now;
                if sequence == expected {
                    SequenceOutcome::InOrder
                } else {
                    SequenceOutcome::Gap { expected }
                }
            }
        }
    }

    /// Last-seen sequence for a symbol, if any.
    #[must_use]
    pub fn last_sequence(&self, symbol: &str) -> Option<u64> {
        self.cursors.get(symbol).map(|c| c.sequence)
    }

    /// Wall-clock time the symbol was last seen, if ever.
    #[must_use]
    pub fn last_seen_at(&self, symbol: &str) -> Option<DateTime<Utc>> {
        self.cursors.get(symbol).map(|c| c.seen_at)
    }

    /// Number of symbols with recorded cursors.
    #[must_use]
    pub fn symbol_count(&self) -> usize {
        self.cursors.len()
    }
}
