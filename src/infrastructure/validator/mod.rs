//! Frame Validator and Sequencer
//!
//! Sits between the feed client and the ingestion queue. Decodes raw frames,
//! rejects malformed ones, drops duplicates, and detects per-symbol sequence
//! gaps. Gapped messages are still accepted: the gap is recorded in the
//! quality log and the stream moves on, because fresh data matters more than
//! a complete history.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::message::{FeedMessage, RawFrame};
use crate::domain::sequence::{GapRecord, SequenceOutcome, SequenceTracker};
use crate::infrastructure::feed::{DecodedFrame, FeedCodec};
use crate::infrastructure::metrics::{self, DropReason};
use crate::infrastructure::queue::IngestQueue;

// =============================================================================
// Quality Log
// =============================================================================

/// Append-only JSONL log of sequence gaps.
///
/// One [`GapRecord`] per line, flushed on every append so records survive a
/// crash. Write failures are logged and swallowed: data quality bookkeeping
/// must never take down ingestion.
#[derive(Debug)]
pub struct QualityLog {
    writer: parking_lot::Mutex<BufWriter<File>>,
}

impl QualityLog {
    /// Open (or create) the quality log at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory or the file cannot be
    /// created.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: parking_lot::Mutex::new(BufWriter::new(file)),
        })
    }

    /// Append one gap record.
    pub fn append(&self, record: &GapRecord) {
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize gap record");
                return;
            }
        };

        let mut writer = self.writer.lock();
        if let Err(e) = writeln!(writer, "{line}").and_then(|()| writer.flush()) {
            tracing::error!(error = %e, "Failed to append to quality log");
        }
    }
}

// =============================================================================
// Validator Stats
// =============================================================================

/// Shared validator counters, read by health reporting.
#[derive(Debug, Default)]
pub struct ValidatorStats {
    accepted: AtomicU64,
    malformed: AtomicU64,
    duplicates: AtomicU64,
    gaps: AtomicU64,
    heartbeats: AtomicU64,
}

impl ValidatorStats {
    /// Messages accepted into the queue.
    #[must_use]
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Frames rejected as malformed.
    #[must_use]
    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Messages dropped as duplicates.
    #[must_use]
    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    /// Sequence gaps detected.
    #[must_use]
    pub fn gaps(&self) -> u64 {
        self.gaps.load(Ordering::Relaxed)
    }

    /// Heartbeats observed.
    #[must_use]
    pub fn heartbeats(&self) -> u64 {
        self.heartbeats.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Validator
// =============================================================================

/// Decodes, validates, and sequences raw frames into the ingestion queue.
pub struct Validator {
    codec: FeedCodec,
    tracker: SequenceTracker,
    queue: IngestQueue,
    quality_log: QualityLog,
    stats: Arc<ValidatorStats>,
}

impl Validator {
    /// Create a validator feeding `queue` and logging gaps to `quality_log`.
    #[must_use]
    pub fn new(queue: IngestQueue, quality_log: QualityLog, stats: Arc<ValidatorStats>) -> Self {
        Self {
            codec: FeedCodec::new(),
            tracker: SequenceTracker::new(),
            queue,
            quality_log,
            stats,
        }
    }

    /// Run the validation loop until the frame channel closes or the token
    /// is cancelled.
    pub async fn run(mut self, mut frame_rx: mpsc::Receiver<RawFrame>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!("Validator cancelled");
                    break;
                }
                frame = frame_rx.recv() => {
                    match frame {
                        Some(frame) => self.process_frame(&frame),
                        None => {
                            tracing::info!("Frame channel closed, validator stopping");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Decode one raw frame and route every message it contains.
    pub fn process_frame(&mut self, frame: &RawFrame) {
        for decoded in self.codec.decode(frame) {
            match decoded {
                DecodedFrame::Message(msg) => self.process_message(msg),
                DecodedFrame::SubscriptionAck(ack) => {
                    tracing::info!(
                        channels = ?ack.channels,
                        symbols = ?ack.symbols,
                        "Subscription confirmed"
                    );
                }
                DecodedFrame::FeedError(err) => {
                    tracing::warn!(code = ?err.code, message = %err.message, "Feed error");
                }
            }
        }
    }

    fn process_message(&mut self, msg: FeedMessage) {
        match &msg {
            FeedMessage::Malformed(bad) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                metrics::record_drops(DropReason::Malformed, 1);
                tracing::warn!(reason = %bad.reason, raw = %bad.raw, "Dropping malformed frame");
                return;
            }
            FeedMessage::Heartbeat(_) => {
                // Heartbeats prove liveness but carry no market data.
                self.stats.heartbeats.fetch_add(1, Ordering::Relaxed);
                return;
            }
            FeedMessage::Ticker(_) | FeedMessage::Level2(_) => {}
        }

        // Ticker and Level2 always carry a symbol and sequence.
        let (Some(symbol), Some(sequence)) = (msg.symbol(), msg.sequence()) else {
            return;
        };

        match self.tracker.observe(symbol, sequence) {
            SequenceOutcome::Duplicate => {
                self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                metrics::record_drops(DropReason::Duplicate, 1);
                tracing::debug!(symbol, sequence, "Dropping duplicate message");
                return;
            }
            SequenceOutcome::Gap { expected } => {
                self.stats.gaps.fetch_add(1, Ordering::Relaxed);
                metrics::record_gap(symbol);
                tracing::warn!(
                    symbol,
                    expected_sequence = expected,
                    observed_sequence = sequence,
                    "Sequence gap detected"
                );
                self.quality_log.append(&GapRecord {
                    symbol: symbol.to_string(),
                    expected_sequence: expected,
                    observed_sequence: sequence,
                    detected_at: Utc::now(),
                });
            }
            SequenceOutcome::FirstSeen | SequenceOutcome::InOrder => {}
        }

        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        metrics::record_message_ingested(symbol);
        self.queue.push(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::queue::QueueConsumer;

    fn ticker_frame(symbol: &str, sequence: u64) -> RawFrame {
        RawFrame::new(format!(
            r#"{{"type":"ticker","symbol":"{symbol}","price":"100.0","volume":"1.0","bid":"99.9","ask":"100.1","time":"2026-01-05T10:00:00Z","sequence":{sequence}}}"#
        ))
    }

    fn setup(dir: &tempfile::TempDir) -> (Validator, QueueConsumer, Arc<ValidatorStats>) {
        let queue = IngestQueue::new(100);
        let consumer = queue.register("test");
        let stats = Arc::new(ValidatorStats::default());
        let quality_log = QualityLog::open(&dir.path().join("gaps.jsonl")).unwrap();
        let validator = Validator::new(queue, quality_log, Arc::clone(&stats));
        (validator, consumer, stats)
    }

    fn read_gap_records(dir: &tempfile::TempDir) -> Vec<GapRecord> {
        let contents = std::fs::read_to_string(dir.path().join("gaps.jsonl")).unwrap();
        contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn in_order_messages_are_queued() {
        let dir = tempfile::tempdir().unwrap();
        let (mut validator, consumer, stats) = setup(&dir);

        validator.process_frame(&ticker_frame("BTC-USD", 1));
        validator.process_frame(&ticker_frame("BTC-USD", 2));

        assert_eq!(consumer.len(), 2);
        assert_eq!(stats.accepted(), 2);
        assert_eq!(stats.gaps(), 0);
    }

    #[test]
    fn gap_is_recorded_and_message_still_queued() {
        let dir = tempfile::tempdir().unwrap();
        let (mut validator, consumer, stats) = setup(&dir);

        validator.process_frame(&ticker_frame("BTC-USD", 5));
        validator.process_frame(&ticker_frame("BTC-USD", 8));

        // Both messages flow through; the gap is bookkeeping only.
        assert_eq!(consumer.len(), 2);
        assert_eq!(stats.gaps(), 1);

        let records = read_gap_records(&dir);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].symbol, "BTC-USD");
        assert_eq!(records[0].expected_sequence, 6);
        assert_eq!(records[0].observed_sequence, 8);
    }

    #[test]
    fn duplicates_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (mut validator, consumer, stats) = setup(&dir);

        validator.process_frame(&ticker_frame("BTC-USD", 7));
        validator.process_frame(&ticker_frame("BTC-USD", 7));
        validator.process_frame(&ticker_frame("BTC-USD", 3));

        assert_eq!(consumer.len(), 1);
        assert_eq!(stats.duplicates(), 2);
        assert!(read_gap_records(&dir).is_empty());
    }

    #[test]
    fn sequences_are_tracked_per_symbol() {
        let dir = tempfile::tempdir().unwrap();
        let (mut validator, consumer, stats) = setup(&dir);

        validator.process_frame(&ticker_frame("BTC-USD", 10));
        validator.process_frame(&ticker_frame("ETH-USD", 1));
        validator.process_frame(&ticker_frame("ETH-USD", 2));

        assert_eq!(consumer.len(), 3);
        assert_eq!(stats.gaps(), 0);
    }

    #[test]
    fn malformed_frames_are_counted_and_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (mut validator, consumer, stats) = setup(&dir);

        validator.process_frame(&RawFrame::new("{broken"));
        validator.process_frame(&RawFrame::new(r#"{"type":"mystery"}"#));

        assert!(consumer.is_empty());
        assert_eq!(stats.malformed(), 2);
    }

    #[test]
    fn heartbeats_are_counted_but_not_queued() {
        let dir = tempfile::tempdir().unwrap();
        let (mut validator, consumer, stats) = setup(&dir);

        validator.process_frame(&RawFrame::new(
            r#"{"type":"heartbeat","time":"2026-01-05T10:00:00Z"}"#,
        ));

        assert!(consumer.is_empty());
        assert_eq!(stats.heartbeats(), 1);
    }

    #[tokio::test]
    async fn run_loop_processes_until_channel_closes() {
        let dir = tempfile::tempdir().unwrap();
        let (validator, consumer, stats) = setup(&dir);

        let (frame_tx, frame_rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(validator.run(frame_rx, cancel));

        frame_tx.send(ticker_frame("BTC-USD", 1)).await.unwrap();
        frame_tx.send(ticker_frame("BTC-USD", 2)).await.unwrap();
        drop(frame_tx);

        handle.await.unwrap();
        assert_eq!(consumer.len(), 2);
        assert_eq!(stats.accepted(), 2);
    }
}
