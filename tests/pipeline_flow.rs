//! Pipeline Flow Integration Tests
//!
//! Exercises the validator, ingestion queue, batch writer, and fan-out hub
//! wired together the way the binary wires them, without a live feed.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;

use market_ingest::{
    BatchSettings, BatchWriter, ConnectionState, ConnectionStateCell, FanoutHub, FanoutPump,
    GapRecord, HealthStatus, IngestQueue, MemorySink, PipelineHealth, QualityLog, RawFrame,
    StorageError, StorageSink, TickRow, Validator, ValidatorStats, WriterStats,
};

fn ticker_frame(symbol: &str, sequence: u64) -> RawFrame {
    // Millisecond offset keeps (timestamp, symbol) keys distinct per sequence.
    let ms = sequence % 1000;
    RawFrame::new(format!(
        r#"{{"type":"ticker","symbol":"{symbol}","price":"42000.5","volume":"0.25","bid":"42000.0","ask":"42001.0","time":"2026-01-05T10:00:00.{ms:03}Z","sequence":{sequence}}}"#
    ))
}

fn batch_settings() -> BatchSettings {
    BatchSettings {
        max_rows: 100,
        max_flush_interval: Duration::from_millis(50),
        max_retries: 3,
        retry_backoff_initial: Duration::from_millis(10),
        retry_backoff_max: Duration::from_millis(40),
        max_backlog_rows: 1000,
        drain_deadline: Duration::from_secs(1),
    }
}

async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn read_gap_records(path: &std::path::Path) -> Vec<GapRecord> {
    let contents = std::fs::read_to_string(path).unwrap();
    contents
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

/// Sink that fails a configurable number of times before delegating to an
/// inner [`MemorySink`].
struct FlakySink {
    inner: MemorySink,
    remaining_failures: AtomicU32,
}

impl FlakySink {
    fn failing(times: u32) -> Self {
        Self {
            inner: MemorySink::new(),
            remaining_failures: AtomicU32::new(times),
        }
    }
}

#[async_trait::async_trait]
impl StorageSink for FlakySink {
    async fn write_rows(&self, rows: &[TickRow]) -> Result<(), StorageError> {
        let remaining = self.remaining_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining_failures
                .store(remaining - 1, Ordering::SeqCst);
            return Err(StorageError::Unavailable("simulated outage".to_string()));
        }
        self.inner.write_rows(rows).await
    }
}

#[tokio::test]
async fn gap_is_logged_and_gapped_message_still_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let gap_path = dir.path().join("gaps.jsonl");

    let queue = IngestQueue::new(100);
    let writer_consumer = queue.register("persistence");
    let stats = Arc::new(ValidatorStats::default());
    let validator = Validator::new(
        queue.clone(),
        QualityLog::open(&gap_path).unwrap(),
        Arc::clone(&stats),
    );

    let sink = Arc::new(MemorySink::new());
    let writer_stats = Arc::new(WriterStats::default());
    let cancel = CancellationToken::new();
    let writer = BatchWriter::new(
        writer_consumer,
        Arc::clone(&sink) as Arc<dyn StorageSink>,
        batch_settings(),
        Arc::clone(&writer_stats),
        cancel.clone(),
    );
    let writer_handle = tokio::spawn(writer.run());

    let (frame_tx, frame_rx) = mpsc::channel(16);
    let validator_handle = tokio::spawn(validator.run(frame_rx, cancel.clone()));

    frame_tx.send(ticker_frame("BTC-USD", 5)).await.unwrap();
    frame_tx.send(ticker_frame("BTC-USD", 8)).await.unwrap();

    // Both messages reach storage despite the gap between them.
    wait_until(|| sink.len() == 2).await;

    let records = read_gap_records(&gap_path);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].symbol, "BTC-USD");
    assert_eq!(records[0].expected_sequence, 6);
    assert_eq!(records[0].observed_sequence, 8);
    assert_eq!(stats.gaps(), 1);
    assert_eq!(stats.accepted(), 2);

    cancel.cancel();
    let _ = validator_handle.await;
    let _ = writer_handle.await;
}

#[tokio::test]
async fn reconnect_replay_is_deduplicated_without_gap_records() {
    let dir = tempfile::tempdir().unwrap();
    let gap_path = dir.path().join("gaps.jsonl");

    let queue = IngestQueue::new(100);
    let consumer = queue.register("persistence");
    let stats = Arc::new(ValidatorStats::default());
    let validator = Validator::new(
        queue.clone(),
        QualityLog::open(&gap_path).unwrap(),
        Arc::clone(&stats),
    );

    let (frame_tx, frame_rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(validator.run(frame_rx, cancel.clone()));

    // Original session reaches sequence 500.
    for seq in 490..=500 {
        frame_tx.send(ticker_frame("ETH-USD", seq)).await.unwrap();
    }
    // The reconnected feed replays a window of already-seen messages.
    for seq in 495..=500 {
        frame_tx.send(ticker_frame("ETH-USD", seq)).await.unwrap();
    }

    wait_until(|| stats.duplicates() == 6).await;
    assert_eq!(stats.accepted(), 11);
    assert_eq!(stats.gaps(), 0);
    assert_eq!(consumer.len(), 11);
    assert!(read_gap_records(&gap_path).is_empty());

    cancel.cancel();
    let _ = handle.await;
}

#[tokio::test]
async fn burst_beyond_capacity_drops_oldest_and_degrades_health() {
    let queue = IngestQueue::new(1000);
    let stalled_consumer = queue.register("persistence");

    let connection = Arc::new(ConnectionStateCell::new());
    connection.set(ConnectionState::Streaming);
    let health = PipelineHealth::new(
        "primary".to_string(),
        0.01,
        Arc::clone(&connection),
        queue.clone(),
        Arc::new(ValidatorStats::default()),
        Arc::new(WriterStats::default()),
        Arc::new(FanoutHub::new(10)),
    );

    // Burst with no consumer draining: exactly the overflow is evicted.
    let dir = tempfile::tempdir().unwrap();
    let stats = Arc::new(ValidatorStats::default());
    let mut validator = Validator::new(
        queue.clone(),
        QualityLog::open(&dir.path().join("gaps.jsonl")).unwrap(),
        Arc::clone(&stats),
    );
    for seq in 1..=5000 {
        validator.process_frame(&ticker_frame("BTC-USD", seq));
    }

    assert_eq!(stalled_consumer.len(), 1000);
    assert_eq!(stalled_consumer.dropped(), 4000);
    assert_eq!(queue.stats().pushed, 5000);
    assert_eq!(queue.stats().dropped, 4000);

    // The newest messages survived.
    assert_eq!(stalled_consumer.try_pop().unwrap().sequence(), Some(4001));

    let report = health.report();
    assert_eq!(report.status, HealthStatus::Degraded);
    assert!(report.queue.drop_ratio > 0.01);
}

#[tokio::test]
async fn stalled_fanout_subscriber_does_not_affect_persistence() {
    let queue = IngestQueue::new(100);
    let writer_consumer = queue.register("persistence");
    let fanout_consumer = queue.register("fanout");

    let sink = Arc::new(MemorySink::new());
    let writer_stats = Arc::new(WriterStats::default());
    let cancel = CancellationToken::new();
    let writer = BatchWriter::new(
        writer_consumer,
        Arc::clone(&sink) as Arc<dyn StorageSink>,
        batch_settings(),
        Arc::clone(&writer_stats),
        cancel.clone(),
    );
    let writer_handle = tokio::spawn(writer.run());

    // Tiny mailbox, subscriber never reads.
    let hub = Arc::new(FanoutHub::new(2));
    let _stalled = hub.subscribe("stalled");
    let pump = FanoutPump::new(fanout_consumer, Arc::clone(&hub), cancel.clone());
    let pump_handle = tokio::spawn(pump.run());

    let dir = tempfile::tempdir().unwrap();
    let stats = Arc::new(ValidatorStats::default());
    let mut validator = Validator::new(
        queue.clone(),
        QualityLog::open(&dir.path().join("gaps.jsonl")).unwrap(),
        Arc::clone(&stats),
    );
    for seq in 1..=20 {
        validator.process_frame(&ticker_frame("BTC-USD", seq));
    }

    // Persistence sees every row even though the subscriber lags.
    wait_until(|| sink.len() == 20).await;
    wait_until(|| hub.total_dropped() == 18).await;

    cancel.cancel();
    let _ = writer_handle.await;
    let _ = pump_handle.await;
}

#[tokio::test]
async fn retried_flush_does_not_duplicate_rows() {
    let queue = IngestQueue::new(100);
    let consumer = queue.register("persistence");

    let sink = Arc::new(FlakySink::failing(2));
    let writer_stats = Arc::new(WriterStats::default());
    let cancel = CancellationToken::new();
    let writer = BatchWriter::new(
        consumer,
        Arc::clone(&sink) as Arc<dyn StorageSink>,
        batch_settings(),
        Arc::clone(&writer_stats),
        cancel.clone(),
    );

    let dir = tempfile::tempdir().unwrap();
    let stats = Arc::new(ValidatorStats::default());
    let mut validator = Validator::new(
        queue.clone(),
        QualityLog::open(&dir.path().join("gaps.jsonl")).unwrap(),
        Arc::clone(&stats),
    );
    for seq in 1..=10 {
        validator.process_frame(&ticker_frame("BTC-USD", seq));
    }

    let handle = tokio::spawn(writer.run());

    wait_until(|| sink.inner.len() == 10).await;
    assert_eq!(writer_stats.flushed_rows(), 10);
    assert_eq!(writer_stats.failed_batches(), 0);

    // Rows are keyed by (timestamp, symbol); the retries left no duplicates.
    let rows = sink.inner.rows();
    let mut keys: Vec<_> = rows.iter().map(TickRow::key).collect();
    keys.dedup();
    assert_eq!(keys.len(), 10);

    cancel.cancel();
    let _ = handle.await;
}

#[tokio::test]
async fn shutdown_drains_pending_rows_to_storage() {
    let queue = IngestQueue::new(100);
    let consumer = queue.register("persistence");

    let sink = Arc::new(MemorySink::new());
    let writer_stats = Arc::new(WriterStats::default());
    let cancel = CancellationToken::new();
    let settings = BatchSettings {
        // Nothing flushes before the cancel.
        max_rows: 1000,
        max_flush_interval: Duration::from_secs(60),
        ..batch_settings()
    };
    let writer = BatchWriter::new(
        consumer,
        Arc::clone(&sink) as Arc<dyn StorageSink>,
        settings,
        Arc::clone(&writer_stats),
        cancel.clone(),
    );

    let dir = tempfile::tempdir().unwrap();
    let stats = Arc::new(ValidatorStats::default());
    let mut validator = Validator::new(
        queue.clone(),
        QualityLog::open(&dir.path().join("gaps.jsonl")).unwrap(),
        Arc::clone(&stats),
    );
    for seq in 1..=7 {
        validator.process_frame(&ticker_frame("BTC-USD", seq));
    }

    let handle = tokio::spawn(writer.run());
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();
    timeout(Duration::from_secs(2), handle)
        .await
        .expect("writer should stop promptly")
        .unwrap();

    assert_eq!(sink.len(), 7);
}

#[tokio::test]
async fn health_recovers_once_backlog_drains_after_outage() {
    let queue = IngestQueue::new(100);
    let consumer = queue.register("persistence");

    let connection = Arc::new(ConnectionStateCell::new());
    connection.set(ConnectionState::Streaming);

    // Three failed single-row flushes overflow the two-row backlog, then the
    // sink recovers.
    let sink = Arc::new(FlakySink::failing(3));
    let writer_stats = Arc::new(WriterStats::default());
    let cancel = CancellationToken::new();
    let settings = BatchSettings {
        max_rows: 1,
        max_retries: 0,
        max_backlog_rows: 2,
        retry_backoff_initial: Duration::from_millis(1),
        retry_backoff_max: Duration::from_millis(1),
        max_flush_interval: Duration::from_millis(10),
        drain_deadline: Duration::from_millis(100),
    };
    let writer = BatchWriter::new(
        consumer,
        Arc::clone(&sink) as Arc<dyn StorageSink>,
        settings,
        Arc::clone(&writer_stats),
        cancel.clone(),
    );
    let writer_handle = tokio::spawn(writer.run());

    let dir = tempfile::tempdir().unwrap();
    let validator_stats = Arc::new(ValidatorStats::default());
    let mut validator = Validator::new(
        queue.clone(),
        QualityLog::open(&dir.path().join("gaps.jsonl")).unwrap(),
        Arc::clone(&validator_stats),
    );

    let health = PipelineHealth::new(
        "primary".to_string(),
        0.5,
        Arc::clone(&connection),
        queue.clone(),
        Arc::clone(&validator_stats),
        Arc::clone(&writer_stats),
        Arc::new(FanoutHub::new(10)),
    );

    for seq in 1..=3 {
        validator.process_frame(&ticker_frame("BTC-USD", seq));
    }
    wait_until(|| writer_stats.backlog_dropped() >= 1).await;

    // Backlog is at its bound and evicting: the pipeline is failing now.
    assert_eq!(health.report().status, HealthStatus::Failing);

    // The recovered sink carries the backlog out with the next flush; the
    // earlier eviction must not pin the status at failing.
    validator.process_frame(&ticker_frame("BTC-USD", 4));
    wait_until(|| writer_stats.backlog_rows() == 0 && sink.inner.len() == 3).await;

    let report = health.report();
    assert_eq!(report.status, HealthStatus::Healthy);
    assert!(report.persistence.backlog_dropped >= 1);

    cancel.cancel();
    let _ = writer_handle.await;
}

#[tokio::test]
async fn malformed_frames_never_reach_consumers() {
    let dir = tempfile::tempdir().unwrap();
    let queue = IngestQueue::new(100);
    let consumer = queue.register("persistence");
    let stats = Arc::new(ValidatorStats::default());
    let mut validator = Validator::new(
        queue.clone(),
        QualityLog::open(&dir.path().join("gaps.jsonl")).unwrap(),
        Arc::clone(&stats),
    );

    validator.process_frame(&RawFrame::new("{not json"));
    validator.process_frame(&RawFrame::new(r#"{"type":"ticker","symbol":"BTC-USD"}"#));
    validator.process_frame(&ticker_frame("BTC-USD", 1));

    assert_eq!(consumer.len(), 1);
    assert_eq!(stats.malformed(), 2);
    assert_eq!(stats.accepted(), 1);
    assert_eq!(queue.stats().pushed, 1);
}
