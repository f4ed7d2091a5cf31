//! Batch Persistence Writer
//!
//! Consumes validated messages from its ingestion sub-queue and flushes
//! ticker rows to the storage sink in batches, sized by row count or by the
//! age of the oldest unflushed row. Transient write failures are retried
//! with exponential backoff; exhausted retries park the batch in a bounded
//! in-memory backlog that is re-queued ahead of fresh rows on the next
//! flush. On shutdown the writer drains within a fixed deadline.

mod sink;

pub use sink::{JsonlSink, MemorySink};

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::application::ports::StorageSink;
use crate::domain::message::{FeedMessage, TickRow};
use crate::infrastructure::config::BatchSettings;
use crate::infrastructure::metrics::{self, DropReason};
use crate::infrastructure::queue::QueueConsumer;

// =============================================================================
// Writer Stats
// =============================================================================

/// Shared batch writer counters, read by health reporting.
#[derive(Debug, Default)]
pub struct WriterStats {
    flushed_rows: AtomicU64,
    flushed_batches: AtomicU64,
    failed_batches: AtomicU64,
    rejected_rows: AtomicU64,
    backlog_rows: AtomicU64,
    backlog_dropped: AtomicU64,
    backlog_saturated: AtomicBool,
    retrying: AtomicBool,
    last_flush_ms: AtomicI64,
}

impl WriterStats {
    /// Rows successfully flushed to storage.
    #[must_use]
    pub fn flushed_rows(&self) -> u64 {
        self.flushed_rows.load(Ordering::Relaxed)
    }

    /// Batches successfully flushed to storage.
    #[must_use]
    pub fn flushed_batches(&self) -> u64 {
        self.flushed_batches.load(Ordering::Relaxed)
    }

    /// Batches that exhausted retries or were rejected.
    #[must_use]
    pub fn failed_batches(&self) -> u64 {
        self.failed_batches.load(Ordering::Relaxed)
    }

    /// Rows dropped because the store rejected them permanently.
    #[must_use]
    pub fn rejected_rows(&self) -> u64 {
        self.rejected_rows.load(Ordering::Relaxed)
    }

    /// Rows currently parked in the backlog.
    #[must_use]
    pub fn backlog_rows(&self) -> u64 {
        self.backlog_rows.load(Ordering::Relaxed)
    }

    /// Rows evicted from the backlog since startup.
    #[must_use]
    pub fn backlog_dropped(&self) -> u64 {
        self.backlog_dropped.load(Ordering::Relaxed)
    }

    /// Whether the backlog is currently at its bound, evicting rows.
    ///
    /// Clears as soon as a flush drains the backlog, unlike the lifetime
    /// `backlog_dropped` counter.
    #[must_use]
    pub fn is_backlog_saturated(&self) -> bool {
        self.backlog_saturated.load(Ordering::Relaxed)
    }

    /// Whether a flush is currently in its retry loop.
    #[must_use]
    pub fn is_retrying(&self) -> bool {
        self.retrying.load(Ordering::Relaxed)
    }

    /// Time since the last successful flush, or `None` before the first one.
    #[must_use]
    pub fn last_flush_age(&self) -> Option<Duration> {
        let last = self.last_flush_ms.load(Ordering::Relaxed);
        if last == 0 {
            return None;
        }
        let elapsed_ms = (Utc::now().timestamp_millis() - last).max(0);
        #[allow(clippy::cast_sign_loss)]
        Some(Duration::from_millis(elapsed_ms as u64))
    }
}

// =============================================================================
// Batch Writer
// =============================================================================

/// Flushes ticker rows to the storage sink in size- or age-bounded batches.
pub struct BatchWriter {
    consumer: QueueConsumer,
    sink: Arc<dyn StorageSink>,
    settings: BatchSettings,
    backlog: VecDeque<TickRow>,
    stats: Arc<WriterStats>,
    cancel: CancellationToken,
}

impl BatchWriter {
    /// Create a new batch writer.
    #[must_use]
    pub fn new(
        consumer: QueueConsumer,
        sink: Arc<dyn StorageSink>,
        settings: BatchSettings,
        stats: Arc<WriterStats>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            consumer,
            sink,
            settings,
            backlog: VecDeque::new(),
            stats,
            cancel,
        }
    }

    /// Run the write loop until cancelled, then drain.
    pub async fn run(mut self) {
        loop {
            let rows = self.collect_batch().await;
            if self.cancel.is_cancelled() {
                // The drain deadline bounds the final flush, so a wedged
                // sink cannot stall shutdown.
                self.drain(rows).await;
                tracing::info!("Batch writer stopped");
                return;
            }
            if !rows.is_empty() || !self.backlog.is_empty() {
                self.flush(rows).await;
            }
        }
    }

    /// Collect rows until the batch is full or the oldest row is too old.
    ///
    /// The age clock starts when the first row arrives, so an idle feed never
    /// produces empty flushes. Returns early (possibly empty) on cancellation.
    async fn collect_batch(&mut self) -> Vec<TickRow> {
        let mut rows = Vec::new();
        let mut deadline: Option<Instant> = None;

        loop {
            if rows.len() >= self.settings.max_rows {
                return rows;
            }

            let msg = if let Some(deadline) = deadline {
                tokio::select! {
                    () = self.cancel.cancelled() => return rows,
                    result = tokio::time::timeout_at(deadline, self.consumer.recv()) => {
                        match result {
                            Ok(msg) => msg,
                            Err(_) => return rows,
                        }
                    }
                }
            } else {
                tokio::select! {
                    () = self.cancel.cancelled() => return rows,
                    msg = self.consumer.recv() => msg,
                }
            };

            // Only ticker messages are persisted; the rest of the stream is
            // fan-out-only.
            if let FeedMessage::Ticker(ticker) = msg {
                if rows.is_empty() {
                    deadline = Some(Instant::now() + self.settings.max_flush_interval);
                }
                rows.push(TickRow::from(ticker));
            }
        }
    }

    /// Flush backlogged rows followed by `fresh` rows, retrying transient
    /// failures with exponential backoff.
    async fn flush(&mut self, fresh: Vec<TickRow>) {
        let mut rows: Vec<TickRow> = self.backlog.drain(..).collect();
        rows.extend(fresh);
        if rows.is_empty() {
            return;
        }
        self.publish_backlog_depth();

        let start = Instant::now();
        let mut backoff = self.settings.retry_backoff_initial;
        let mut attempt: u32 = 0;

        loop {
            match self.sink.write_rows(&rows).await {
                Ok(()) => {
                    self.stats.retrying.store(false, Ordering::Relaxed);
                    self.stats.flushed_batches.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .flushed_rows
                        .fetch_add(rows.len() as u64, Ordering::Relaxed);
                    self.stats
                        .last_flush_ms
                        .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
                    metrics::record_flush_latency(start.elapsed());
                    metrics::record_batch_rows(rows.len());
                    tracing::debug!(rows = rows.len(), "Flushed batch to storage");
                    return;
                }
                Err(e) if e.is_retryable() && attempt < self.settings.max_retries => {
                    attempt += 1;
                    self.stats.retrying.store(true, Ordering::Relaxed);
                    tracing::warn!(
                        error = %e,
                        attempt,
                        delay_ms = backoff.as_millis(),
                        "Storage write failed, retrying"
                    );
                    tokio::select! {
                        () = self.cancel.cancelled() => {
                            self.stats.retrying.store(false, Ordering::Relaxed);
                            self.park(rows);
                            return;
                        }
                        () = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.settings.retry_backoff_max);
                }
                Err(e) if e.is_retryable() => {
                    self.stats.retrying.store(false, Ordering::Relaxed);
                    self.stats.failed_batches.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        error = %e,
                        rows = rows.len(),
                        "Retries exhausted, parking batch in backlog"
                    );
                    self.park(rows);
                    return;
                }
                Err(e) => {
                    self.stats.retrying.store(false, Ordering::Relaxed);
                    self.stats.failed_batches.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .rejected_rows
                        .fetch_add(rows.len() as u64, Ordering::Relaxed);
                    tracing::error!(
                        error = %e,
                        rows = rows.len(),
                        "Storage rejected batch, dropping rows"
                    );
                    return;
                }
            }
        }
    }

    /// Flush whatever remains, bounded by the drain deadline.
    async fn drain(&mut self, mut rows: Vec<TickRow>) {
        while let Some(msg) = self.consumer.try_pop() {
            if let FeedMessage::Ticker(ticker) = msg {
                rows.push(TickRow::from(ticker));
            }
        }

        // The flush takes ownership of the rows, so the pending count has to
        // be captured before the attempt to be reportable if it lapses.
        let pending = self.backlog.len() + rows.len();
        if pending == 0 {
            return;
        }

        tracing::info!(rows = pending, "Draining final batch before shutdown");
        let deadline = Instant::now() + self.settings.drain_deadline;
        if tokio::time::timeout_at(deadline, self.flush(rows))
            .await
            .is_err()
        {
            tracing::warn!(rows = pending, "Drain deadline exceeded, unflushed rows lost");
        } else if !self.backlog.is_empty() {
            tracing::warn!(
                rows = self.backlog.len(),
                "Unflushed rows discarded at shutdown"
            );
        }
    }

    /// Park rows in the backlog, evicting the oldest beyond the bound.
    fn park(&mut self, rows: Vec<TickRow>) {
        self.backlog.extend(rows);

        let mut evicted: u64 = 0;
        while self.backlog.len() > self.settings.max_backlog_rows {
            self.backlog.pop_front();
            evicted += 1;
        }
        if evicted > 0 {
            self.stats
                .backlog_dropped
                .fetch_add(evicted, Ordering::Relaxed);
            metrics::record_drops(DropReason::BacklogOverflow, evicted);
            tracing::error!(dropped = evicted, "Backlog overflow, oldest rows dropped");
        }
        self.publish_backlog_depth();
    }

    fn publish_backlog_depth(&self) {
        self.stats
            .backlog_rows
            .store(self.backlog.len() as u64, Ordering::Relaxed);
        self.stats.backlog_saturated.store(
            !self.backlog.is_empty() && self.backlog.len() >= self.settings.max_backlog_rows,
            Ordering::Relaxed,
        );
        #[allow(clippy::cast_precision_loss)]
        metrics::set_backlog_rows(self.backlog.len() as f64);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::*;
    use crate::application::ports::StorageError;
    use crate::domain::message::TickerMessage;
    use crate::infrastructure::queue::IngestQueue;

    fn ticker(symbol: &str, sequence: u64) -> FeedMessage {
        FeedMessage::Ticker(TickerMessage {
            symbol: symbol.to_string(),
            price: Decimal::ONE,
            volume: Decimal::ONE,
            bid: Decimal::ONE,
            ask: Decimal::ONE,
            exchange_ts: Utc::now() + chrono::Duration::milliseconds(i64::try_from(sequence).unwrap()),
            sequence,
        })
    }

    fn fast_settings() -> BatchSettings {
        BatchSettings {
            max_rows: 3,
            max_flush_interval: Duration::from_millis(50),
            max_retries: 2,
            retry_backoff_initial: Duration::from_millis(10),
            retry_backoff_max: Duration::from_millis(40),
            max_backlog_rows: 100,
            drain_deadline: Duration::from_millis(500),
        }
    }

    /// Sink that fails a configurable number of times before delegating to
    /// an inner [`MemorySink`].
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
                self.remaining_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StorageError::Unavailable("simulated outage".to_string()));
            }
            self.inner.write_rows(rows).await
        }
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn flushes_when_batch_is_full() {
        let queue = IngestQueue::new(100);
        let consumer = queue.register("writer");
        let sink = Arc::new(MemorySink::new());
        let stats = Arc::new(WriterStats::default());
        let cancel = CancellationToken::new();

        let writer = BatchWriter::new(
            consumer,
            Arc::clone(&sink) as Arc<dyn StorageSink>,
            fast_settings(),
            Arc::clone(&stats),
            cancel.clone(),
        );
        let handle = tokio::spawn(writer.run());

        for seq in 1..=3 {
            queue.push(ticker("BTC-USD", seq));
        }

        wait_until(|| sink.len() == 3).await;
        assert_eq!(stats.flushed_rows(), 3);
        assert_eq!(stats.flushed_batches(), 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn flushes_partial_batch_after_interval() {
        let queue = IngestQueue::new(100);
        let consumer = queue.register("writer");
        let sink = Arc::new(MemorySink::new());
        let stats = Arc::new(WriterStats::default());
        let cancel = CancellationToken::new();

        let writer = BatchWriter::new(
            consumer,
            Arc::clone(&sink) as Arc<dyn StorageSink>,
            fast_settings(),
            Arc::clone(&stats),
            cancel.clone(),
        );
        let handle = tokio::spawn(writer.run());

        queue.push(ticker("BTC-USD", 1));

        // One row is below max_rows; only the age trigger can flush it.
        wait_until(|| sink.len() == 1).await;

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn non_ticker_messages_are_not_persisted() {
        let queue = IngestQueue::new(100);
        let consumer = queue.register("writer");
        let sink = Arc::new(MemorySink::new());
        let stats = Arc::new(WriterStats::default());
        let cancel = CancellationToken::new();

        let writer = BatchWriter::new(
            consumer,
            Arc::clone(&sink) as Arc<dyn StorageSink>,
            fast_settings(),
            Arc::clone(&stats),
            cancel.clone(),
        );
        let handle = tokio::spawn(writer.run());

        queue.push(FeedMessage::Level2(crate::domain::message::Level2Message {
            symbol: "BTC-USD".to_string(),
            side: crate::domain::message::Side::Bid,
            price_level: Decimal::ONE,
            size: Decimal::ONE,
            sequence: 1,
        }));
        queue.push(ticker("BTC-USD", 2));

        wait_until(|| sink.len() == 1).await;
        assert_eq!(sink.rows()[0].sequence, 2);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn transient_failures_are_retried_idempotently() {
        let queue = IngestQueue::new(100);
        let consumer = queue.register("writer");
        let sink = Arc::new(FlakySink::failing(2));
        let stats = Arc::new(WriterStats::default());
        let cancel = CancellationToken::new();

        let writer = BatchWriter::new(
            consumer,
            Arc::clone(&sink) as Arc<dyn StorageSink>,
            fast_settings(),
            Arc::clone(&stats),
            cancel.clone(),
        );

        for seq in 1..=3 {
            queue.push(ticker("BTC-USD", seq));
        }
        let handle = tokio::spawn(writer.run());

        wait_until(|| sink.inner.len() == 3).await;
        assert_eq!(stats.flushed_batches(), 1);
        assert_eq!(stats.failed_batches(), 0);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn exhausted_retries_park_batch_and_requeue_it_first() {
        let queue = IngestQueue::new(100);
        let consumer = queue.register("writer");
        // 3 failures > max_retries (2), so the first batch is parked. The
        // next flush succeeds and must carry the parked rows with it.
        let sink = Arc::new(FlakySink::failing(3));
        let stats = Arc::new(WriterStats::default());
        let cancel = CancellationToken::new();

        let writer = BatchWriter::new(
            consumer,
            Arc::clone(&sink) as Arc<dyn StorageSink>,
            fast_settings(),
            Arc::clone(&stats),
            cancel.clone(),
        );

        for seq in 1..=3 {
            queue.push(ticker("BTC-USD", seq));
        }
        let handle = tokio::spawn(writer.run());

        wait_until(|| stats.backlog_rows() == 3).await;
        assert_eq!(stats.failed_batches(), 1);

        queue.push(ticker("BTC-USD", 4));
        wait_until(|| sink.inner.len() == 4).await;
        assert_eq!(stats.backlog_rows(), 0);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn backlog_is_bounded_with_oldest_dropped() {
        let queue = IngestQueue::new(100);
        let consumer = queue.register("writer");
        let sink = Arc::new(FlakySink::failing(u32::MAX));
        let stats = Arc::new(WriterStats::default());
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
            Arc::clone(&stats),
            cancel.clone(),
        );
        let handle = tokio::spawn(writer.run());

        for seq in 1..=4 {
            queue.push(ticker("BTC-USD", seq));
        }

        wait_until(|| stats.backlog_dropped() >= 2).await;
        assert_eq!(stats.backlog_rows(), 2);
        assert!(stats.is_backlog_saturated());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn backlog_saturation_clears_once_backlog_drains() {
        let queue = IngestQueue::new(100);
        let consumer = queue.register("writer");
        let sink = Arc::new(FlakySink::failing(3));
        let stats = Arc::new(WriterStats::default());
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
            Arc::clone(&stats),
            cancel.clone(),
        );
        let handle = tokio::spawn(writer.run());

        // Three failed single-row flushes fill the two-row backlog and evict
        // the oldest row.
        for seq in 1..=3 {
            queue.push(ticker("BTC-USD", seq));
        }
        wait_until(|| stats.backlog_dropped() >= 1).await;
        assert!(stats.is_backlog_saturated());

        // The sink has recovered; the next flush carries the backlog out.
        queue.push(ticker("BTC-USD", 4));
        wait_until(|| stats.backlog_rows() == 0 && sink.inner.len() == 3).await;
        assert!(!stats.is_backlog_saturated());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn drain_deadline_bounds_shutdown_with_unresponsive_sink() {
        /// Sink whose writes never complete.
        struct HangingSink;

        #[async_trait::async_trait]
        impl StorageSink for HangingSink {
            async fn write_rows(&self, _rows: &[TickRow]) -> Result<(), StorageError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        }

        let queue = IngestQueue::new(100);
        let consumer = queue.register("writer");
        let stats = Arc::new(WriterStats::default());
        let cancel = CancellationToken::new();

        let settings = BatchSettings {
            // Large batch and long interval so the only flush is the drain.
            max_rows: 1000,
            max_flush_interval: Duration::from_secs(60),
            drain_deadline: Duration::from_millis(50),
            ..fast_settings()
        };
        let writer = BatchWriter::new(
            consumer,
            Arc::new(HangingSink) as Arc<dyn StorageSink>,
            settings,
            Arc::clone(&stats),
            cancel.clone(),
        );

        for seq in 1..=3 {
            queue.push(ticker("BTC-USD", seq));
        }

        let handle = tokio::spawn(writer.run());
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("writer should stop at the drain deadline")
            .unwrap();
        assert_eq!(stats.flushed_rows(), 0);
    }

    #[tokio::test]
    async fn cancel_drains_pending_rows() {
        let queue = IngestQueue::new(100);
        let consumer = queue.register("writer");
        let sink = Arc::new(MemorySink::new());
        let stats = Arc::new(WriterStats::default());
        let cancel = CancellationToken::new();

        let settings = BatchSettings {
            // Large batch and long interval so nothing flushes before cancel.
            max_rows: 1000,
            max_flush_interval: Duration::from_secs(60),
            ..fast_settings()
        };
        let writer = BatchWriter::new(
            consumer,
            Arc::clone(&sink) as Arc<dyn StorageSink>,
            settings,
            Arc::clone(&stats),
            cancel.clone(),
        );

        for seq in 1..=5 {
            queue.push(ticker("BTC-USD", seq));
        }

        let handle = tokio::spawn(writer.run());
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(sink.len(), 5);
    }
}
