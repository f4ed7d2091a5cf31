//! Bounded Ingestion Queue
//!
//! Decouples feed ingestion from downstream consumers. Each consumer
//! registers its own bounded sub-queue; the producer pushes every validated
//! message to all of them. When a sub-queue is full the oldest message is
//! evicted and counted, so a stalled consumer can neither block the producer
//! nor starve its siblings, and the freshest data always wins.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::domain::message::FeedMessage;
use crate::infrastructure::metrics::{self, DropReason};

/// Producer-side counters, used for health evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Messages pushed by the producer.
    pub pushed: u64,
    /// Messages evicted across all sub-queues.
    pub dropped: u64,
}

impl QueueStats {
    /// Fraction of pushed messages that were evicted somewhere.
    #[must_use]
    pub fn drop_ratio(&self) -> f64 {
        if self.pushed == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        {
            self.dropped as f64 / self.pushed as f64
        }
    }
}

#[derive(Debug)]
struct SubQueue {
    name: &'static str,
    capacity: usize,
    buf: parking_lot::Mutex<VecDeque<FeedMessage>>,
    notify: Notify,
    dropped: AtomicU64,
}

impl SubQueue {
    fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            buf: parking_lot::Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Push one message, evicting the oldest when full.
    ///
    /// Returns `true` when an eviction happened.
    fn push(&self, msg: FeedMessage) -> bool {
        let (evicted, depth) = {
            let mut buf = self.buf.lock();
            let evicted = if buf.len() >= self.capacity {
                buf.pop_front();
                true
            } else {
                false
            };
            buf.push_back(msg);
            (evicted, buf.len())
        };

        if evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::record_drops(DropReason::QueueFull, 1);
        }
        #[allow(clippy::cast_precision_loss)]
        metrics::set_queue_depth(self.name, depth as f64);
        self.notify.notify_one();
        evicted
    }

    fn pop(&self) -> Option<FeedMessage> {
        self.buf.lock().pop_front()
    }
}

#[derive(Debug)]
struct QueueShared {
    capacity: usize,
    consumers: parking_lot::RwLock<Vec<Arc<SubQueue>>>,
    pushed: AtomicU64,
    dropped: AtomicU64,
}

/// Handle held by the producer (and by health reporting).
///
/// Cheap to clone; all clones share the same sub-queues.
#[derive(Debug, Clone)]
pub struct IngestQueue {
    shared: Arc<QueueShared>,
}

impl IngestQueue {
    /// Create a queue whose sub-queues hold at most `capacity` messages each.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                capacity,
                consumers: parking_lot::RwLock::new(Vec::new()),
                pushed: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Register a named consumer with its own bounded sub-queue.
    ///
    /// Consumers registered after messages were pushed only see messages
    /// pushed from that point on; registration happens at pipeline startup.
    #[must_use]
    pub fn register(&self, name: &'static str) -> QueueConsumer {
        let sub = Arc::new(SubQueue::new(name, self.shared.capacity));
        self.shared.consumers.write().push(Arc::clone(&sub));
        QueueConsumer { sub }
    }

    /// Push one validated message to every consumer's sub-queue.
    ///
    /// Never blocks. Returns `false` when any sub-queue had to evict its
    /// oldest message to admit this one.
    pub fn push(&self, msg: FeedMessage) -> bool {
        self.shared.pushed.fetch_add(1, Ordering::Relaxed);

        let mut clean = true;
        let consumers = self.shared.consumers.read();
        for sub in consumers.iter() {
            if sub.push(msg.clone()) {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                clean = false;
            }
        }
        clean
    }

    /// Current depth of every consumer's sub-queue.
    #[must_use]
    pub fn depths(&self) -> Vec<(&'static str, usize)> {
        self.shared
            .consumers
            .read()
            .iter()
            .map(|sub| (sub.name, sub.buf.lock().len()))
            .collect()
    }

    /// Producer-side counters.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pushed: self.shared.pushed.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Receiving end of one consumer's sub-queue.
#[derive(Debug)]
pub struct QueueConsumer {
    sub: Arc<SubQueue>,
}

impl QueueConsumer {
    /// Pop the oldest message without waiting.
    #[must_use]
    pub fn try_pop(&self) -> Option<FeedMessage> {
        self.sub.pop()
    }

    /// Wait for and pop the next message.
    pub async fn recv(&self) -> FeedMessage {
        loop {
            // Arm the wakeup before checking so a push between the check and
            // the await cannot be lost.
            let notified = self.sub.notify.notified();
            if let Some(msg) = self.sub.pop() {
                return msg;
            }
            notified.await;
        }
    }

    /// Pop up to `max` messages, waiting until `deadline` to fill the batch.
    ///
    /// Returns early once `max` messages are collected; returns whatever has
    /// arrived (possibly nothing) once the deadline passes.
    pub async fn pop_batch(&self, max: usize, deadline: Instant) -> Vec<FeedMessage> {
        let mut out = Vec::new();
        loop {
            let notified = self.sub.notify.notified();
            while out.len() < max {
                match self.sub.pop() {
                    Some(msg) => out.push(msg),
                    None => break,
                }
            }
            if out.len() >= max || Instant::now() >= deadline {
                return out;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                // Deadline passed while waiting; drain anything that raced in.
                while out.len() < max {
                    match self.sub.pop() {
                        Some(msg) => out.push(msg),
                        None => break,
                    }
                }
                return out;
            }
        }
    }

    /// Current depth of this sub-queue.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sub.buf.lock().len()
    }

    /// Whether the sub-queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages evicted from this sub-queue since startup.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.sub.dropped.load(Ordering::Relaxed)
    }
}
