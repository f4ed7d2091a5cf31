//! Fan-Out Broadcaster
//!
//! Distributes validated messages to in-process subscribers. Every
//! subscriber gets its own bounded mailbox and delivery never blocks: when a
//! mailbox is full the message is dropped for that subscriber and counted,
//! so one stalled consumer cannot slow the pipeline or its peers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::message::FeedMessage;
use crate::infrastructure::metrics::{self, DropReason};
use crate::infrastructure::queue::QueueConsumer;

// =============================================================================
// Subscriptions
// =============================================================================

/// Receiving end of one subscriber's mailbox.
///
/// Dropping the subscription closes the mailbox; the hub prunes the slot on
/// the next publish.
#[derive(Debug)]
pub struct Subscription {
    id: Uuid,
    rx: mpsc::Receiver<FeedMessage>,
}

impl Subscription {
    /// The subscriber's identifier.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Receive the next message, or `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<FeedMessage> {
        self.rx.recv().await
    }

    /// Receive without waiting.
    pub fn try_recv(&mut self) -> Option<FeedMessage> {
        self.rx.try_recv().ok()
    }
}

#[derive(Debug)]
struct SubscriberSlot {
    id: Uuid,
    name: String,
    tx: mpsc::Sender<FeedMessage>,
    dropped: AtomicU64,
}

/// Per-subscriber delivery counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberStats {
    /// Subscriber identifier.
    pub id: Uuid,
    /// Subscriber name given at registration.
    pub name: String,
    /// Messages dropped because the mailbox was full.
    pub dropped: u64,
}

// =============================================================================
// Fan-Out Hub
// =============================================================================

/// Central fan-out point for validated messages.
#[derive(Debug)]
pub struct FanoutHub {
    mailbox_capacity: usize,
    slots: parking_lot::RwLock<Vec<Arc<SubscriberSlot>>>,
}

impl FanoutHub {
    /// Create a hub whose subscriber mailboxes hold `mailbox_capacity`
    /// messages each.
    #[must_use]
    pub fn new(mailbox_capacity: usize) -> Self {
        Self {
            mailbox_capacity,
            slots: parking_lot::RwLock::new(Vec::new()),
        }
    }

    /// Register a named subscriber.
    #[must_use]
    pub fn subscribe(&self, name: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(self.mailbox_capacity);
        let id = Uuid::new_v4();
        let slot = Arc::new(SubscriberSlot {
            id,
            name: name.to_string(),
            tx,
            dropped: AtomicU64::new(0),
        });

        let count = {
            let mut slots = self.slots.write();
            slots.push(slot);
            slots.len()
        };
        #[allow(clippy::cast_precision_loss)]
        metrics::set_fanout_subscribers(count as f64);
        tracing::debug!(subscriber = name, %id, "Fan-out subscriber registered");

        Subscription { id, rx }
    }

    /// Remove a subscriber by id.
    pub fn unsubscribe(&self, id: Uuid) {
        let count = {
            let mut slots = self.slots.write();
            slots.retain(|slot| slot.id != id);
            slots.len()
        };
        #[allow(clippy::cast_precision_loss)]
        metrics::set_fanout_subscribers(count as f64);
    }

    /// Deliver one message to every live subscriber without blocking.
    ///
    /// Full mailboxes drop the message for that subscriber only; closed
    /// mailboxes are pruned.
    pub fn publish(&self, msg: &FeedMessage) {
        let mut closed: Vec<Uuid> = Vec::new();

        {
            let slots = self.slots.read();
            for slot in slots.iter() {
                match slot.tx.try_send(msg.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        slot.dropped.fetch_add(1, Ordering::Relaxed);
                        metrics::record_drops(DropReason::SubscriberLagging, 1);
                        tracing::trace!(
                            subscriber = %slot.name,
                            "Subscriber mailbox full, message dropped"
                        );
                    }
                    Err(TrySendError::Closed(_)) => {
                        closed.push(slot.id);
                    }
                }
            }
        }

        for id in closed {
            tracing::debug!(%id, "Pruning closed fan-out subscriber");
            self.unsubscribe(id);
        }
    }

    /// Number of registered subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.slots.read().len()
    }

    /// Delivery counters for every subscriber.
    #[must_use]
    pub fn stats(&self) -> Vec<SubscriberStats> {
        self.slots
            .read()
            .iter()
            .map(|slot| SubscriberStats {
                id: slot.id,
                name: slot.name.clone(),
                dropped: slot.dropped.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Total messages dropped across all current subscribers.
    #[must_use]
    pub fn total_dropped(&self) -> u64 {
        self.slots
            .read()
            .iter()
            .map(|slot| slot.dropped.load(Ordering::Relaxed))
            .sum()
    }
}

// =============================================================================
// Fan-Out Pump
// =============================================================================

/// Moves messages from the fan-out sub-queue into the hub.
pub struct FanoutPump {
    consumer: QueueConsumer,
    hub: Arc<FanoutHub>,
    cancel: CancellationToken,
}

impl FanoutPump {
    /// Create a new pump.
    #[must_use]
    pub const fn new(
        consumer: QueueConsumer,
        hub: Arc<FanoutHub>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            consumer,
            hub,
            cancel,
        }
    }

    /// Run until cancelled.
    pub async fn run(self) {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::info!("Fan-out pump stopped");
                    return;
                }
                msg = self.consumer.recv() => {
                    self.hub.publish(&msg);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::*;
    use crate::domain::message::TickerMessage;
    use crate::infrastructure::queue::IngestQueue;

    fn ticker(sequence: u64) -> FeedMessage {
        FeedMessage::Ticker(TickerMessage {
            symbol: "BTC-USD".to_string(),
            price: Decimal::ONE,
            volume: Decimal::ONE,
            bid: Decimal::ONE,
            ask: Decimal::ONE,
            exchange_ts: Utc::now(),
            sequence,
        })
    }

    #[tokio::test]
    async fn all_subscribers_receive_each_message() {
        let hub = FanoutHub::new(10);
        let mut sub_a = hub.subscribe("a");
        let mut sub_b = hub.subscribe("b");

        hub.publish(&ticker(1));

        assert_eq!(sub_a.recv().await.unwrap().sequence(), Some(1));
        assert_eq!(sub_b.recv().await.unwrap().sequence(), Some(1));
    }

    #[tokio::test]
    async fn full_mailbox_drops_for_that_subscriber_only() {
        let hub = FanoutHub::new(2);
        let mut stalled = hub.subscribe("stalled");
        let mut active = hub.subscribe("active");

        for seq in 1..=4 {
            hub.publish(&ticker(seq));
            // Active subscriber keeps up; stalled one never reads.
            let _ = active.try_recv();
        }

        let stats = hub.stats();
        let stalled_stats = stats.iter().find(|s| s.name == "stalled").unwrap();
        let active_stats = stats.iter().find(|s| s.name == "active").unwrap();
        assert_eq!(stalled_stats.dropped, 2);
        assert_eq!(active_stats.dropped, 0);
        assert_eq!(hub.total_dropped(), 2);

        // The stalled mailbox kept the two oldest messages.
        assert_eq!(stalled.recv().await.unwrap().sequence(), Some(1));
        assert_eq!(stalled.recv().await.unwrap().sequence(), Some(2));
    }

    #[tokio::test]
    async fn dropped_subscriptions_are_pruned_on_publish() {
        let hub = FanoutHub::new(10);
        let sub_a = hub.subscribe("a");
        let _sub_b = hub.subscribe("b");
        assert_eq!(hub.subscriber_count(), 2);

        drop(sub_a);
        hub.publish(&ticker(1));

        assert_eq!(hub.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_removes_slot() {
        let hub = FanoutHub::new(10);
        let sub = hub.subscribe("a");
        assert_eq!(hub.subscriber_count(), 1);

        hub.unsubscribe(sub.id());
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn pump_moves_queue_messages_into_hub() {
        let queue = IngestQueue::new(100);
        let consumer = queue.register("fanout");
        let hub = Arc::new(FanoutHub::new(10));
        let mut sub = hub.subscribe("client");
        let cancel = CancellationToken::new();

        let pump = FanoutPump::new(consumer, Arc::clone(&hub), cancel.clone());
        let handle = tokio::spawn(pump.run());

        queue.push(ticker(1));
        queue.push(ticker(2));

        let first = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.sequence(), Some(1));
        let second = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.sequence(), Some(2));

        cancel.cancel();
        handle.await.unwrap();
    }
}
