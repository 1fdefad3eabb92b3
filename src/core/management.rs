//! Read-only queue statistics, administrative commands and threshold
//! notifications for the observability side channel.
//!
//! Notifications travel over a `tokio::sync::broadcast` channel: sending
//! never blocks the data path and slow listeners simply lag.

use bytes::Bytes;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tracing::debug;

use crate::config::QueueDefaults;
use crate::core::error::QueueError;
use crate::core::message::{Message, MessageId};
use crate::core::queue::{Queue, QueueName};
use crate::metrics;

/// Observational limits. Breaching one raises a notification, never a
/// rejection.
#[derive(Debug)]
pub struct QueueLimits {
    max_message_size: AtomicU64,
    max_message_count: AtomicU64,
    max_queue_depth: AtomicU64,
}

impl QueueLimits {
    pub fn new(max_message_size: u64, max_message_count: u64, max_queue_depth: u64) -> Self {
        Self {
            max_message_size: AtomicU64::new(max_message_size),
            max_message_count: AtomicU64::new(max_message_count),
            max_queue_depth: AtomicU64::new(max_queue_depth),
        }
    }

    pub fn max_message_size(&self) -> u64 {
        self.max_message_size.load(Ordering::Relaxed)
    }

    pub fn max_message_count(&self) -> u64 {
        self.max_message_count.load(Ordering::Relaxed)
    }

    pub fn max_queue_depth(&self) -> u64 {
        self.max_queue_depth.load(Ordering::Relaxed)
    }
}

impl From<&QueueDefaults> for QueueLimits {
    fn from(defaults: &QueueDefaults) -> Self {
        Self::new(
            defaults.max_message_size,
            defaults.max_message_count,
            defaults.max_queue_depth,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdKind {
    MessageCount,
    MessageSize,
    QueueDepth,
}

/// One threshold breach.
#[derive(Debug, Clone, Serialize)]
pub struct ThresholdEvent {
    pub queue: QueueName,
    pub kind: ThresholdKind,
    pub observed: u64,
    pub limit: u64,
    pub sequence: u64,
    pub timestamp_ms: u64,
    pub message: String,
}

/// Evaluates limits after each enqueue and publishes breaches.
#[derive(Debug)]
pub struct ThresholdNotifier {
    queue: QueueName,
    limits: QueueLimits,
    sequence: AtomicU64,
    sender: broadcast::Sender<ThresholdEvent>,
}

impl ThresholdNotifier {
    pub fn new(queue: QueueName, limits: QueueLimits, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            queue,
            limits,
            sequence: AtomicU64::new(0),
            sender,
        }
    }

    pub fn limits(&self) -> &QueueLimits {
        &self.limits
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ThresholdEvent> {
        self.sender.subscribe()
    }

    /// Checks the backlog state right after `message` was enqueued.
    pub fn check(&self, message: &Message, message_count: usize, queue_size: u64) {
        let count = message_count as u64;
        let max_count = self.limits.max_message_count();
        if count >= max_count {
            self.notify(
                ThresholdKind::MessageCount,
                count,
                max_count,
                format!("MessageCount = {count}, Queue has reached its size limit and is now full."),
            );
        }

        let size = message.size();
        let max_size = self.limits.max_message_size();
        if size >= max_size {
            self.notify(
                ThresholdKind::MessageSize,
                size,
                max_size,
                format!(
                    "MessageSize = {size}, Message size (MessageID={}) is higher than the threshold value",
                    message.id()
                ),
            );
        }

        let depth = self.limits.max_queue_depth();
        if queue_size >= depth {
            self.notify(
                ThresholdKind::QueueDepth,
                queue_size,
                depth,
                format!("QueueSize = {queue_size}, Queue size has reached the threshold value"),
            );
        }
    }

    fn notify(&self, kind: ThresholdKind, observed: u64, limit: u64, message: String) {
        let event = ThresholdEvent {
            queue: self.queue.clone(),
            kind,
            observed,
            limit,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed) + 1,
            timestamp_ms: now_ms(),
            message,
        };
        debug!(target: "blipq::management", queue = %self.queue, ?kind, observed, limit, "threshold exceeded");
        metrics::inc_threshold_notifications(1);
        // No listener is fine.
        let _ = self.sender.send(event);
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Point-in-time view of a queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub name: QueueName,
    pub durable: bool,
    pub owner: Option<String>,
    pub auto_delete: bool,
    pub message_count: usize,
    pub consumer_count: usize,
    pub active_consumer_count: usize,
    pub received_message_count: u64,
    pub queue_size: u64,
    pub max_message_size: u64,
    pub max_message_count: u64,
    pub max_queue_depth: u64,
}

/// One backlog entry as shown by inspection tooling.
#[derive(Debug, Clone)]
pub struct MessageView {
    pub id: MessageId,
    pub redelivered: bool,
    pub size: u64,
    pub contents: Vec<Bytes>,
}

/// Management handle of a queue. Holds the queue weakly and stops working
/// once the queue is deleted.
#[derive(Debug, Clone)]
pub struct QueueManagement {
    name: QueueName,
    queue: Weak<Queue>,
    retired: Arc<AtomicBool>,
}

impl QueueManagement {
    pub(crate) fn new(name: QueueName, queue: Weak<Queue>, retired: Arc<AtomicBool>) -> Self {
        Self {
            name,
            queue,
            retired,
        }
    }

    pub fn name(&self) -> &QueueName {
        &self.name
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    fn queue(&self) -> Result<Arc<Queue>, QueueError> {
        if self.is_retired() {
            return Err(QueueError::Retired(self.name.clone()));
        }
        self.queue
            .upgrade()
            .ok_or_else(|| QueueError::Retired(self.name.clone()))
    }

    pub fn snapshot(&self) -> Result<QueueStats, QueueError> {
        let queue = self.queue()?;
        let limits = queue.limits();
        Ok(QueueStats {
            name: queue.name().clone(),
            durable: queue.is_durable(),
            owner: queue.owner().map(str::to_owned),
            auto_delete: queue.is_auto_delete(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
            active_consumer_count: queue.active_consumer_count(),
            received_message_count: queue.received_message_count(),
            queue_size: queue.queue_size(),
            max_message_size: limits.max_message_size(),
            max_message_count: limits.max_message_count(),
            max_queue_depth: limits.max_queue_depth(),
        })
    }

    pub fn delete_message_from_top(&self) -> Result<Option<MessageId>, QueueError> {
        self.queue()?.remove_message_from_top()
    }

    pub fn clear_queue(&self) -> Result<usize, QueueError> {
        self.queue()?.clear()
    }

    pub fn set_maximum_message_size(&self, value: u64) -> Result<(), QueueError> {
        self.queue()?
            .limits()
            .max_message_size
            .store(value, Ordering::Relaxed);
        Ok(())
    }

    pub fn set_maximum_message_count(&self, value: u64) -> Result<(), QueueError> {
        self.queue()?
            .limits()
            .max_message_count
            .store(value, Ordering::Relaxed);
        Ok(())
    }

    pub fn set_queue_depth(&self, value: u64) -> Result<(), QueueError> {
        self.queue()?
            .limits()
            .max_queue_depth
            .store(value, Ordering::Relaxed);
        Ok(())
    }

    /// Backlog entries `begin..=end`, 1-based. `end` past the backlog is
    /// clamped.
    pub fn view_messages(&self, begin: usize, end: usize) -> Result<Vec<MessageView>, QueueError> {
        if begin < 1 || begin > end {
            return Err(QueueError::InvalidArgument(format!(
                "FromIndex = {begin}, ToIndex = {end}: FromIndex should be greater than 0 and not greater than ToIndex"
            )));
        }
        let messages = self.queue()?.messages();
        if begin > messages.len() {
            return Err(QueueError::InvalidArgument(format!(
                "FromIndex = {begin}. There are only {} messages in the queue",
                messages.len()
            )));
        }
        let end = end.min(messages.len());
        Ok(messages[begin - 1..end]
            .iter()
            .map(|m| MessageView {
                id: m.id(),
                redelivered: m.is_redelivered(),
                size: m.size(),
                contents: m.chunks().iter().filter(|c| !c.is_empty()).cloned().collect(),
            })
            .collect())
    }

    pub fn subscribe_notifications(
        &self,
    ) -> Result<broadcast::Receiver<ThresholdEvent>, QueueError> {
        Ok(self.queue()?.notifier().subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::MemoryMessageStore;

    fn notifier(size: u64, count: u64, depth: u64) -> ThresholdNotifier {
        ThresholdNotifier::new(QueueName::new("q"), QueueLimits::new(size, count, depth), 16)
    }

    #[test]
    fn no_event_below_limits() {
        let store = Arc::new(MemoryMessageStore::new());
        let n = notifier(100, 10, 1000);
        let mut rx = n.subscribe();
        n.check(&store.create_message("small"), 1, 5);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn each_breach_gets_its_own_sequence_number() {
        let store = Arc::new(MemoryMessageStore::new());
        let n = notifier(4, 1, 4);
        let mut rx = n.subscribe();
        n.check(&store.create_message("large"), 1, 5);

        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            [
                ThresholdKind::MessageCount,
                ThresholdKind::MessageSize,
                ThresholdKind::QueueDepth
            ]
        );
        let seqs: Vec<_> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, [1, 2, 3]);
        assert!(events[0].message.contains("MessageCount = 1"));
    }

    #[test]
    fn notifying_without_listeners_is_harmless() {
        let store = Arc::new(MemoryMessageStore::new());
        let n = notifier(0, 0, 0);
        n.check(&store.create_message("x"), 1, 1);
    }
}
