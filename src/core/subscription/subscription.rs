use flume::{Receiver, Sender};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::trace;

use crate::core::message::Message;
use crate::core::queue::QueueName;

/// Consumer tag chosen by the client (or generated by the broker).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerTag(String);

impl ConsumerTag {
    /// Server-generated tag for clients that leave it blank.
    pub fn generate() -> Self {
        ConsumerTag(format!("amq.ctag-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsumerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConsumerTag {
    fn from(s: &str) -> Self {
        ConsumerTag(s.to_owned())
    }
}

impl From<String> for ConsumerTag {
    fn from(s: String) -> Self {
        ConsumerTag(s)
    }
}

impl Deref for ConsumerTag {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Identity of a subscription within one queue: channel + consumer tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub channel: u16,
    pub consumer_tag: ConsumerTag,
}

impl SubscriptionKey {
    pub fn new(channel: u16, consumer_tag: impl Into<ConsumerTag>) -> Self {
        Self {
            channel,
            consumer_tag: consumer_tag.into(),
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.channel, self.consumer_tag)
    }
}

/// Per-subscription delivery tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(u64);

impl DeliveryTag {
    pub fn value(self) -> u64 {
        self.0
    }

    pub fn from_raw(value: u64) -> Self {
        DeliveryTag(value)
    }
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Message is released as soon as it is handed over.
    Auto,
    /// Message stays referenced until the consumer acknowledges it.
    Explicit,
}

impl AckMode {
    #[inline]
    pub fn requires_ack(self) -> bool {
        matches!(self, AckMode::Explicit)
    }
}

/// Parameters of a consume request.
#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    pub channel: u16,
    /// Empty tag ⇒ the broker generates one.
    pub consumer_tag: String,
    pub ack_mode: AckMode,
    /// Max unacknowledged deliveries; 0 = unlimited. Ignored for `AckMode::Auto`.
    pub prefetch: u32,
}

impl SubscriptionOptions {
    pub fn new(channel: u16, consumer_tag: impl Into<String>, ack_mode: AckMode) -> Self {
        Self {
            channel,
            consumer_tag: consumer_tag.into(),
            ack_mode,
            prefetch: 0,
        }
    }

    pub fn prefetch(mut self, prefetch: u32) -> Self {
        self.prefetch = prefetch;
        self
    }
}

/// One message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: QueueName,
    pub consumer_tag: ConsumerTag,
    pub delivery_tag: DeliveryTag,
    pub redelivered: bool,
    pub message: Message,
}

/// Events pushed to the session layer for one subscription.
#[derive(Debug, Clone)]
pub enum ConsumerEvent {
    Deliver(Delivery),
    QueueDeleted(QueueName),
}

/// Deliveries awaiting acknowledgement. Once `detached` is set the
/// subscription takes no further deliveries.
#[derive(Debug, Default)]
struct Outstanding {
    messages: BTreeMap<DeliveryTag, Message>,
    detached: bool,
}

/// A consumer attached to a queue.
///
/// `suspended` is only flipped by the owning `SubscriptionSet` while it holds
/// its lock, so the set's weight stays in step with it.
#[derive(Debug)]
pub struct Subscription {
    key: SubscriptionKey,
    ack_mode: AckMode,
    prefetch: u32,
    suspended: AtomicBool,
    next_tag: AtomicU64,
    unacked: Mutex<Outstanding>,
    sender: Sender<ConsumerEvent>,
    deletion_notified: AtomicBool,
}

impl Subscription {
    pub fn new(
        key: SubscriptionKey,
        ack_mode: AckMode,
        prefetch: u32,
        sender: Sender<ConsumerEvent>,
    ) -> Self {
        Self {
            key,
            ack_mode,
            prefetch,
            suspended: AtomicBool::new(false),
            next_tag: AtomicU64::new(1),
            unacked: Mutex::new(Outstanding::default()),
            sender,
            deletion_notified: AtomicBool::new(false),
        }
    }

    #[inline(always)]
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    #[inline(always)]
    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    #[inline(always)]
    pub fn prefetch(&self) -> u32 {
        self.prefetch
    }

    #[inline]
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    pub(crate) fn set_suspended(&self, suspended: bool) -> bool {
        self.suspended.swap(suspended, Ordering::AcqRel) != suspended
    }

    pub fn unacknowledged_count(&self) -> usize {
        self.unacked.lock().messages.len()
    }

    pub fn is_detached(&self) -> bool {
        self.unacked.lock().detached
    }

    /// Whether this subscription will accept a delivery right now.
    pub fn is_ready(&self) -> bool {
        if self.is_suspended() || self.sender.is_disconnected() {
            return false;
        }
        let outstanding = self.unacked.lock();
        !outstanding.detached
            && (!self.ack_mode.requires_ack()
                || self.prefetch == 0
                || outstanding.messages.len() < self.prefetch as usize)
    }

    /// Hands `message` to the consumer. Gives the message back if the
    /// subscription was detached or the consumer side has gone away.
    ///
    /// Runs under the `unacked` lock so a concurrent
    /// [`take_unacknowledged`](Self::take_unacknowledged) either sees the
    /// delivery or makes it fail.
    pub(crate) fn deliver(&self, queue: &QueueName, message: Message) -> Result<DeliveryTag, Message> {
        let mut outstanding = self.unacked.lock();
        if outstanding.detached {
            return Err(message);
        }
        let tag = DeliveryTag(self.next_tag.fetch_add(1, Ordering::Relaxed));

        let event = ConsumerEvent::Deliver(Delivery {
            queue: queue.clone(),
            consumer_tag: self.key.consumer_tag.clone(),
            delivery_tag: tag,
            redelivered: message.is_redelivered(),
            message: message.clone(),
        });

        if self.sender.send(event).is_err() {
            return Err(message);
        }
        if self.ack_mode.requires_ack() {
            outstanding.messages.insert(tag, message);
        }
        trace!(target: "blipq::subscription", consumer = %self.key, tag = %tag, "delivered");
        Ok(tag)
    }

    pub(crate) fn acknowledge(&self, tag: DeliveryTag) -> Option<Message> {
        self.unacked.lock().messages.remove(&tag)
    }

    /// Puts an acknowledged message back after its release failed. A
    /// detached subscription hands it back instead.
    pub(crate) fn restore_unacknowledged(&self, tag: DeliveryTag, message: Message) -> Option<Message> {
        let mut outstanding = self.unacked.lock();
        if outstanding.detached {
            return Some(message);
        }
        outstanding.messages.insert(tag, message);
        None
    }

    /// Detaches the subscription and takes every unacknowledged message,
    /// oldest delivery first. Later deliveries are refused.
    pub(crate) fn take_unacknowledged(&self) -> Vec<Message> {
        let mut outstanding = self.unacked.lock();
        outstanding.detached = true;
        std::mem::take(&mut outstanding.messages)
            .into_values()
            .collect()
    }

    /// Sends the queue-deleted event. Each subscription hears it at most once.
    pub fn queue_deleted(&self, queue: &QueueName) -> bool {
        if self.deletion_notified.swap(true, Ordering::AcqRel) {
            return false;
        }
        // Receiver may already be gone; nothing left to tell then.
        let _ = self.sender.send(ConsumerEvent::QueueDeleted(queue.clone()));
        true
    }
}

/// Consumer side of a subscription, handed to the session layer.
#[derive(Debug)]
pub struct SubscriptionHandle {
    key: SubscriptionKey,
    receiver: Receiver<ConsumerEvent>,
}

impl SubscriptionHandle {
    pub(crate) fn new(key: SubscriptionKey, receiver: Receiver<ConsumerEvent>) -> Self {
        Self { key, receiver }
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    pub fn consumer_tag(&self) -> &ConsumerTag {
        &self.key.consumer_tag
    }

    pub fn try_recv(&self) -> Option<ConsumerEvent> {
        self.receiver.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<ConsumerEvent> {
        self.receiver.recv_timeout(timeout).ok()
    }

    /// Drains every event currently buffered.
    pub fn drain(&self) -> Vec<ConsumerEvent> {
        self.receiver.try_iter().collect()
    }

    pub fn receiver(&self) -> &Receiver<ConsumerEvent> {
        &self.receiver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::MemoryMessageStore;
    use std::sync::Arc;

    fn subscription(ack_mode: AckMode, prefetch: u32) -> (Subscription, Receiver<ConsumerEvent>) {
        let (tx, rx) = flume::unbounded();
        (
            Subscription::new(SubscriptionKey::new(1, "c1"), ack_mode, prefetch, tx),
            rx,
        )
    }

    #[test]
    fn explicit_ack_tracks_until_acknowledged() {
        let store = Arc::new(MemoryMessageStore::new());
        let (sub, rx) = subscription(AckMode::Explicit, 0);
        let queue = QueueName::new("q");

        let tag = sub.deliver(&queue, store.create_message("m")).unwrap();
        assert_eq!(sub.unacknowledged_count(), 1);
        assert!(matches!(rx.try_recv(), Ok(ConsumerEvent::Deliver(d)) if d.delivery_tag == tag));

        assert!(sub.acknowledge(tag).is_some());
        assert!(sub.acknowledge(tag).is_none());
        assert_eq!(sub.unacknowledged_count(), 0);
    }

    #[test]
    fn prefetch_limits_readiness() {
        let store = Arc::new(MemoryMessageStore::new());
        let (sub, _rx) = subscription(AckMode::Explicit, 1);
        let queue = QueueName::new("q");
        assert!(sub.is_ready());

        let tag = sub.deliver(&queue, store.create_message("m")).unwrap();
        assert!(!sub.is_ready());

        sub.acknowledge(tag);
        assert!(sub.is_ready());
    }

    #[test]
    fn auto_ack_ignores_prefetch() {
        let store = Arc::new(MemoryMessageStore::new());
        let (sub, _rx) = subscription(AckMode::Auto, 1);
        let queue = QueueName::new("q");
        sub.deliver(&queue, store.create_message("a")).unwrap();
        sub.deliver(&queue, store.create_message("b")).unwrap();
        assert_eq!(sub.unacknowledged_count(), 0);
        assert!(sub.is_ready());
    }

    #[test]
    fn delivery_to_dropped_consumer_returns_message() {
        let store = Arc::new(MemoryMessageStore::new());
        let (sub, rx) = subscription(AckMode::Explicit, 0);
        drop(rx);
        let msg = store.create_message("m");

        let returned = sub.deliver(&QueueName::new("q"), msg.clone()).unwrap_err();
        assert_eq!(returned, msg);
        assert_eq!(sub.unacknowledged_count(), 0);
        assert!(!sub.is_ready());
    }

    #[test]
    fn queue_deleted_is_sent_once() {
        let (sub, rx) = subscription(AckMode::Auto, 0);
        let queue = QueueName::new("q");
        assert!(sub.queue_deleted(&queue));
        assert!(!sub.queue_deleted(&queue));
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn unacknowledged_come_back_in_delivery_order() {
        let store = Arc::new(MemoryMessageStore::new());
        let (sub, _rx) = subscription(AckMode::Explicit, 0);
        let queue = QueueName::new("q");
        let first = store.create_message("1");
        let second = store.create_message("2");
        sub.deliver(&queue, first.clone()).unwrap();
        sub.deliver(&queue, second.clone()).unwrap();

        assert_eq!(sub.take_unacknowledged(), vec![first, second]);
        assert_eq!(sub.unacknowledged_count(), 0);
    }

    #[test]
    fn detached_subscription_refuses_deliveries() {
        let store = Arc::new(MemoryMessageStore::new());
        let (sub, rx) = subscription(AckMode::Explicit, 0);
        let queue = QueueName::new("q");
        let held = store.create_message("held");
        let tag = sub.deliver(&queue, held.clone()).unwrap();

        assert_eq!(sub.take_unacknowledged(), vec![held.clone()]);
        assert!(sub.is_detached());
        assert!(!sub.is_ready());

        let late = store.create_message("late");
        assert_eq!(sub.deliver(&queue, late.clone()).unwrap_err(), late);
        assert_eq!(sub.restore_unacknowledged(tag, held.clone()), Some(held));
        assert_eq!(sub.unacknowledged_count(), 0);
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn generated_tags_are_unique() {
        let a = ConsumerTag::generate();
        let b = ConsumerTag::generate();
        assert_ne!(a, b);
        assert!(a.starts_with("amq.ctag-"));
    }
}
