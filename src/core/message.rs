//! Reference-counted message handles.
//!
//! A [`Message`] never owns the payload bytes on behalf of the broker: the
//! content lives in a [`MessageStore`] and the handle only counts how many
//! queues still hold it. When that count drops to zero the store is asked to
//! remove the content.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

use crate::core::error::{MessageCleanupError, StoreError};
use crate::core::queue::QueueName;
use crate::core::store::MessageStore;
use crate::core::subscription::SubscriptionKey;

/// Broker-wide message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(u64);

impl MessageId {
    pub fn value(self) -> u64 {
        self.0
    }

    pub fn from_raw(value: u64) -> Self {
        MessageId(value)
    }

    /// Generates a monotonically increasing id (lock-free).
    pub fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        MessageId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shared handle to a routed message. Cloning is cheap and does not touch
/// the reference count; only queues do that.
#[derive(Debug, Clone)]
pub struct Message {
    inner: Arc<MessageInner>,
}

#[derive(Debug)]
struct MessageInner {
    id: MessageId,
    chunks: Vec<Bytes>,
    size: u64,
    immediate: bool,
    store: Arc<dyn MessageStore>,
    references: AtomicUsize,
    redelivered: AtomicBool,
    delivered_to_consumer: AtomicBool,
    acquired_by: Mutex<Option<SubscriptionKey>>,
}

/// Builder for messages whose content is already held by a store.
#[derive(Debug, Default)]
pub struct MessageBuilder {
    id: Option<MessageId>,
    chunks: Vec<Bytes>,
    immediate: bool,
}

impl MessageBuilder {
    pub fn id(mut self, id: MessageId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn chunk(mut self, chunk: impl Into<Bytes>) -> Self {
        self.chunks.push(chunk.into());
        self
    }

    /// Publish with "immediate" semantics: if no consumer takes the message
    /// on arrival it is released instead of queued.
    pub fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }

    pub fn build(self, store: Arc<dyn MessageStore>) -> Message {
        let size = self.chunks.iter().map(|c| c.len() as u64).sum();
        Message {
            inner: Arc::new(MessageInner {
                id: self.id.unwrap_or_else(MessageId::next),
                chunks: self.chunks,
                size,
                immediate: self.immediate,
                store,
                references: AtomicUsize::new(0),
                redelivered: AtomicBool::new(false),
                delivered_to_consumer: AtomicBool::new(false),
                acquired_by: Mutex::new(None),
            }),
        }
    }
}

impl Message {
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    #[inline]
    pub fn id(&self) -> MessageId {
        self.inner.id
    }

    /// Content length in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.inner.size
    }

    /// Content body chunks in arrival order.
    pub fn chunks(&self) -> &[Bytes] {
        &self.inner.chunks
    }

    /// Contiguous copy of the content. Only inspection tooling needs this.
    pub fn payload(&self) -> Bytes {
        match self.inner.chunks.as_slice() {
            [] => Bytes::new(),
            [single] => single.clone(),
            chunks => {
                let mut buf = BytesMut::with_capacity(self.inner.size as usize);
                for chunk in chunks {
                    buf.extend_from_slice(chunk);
                }
                buf.freeze()
            }
        }
    }

    #[inline]
    pub fn is_immediate(&self) -> bool {
        self.inner.immediate
    }

    #[inline]
    pub fn reference_count(&self) -> usize {
        self.inner.references.load(Ordering::Acquire)
    }

    pub fn increment_reference(&self) {
        let count = self.inner.references.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(target: "blipq::message", id = %self.id(), references = count, "reference acquired");
    }

    /// Drops one reference. At zero the content is removed from the store;
    /// a removal failure is returned but the handle is released either way.
    pub fn decrement_reference(&self) -> Result<(), MessageCleanupError> {
        let previous = self
            .inner
            .references
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));

        match previous {
            Ok(1) => {
                trace!(target: "blipq::message", id = %self.id(), "last reference released");
                self.inner
                    .store
                    .remove_message(self.id())
                    .map_err(|source| MessageCleanupError {
                        id: self.id(),
                        source,
                    })
            }
            Ok(_) => Ok(()),
            Err(_) => {
                warn!(target: "blipq::message", id = %self.id(), "reference released more often than acquired");
                Ok(())
            }
        }
    }

    /// Records with the store that `queue` no longer holds this message.
    pub fn dequeue(&self, queue: &QueueName) -> Result<(), StoreError> {
        self.inner.store.dequeue(queue, self.id())
    }

    #[inline]
    pub fn is_redelivered(&self) -> bool {
        self.inner.redelivered.load(Ordering::Acquire)
    }

    pub fn set_redelivered(&self) {
        self.inner.redelivered.store(true, Ordering::Release);
    }

    /// True once any consumer has been handed this message.
    #[inline]
    pub fn is_delivered_to_consumer(&self) -> bool {
        self.inner.delivered_to_consumer.load(Ordering::Acquire)
    }

    pub(crate) fn mark_acquired(&self, by: &SubscriptionKey) {
        *self.inner.acquired_by.lock() = Some(by.clone());
        self.inner
            .delivered_to_consumer
            .store(true, Ordering::Release);
    }

    /// Returns the message to an unacquired state; used when it goes back
    /// to a backlog.
    pub(crate) fn clear_acquired(&self) {
        self.inner.acquired_by.lock().take();
    }

    pub fn acquired_by(&self) -> Option<SubscriptionKey> {
        self.inner.acquired_by.lock().clone()
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Message {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::MemoryMessageStore;

    #[derive(Debug)]
    struct FailingStore;

    impl MessageStore for FailingStore {
        fn dequeue(&self, _queue: &QueueName, id: MessageId) -> Result<(), StoreError> {
            Err(StoreError::UnknownMessage(id))
        }

        fn remove_message(&self, _id: MessageId) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("disk detached".into()))
        }
    }

    #[test]
    fn last_reference_removes_content() {
        let store = Arc::new(MemoryMessageStore::new());
        let msg = store.create_message("hello");
        msg.increment_reference();
        msg.increment_reference();

        msg.decrement_reference().unwrap();
        assert!(store.contains(msg.id()));

        msg.decrement_reference().unwrap();
        assert_eq!(msg.reference_count(), 0);
        assert!(!store.contains(msg.id()));
    }

    #[test]
    fn cleanup_failure_still_releases_reference() {
        let msg = Message::builder().chunk("x").build(Arc::new(FailingStore));
        msg.increment_reference();

        let err = msg.decrement_reference().unwrap_err();
        assert_eq!(err.id, msg.id());
        assert_eq!(msg.reference_count(), 0);
    }

    #[test]
    fn extra_release_does_not_underflow() {
        let store = Arc::new(MemoryMessageStore::new());
        let msg = store.create_message("x");
        assert!(msg.decrement_reference().is_ok());
        assert_eq!(msg.reference_count(), 0);
    }

    #[test]
    fn payload_joins_chunks() {
        let store = Arc::new(MemoryMessageStore::new());
        let msg = Message::builder()
            .chunk("hello ")
            .chunk("world")
            .build(store);
        assert_eq!(msg.size(), 11);
        assert_eq!(msg.chunks().len(), 2);
        assert_eq!(msg.payload(), Bytes::from_static(b"hello world"));
    }

    #[test]
    fn acquisition_marks_delivery() {
        let store = Arc::new(MemoryMessageStore::new());
        let msg = store.create_message("x");
        let key = SubscriptionKey::new(1, "c1");
        assert!(!msg.is_delivered_to_consumer());

        msg.mark_acquired(&key);
        assert_eq!(msg.acquired_by(), Some(key));
        assert!(msg.is_delivered_to_consumer());

        msg.clear_acquired();
        assert!(msg.acquired_by().is_none());
    }
}
