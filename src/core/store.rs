//! Content store seam.
//!
//! The broker keeps message bodies outside the queue. A queue only tells the
//! store when it has dropped a message and, once nothing references the
//! message any more, asks for the content to be removed.

use bytes::Bytes;
use dashmap::DashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::core::error::StoreError;
use crate::core::message::{Message, MessageBuilder, MessageId};
use crate::core::queue::QueueName;

pub trait MessageStore: Send + Sync + Debug {
    /// Persist that `queue` no longer holds `message`.
    fn dequeue(&self, queue: &QueueName, message: MessageId) -> Result<(), StoreError>;

    /// Remove the content of a message nothing references any more.
    fn remove_message(&self, message: MessageId) -> Result<(), StoreError>;
}

/// In-memory store, used for transient queues and tests.
#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    messages: DashMap<MessageId, Vec<Bytes>>,
    dequeues: AtomicU64,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `payload` and returns a handle to it.
    pub fn create_message(self: &Arc<Self>, payload: impl Into<Bytes>) -> Message {
        self.insert(Message::builder().chunk(payload))
    }

    /// Same as [`create_message`](Self::create_message) but published with
    /// immediate-delivery semantics.
    pub fn create_immediate_message(self: &Arc<Self>, payload: impl Into<Bytes>) -> Message {
        self.insert(Message::builder().chunk(payload).immediate(true))
    }

    fn insert(self: &Arc<Self>, builder: MessageBuilder) -> Message {
        let message = builder.build(Arc::clone(self) as Arc<dyn MessageStore>);
        self.messages.insert(message.id(), message.chunks().to_vec());
        message
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.messages.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Number of dequeue records written so far.
    pub fn dequeue_count(&self) -> u64 {
        self.dequeues.load(Ordering::Relaxed)
    }
}

impl MessageStore for MemoryMessageStore {
    fn dequeue(&self, _queue: &QueueName, message: MessageId) -> Result<(), StoreError> {
        if !self.messages.contains_key(&message) {
            return Err(StoreError::UnknownMessage(message));
        }
        self.dequeues.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn remove_message(&self, message: MessageId) -> Result<(), StoreError> {
        self.messages
            .remove(&message)
            .map(|_| ())
            .ok_or(StoreError::UnknownMessage(message))
    }
}
