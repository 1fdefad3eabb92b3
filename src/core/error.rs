use thiserror::Error;

use crate::core::message::MessageId;
use crate::core::queue::QueueName;
use crate::core::subscription::{DeliveryTag, SubscriptionKey};

/// Failure reported by the message content store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("message {0} is not known to the store")]
    UnknownMessage(MessageId),
    #[error("message store unavailable: {0}")]
    Unavailable(String),
}

/// A message was dequeued from every queue but its content could not be
/// removed from the store. The queue state is already consistent, the
/// leftover content must be reconciled on recovery.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("message {id} is no longer referenced but its content could not be removed: {source}")]
pub struct MessageCleanupError {
    pub id: MessageId,
    #[source]
    pub source: StoreError,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExchangeError {
    #[error("exchange {exchange} has no binding {routing_key} for queue {queue}")]
    BindingNotFound {
        exchange: String,
        routing_key: String,
        queue: QueueName,
    },
    #[error("exchange {exchange} failed: {reason}")]
    Failed { exchange: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error("queue {0} is already registered")]
    AlreadyRegistered(QueueName),
    #[error("queue {0} is not registered")]
    NotRegistered(QueueName),
}

/// Errors surfaced by queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("consumer {key} is already subscribed to queue {queue}")]
    DuplicateSubscription {
        queue: QueueName,
        key: SubscriptionKey,
    },

    #[error("consumer {key} is not subscribed to queue {queue}")]
    SubscriptionNotFound {
        queue: QueueName,
        key: SubscriptionKey,
    },

    #[error("delivery tag {tag} is not outstanding for consumer {key}")]
    UnknownDeliveryTag { key: SubscriptionKey, tag: DeliveryTag },

    #[error("queue {0} has been deleted")]
    QueueDeleted(QueueName),

    #[error("management handle for queue {0} has been retired")]
    Retired(QueueName),

    /// The store could not record the removal; the message is still
    /// logically present on the queue.
    #[error("failed to dequeue message from queue {queue}: {source}")]
    FailedDequeue {
        queue: QueueName,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Binding(#[from] ExchangeError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),
}
