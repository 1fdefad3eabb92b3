//! The queue façade.
//!
//! A [`Queue`] composes a subscription set, a delivery engine and a binding
//! table, and exposes them to producers (`process`), consumers
//! (`register_subscription` / `unregister_subscription` / `acknowledge`) and
//! administrators (`delete`, `clear`, management handle).

pub mod registry;

pub use registry::{QueueDirectory, QueueRegistry};

use serde::Serialize;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::config::{QueueDefaults, CONFIG};
use crate::core::bindings::{BindingTable, Exchange};
use crate::core::delivery::{DeliveryEngine, DeliveryPool, DispatchStats, PublishOutcome};
use crate::core::error::QueueError;
use crate::core::management::{QueueLimits, QueueManagement, ThresholdNotifier};
use crate::core::message::{Message, MessageId};
use crate::core::subscription::{
    AckMode, AddRejected, ConsumerTag, DeliveryTag, Subscription, SubscriptionHandle,
    SubscriptionKey, SubscriptionOptions, SubscriptionSet,
};
use crate::metrics;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct QueueName(String);

impl QueueName {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for QueueName {
    fn from(s: &str) -> Self {
        QueueName(s.to_owned())
    }
}

impl From<String> for QueueName {
    fn from(s: String) -> Self {
        QueueName(s)
    }
}

pub struct QueueBuilder {
    name: QueueName,
    directory: Arc<dyn QueueDirectory>,
    durable: bool,
    owner: Option<String>,
    auto_delete: bool,
    limits: Option<QueueDefaults>,
    pool: Option<Arc<DeliveryPool>>,
}

impl QueueBuilder {
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Makes the queue exclusive to one connection.
    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    /// Threshold limits; defaults to `[queues]` in the global config.
    pub fn limits(mut self, limits: QueueDefaults) -> Self {
        self.limits = Some(limits);
        self
    }

    /// Pool for asynchronous dispatch; defaults to the shared pool.
    pub fn pool(mut self, pool: Arc<DeliveryPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Creates the queue and registers it in the directory.
    pub fn build(self) -> Result<Arc<Queue>, QueueError> {
        if self.name.is_empty() {
            return Err(QueueError::InvalidArgument(
                "queue name must not be empty".into(),
            ));
        }
        let defaults = self.limits.unwrap_or_else(|| CONFIG.queues.clone());
        let notifier = Arc::new(ThresholdNotifier::new(
            self.name.clone(),
            QueueLimits::from(&defaults),
            defaults.notification_capacity,
        ));
        let subscriptions = Arc::new(SubscriptionSet::new());
        let engine = Arc::new(DeliveryEngine::new(
            self.name.clone(),
            Arc::clone(&subscriptions),
            Arc::clone(&notifier),
        ));

        let queue = Arc::new(Queue {
            name: self.name,
            durable: self.durable,
            owner: self.owner,
            auto_delete: self.auto_delete,
            subscriptions,
            engine,
            bindings: BindingTable::new(),
            directory: Arc::downgrade(&self.directory),
            pool: self.pool.unwrap_or_else(DeliveryPool::global),
            notifier,
            received: AtomicU64::new(0),
            deleted: AtomicBool::new(false),
            management_retired: Arc::new(AtomicBool::new(false)),
        });
        self.directory.register_queue(Arc::clone(&queue))?;
        debug!(target: "blipq::queue", queue = %queue.name, durable = queue.durable, auto_delete = queue.auto_delete, "queue created");
        Ok(queue)
    }
}

/// An AMQP queue: named backlog plus competing consumers.
#[derive(Debug)]
pub struct Queue {
    name: QueueName,
    durable: bool,
    /// `None` means shared.
    owner: Option<String>,
    auto_delete: bool,
    subscriptions: Arc<SubscriptionSet>,
    engine: Arc<DeliveryEngine>,
    bindings: BindingTable,
    directory: Weak<dyn QueueDirectory>,
    pool: Arc<DeliveryPool>,
    notifier: Arc<ThresholdNotifier>,
    received: AtomicU64,
    deleted: AtomicBool,
    management_retired: Arc<AtomicBool>,
}

impl Queue {
    pub fn builder(name: impl Into<QueueName>, directory: Arc<dyn QueueDirectory>) -> QueueBuilder {
        QueueBuilder {
            name: name.into(),
            directory,
            durable: false,
            owner: None,
            auto_delete: false,
            limits: None,
            pool: None,
        }
    }

    pub fn name(&self) -> &QueueName {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn is_shared(&self) -> bool {
        self.owner.is_none()
    }

    pub fn is_auto_delete(&self) -> bool {
        self.auto_delete
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Messages waiting in the backlog.
    pub fn message_count(&self) -> usize {
        self.engine.message_count()
    }

    pub fn queue_size(&self) -> u64 {
        self.engine.queue_size()
    }

    pub fn consumer_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn active_consumer_count(&self) -> usize {
        self.subscriptions.weight()
    }

    pub fn received_message_count(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn messages(&self) -> Vec<Message> {
        self.engine.messages()
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.engine.stats()
    }

    pub fn bindings(&self) -> Vec<(String, String)> {
        self.bindings.snapshot()
    }

    pub(crate) fn limits(&self) -> &QueueLimits {
        self.notifier.limits()
    }

    pub(crate) fn notifier(&self) -> &ThresholdNotifier {
        &self.notifier
    }

    pub fn management(self: &Arc<Self>) -> QueueManagement {
        QueueManagement::new(
            self.name.clone(),
            Arc::downgrade(self),
            Arc::clone(&self.management_retired),
        )
    }

    pub fn bind(&self, routing_key: impl Into<String>, exchange: Arc<dyn Exchange>) {
        self.bindings.add(routing_key, exchange);
    }

    /// Entry point for a routed message. Takes a reference on the message,
    /// enqueues it and tries to hand it out straight away.
    ///
    /// An immediate message that no consumer took is released again and
    /// reported as [`PublishOutcome::NoConsumers`]; that is an outcome, not
    /// an error.
    #[tracing::instrument(level = "trace", skip(self, message), fields(queue = %self.name, id = %message.id()))]
    pub fn process(&self, message: Message) -> Result<PublishOutcome, QueueError> {
        if self.is_deleted() {
            return Err(QueueError::QueueDeleted(self.name.clone()));
        }
        message.increment_reference();
        let outcome = match self.engine.deliver(message.clone()) {
            Ok(outcome) => outcome,
            Err(e) => {
                // Deleted under our feet; the message never entered the backlog.
                if let Err(cleanup) = message.decrement_reference() {
                    metrics::inc_cleanup_failures(1);
                    warn!(target: "blipq::queue", queue = %self.name, id = %cleanup.id, error = %cleanup, "message cleanup failed");
                }
                return Err(e);
            }
        };
        self.received.fetch_add(1, Ordering::Relaxed);

        if outcome == PublishOutcome::NoConsumers {
            debug!(target: "blipq::queue", queue = %self.name, id = %message.id(), "no consumers for immediate message");
            metrics::inc_no_consumers(1);
            self.dequeue(&message)?;
        }
        Ok(outcome)
    }

    /// Releases this queue's reference to `message`.
    pub fn dequeue(&self, message: &Message) -> Result<(), QueueError> {
        self.engine.release(message)
    }

    pub fn register_subscription(
        &self,
        channel: u16,
        consumer_tag: impl Into<String>,
        ack_mode: AckMode,
    ) -> Result<SubscriptionHandle, QueueError> {
        self.register_subscription_with(SubscriptionOptions::new(channel, consumer_tag, ack_mode))
    }

    pub fn register_subscription_with(
        &self,
        options: SubscriptionOptions,
    ) -> Result<SubscriptionHandle, QueueError> {
        let consumer_tag = if options.consumer_tag.is_empty() {
            ConsumerTag::generate()
        } else {
            ConsumerTag::from(options.consumer_tag)
        };
        let key = SubscriptionKey::new(options.channel, consumer_tag);
        debug!(target: "blipq::queue", queue = %self.name, consumer = %key, ack_mode = ?options.ack_mode, "registering subscription");

        let (tx, rx) = flume::unbounded();
        let subscription = Arc::new(Subscription::new(
            key.clone(),
            options.ack_mode,
            options.prefetch,
            tx,
        ));
        self.subscriptions
            .add(subscription)
            .map_err(|rejected| match rejected {
                AddRejected::Duplicate => QueueError::DuplicateSubscription {
                    queue: self.name.clone(),
                    key: key.clone(),
                },
                AddRejected::Closed => QueueError::QueueDeleted(self.name.clone()),
            })?;

        self.trigger_async_delivery();
        Ok(SubscriptionHandle::new(key, rx))
    }

    /// Detaches a consumer. Its unacknowledged messages go back to the head
    /// of the backlog marked redelivered. On an auto-delete queue the last
    /// detach deletes the queue.
    pub fn unregister_subscription(
        &self,
        channel: u16,
        consumer_tag: &str,
    ) -> Result<(), QueueError> {
        let key = SubscriptionKey::new(channel, consumer_tag);
        debug!(target: "blipq::queue", queue = %self.name, consumer = %key, "unregistering subscription");

        let removal = self
            .subscriptions
            .remove(&key, self.auto_delete)
            .ok_or_else(|| QueueError::SubscriptionNotFound {
                queue: self.name.clone(),
                key: key.clone(),
            })?;

        let unacked = removal.subscription.take_unacknowledged();
        let requeued = !unacked.is_empty();
        self.engine.requeue(unacked);

        if removal.closed {
            debug!(target: "blipq::queue", queue = %self.name, "auto-deleting");
            let result = self.delete();
            // The set is already empty, so the broadcast inside delete()
            // cannot reach the subscription that was just removed.
            removal.subscription.queue_deleted(&self.name);
            result?;
        } else if requeued {
            self.trigger_async_delivery();
        }
        Ok(())
    }

    /// Positive acknowledgement of an explicit-ack delivery.
    pub fn acknowledge(
        &self,
        channel: u16,
        consumer_tag: &str,
        delivery_tag: DeliveryTag,
    ) -> Result<(), QueueError> {
        let subscription = self.subscription(channel, consumer_tag)?;
        let message = subscription.acknowledge(delivery_tag).ok_or_else(|| {
            QueueError::UnknownDeliveryTag {
                key: subscription.key().clone(),
                tag: delivery_tag,
            }
        })?;

        if let Err(e) = self.dequeue(&message) {
            self.restore(&subscription, delivery_tag, message);
            return Err(e);
        }
        metrics::inc_acknowledged(1);

        if self.message_count() > 0 {
            self.trigger_async_delivery();
        }
        Ok(())
    }

    /// Negative acknowledgement. With `requeue` the message goes back to the
    /// head of the backlog, otherwise it is dropped.
    pub fn reject(
        &self,
        channel: u16,
        consumer_tag: &str,
        delivery_tag: DeliveryTag,
        requeue: bool,
    ) -> Result<(), QueueError> {
        let subscription = self.subscription(channel, consumer_tag)?;
        let message = subscription.acknowledge(delivery_tag).ok_or_else(|| {
            QueueError::UnknownDeliveryTag {
                key: subscription.key().clone(),
                tag: delivery_tag,
            }
        })?;

        if requeue {
            self.engine.requeue(vec![message]);
        } else if let Err(e) = self.dequeue(&message) {
            self.restore(&subscription, delivery_tag, message);
            return Err(e);
        }
        self.trigger_async_delivery();
        Ok(())
    }

    /// Undoes a failed acknowledgement. If the consumer detached meanwhile
    /// the message goes back to the backlog.
    fn restore(&self, subscription: &Subscription, tag: DeliveryTag, message: Message) {
        if let Some(message) = subscription.restore_unacknowledged(tag, message) {
            self.engine.requeue(vec![message]);
        }
    }

    /// Flow control: a suspended subscription stays attached but receives
    /// nothing.
    pub fn suspend_subscription(&self, channel: u16, consumer_tag: &str) -> Result<(), QueueError> {
        self.set_suspended(channel, consumer_tag, true)
    }

    pub fn resume_subscription(&self, channel: u16, consumer_tag: &str) -> Result<(), QueueError> {
        self.set_suspended(channel, consumer_tag, false)?;
        self.trigger_async_delivery();
        Ok(())
    }

    fn set_suspended(&self, channel: u16, consumer_tag: &str, suspended: bool) -> Result<(), QueueError> {
        let key = SubscriptionKey::new(channel, consumer_tag);
        match self.subscriptions.set_suspended(&key, suspended) {
            Some(_) => Ok(()),
            None => Err(QueueError::SubscriptionNotFound {
                queue: self.name.clone(),
                key,
            }),
        }
    }

    fn subscription(&self, channel: u16, consumer_tag: &str) -> Result<Arc<Subscription>, QueueError> {
        let key = SubscriptionKey::new(channel, consumer_tag);
        self.subscriptions
            .get(&key)
            .ok_or_else(|| QueueError::SubscriptionNotFound {
                queue: self.name.clone(),
                key,
            })
    }

    /// Schedules one dispatch pass on the delivery pool.
    pub fn trigger_async_delivery(&self) {
        self.engine.process_async(&self.pool);
    }

    /// Conditional delete. Refusals return `Ok(0)` and change nothing.
    pub fn delete_if(&self, check_unused: bool, check_empty: bool) -> Result<usize, QueueError> {
        if check_empty && self.message_count() > 0 {
            info!(target: "blipq::queue", queue = %self.name, "will not delete: queue is not empty");
            return Ok(0);
        }
        // Closing and the emptiness check happen under one lock so a consumer
        // cannot slip in between.
        if check_unused && !self.subscriptions.close_if_empty() {
            info!(target: "blipq::queue", queue = %self.name, "will not delete: queue is in use");
            return Ok(0);
        }
        self.delete()
    }

    /// Unconditional delete: tells every consumer, drops every binding,
    /// leaves the directory and retires the management handle. Every step
    /// runs even if an earlier one fails; the first failure is returned.
    /// Returns the number of backlog messages outstanding at deletion.
    pub fn delete(&self) -> Result<usize, QueueError> {
        if self.deleted.swap(true, Ordering::AcqRel) {
            return Ok(0);
        }
        info!(target: "blipq::queue", queue = %self.name, "deleting queue");
        let mut first_error: Option<QueueError> = None;

        let subscriptions = self.subscriptions.close_with_notice(&self.name);
        for subscription in &subscriptions {
            for message in subscription.take_unacknowledged() {
                if let Err(e) = self.dequeue(&message) {
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Err(e) = self.bindings.deregister_all(&self.name) {
            first_error.get_or_insert(e.into());
        }

        match self.directory.upgrade() {
            Some(directory) => {
                if let Err(e) = directory.unregister_queue(&self.name) {
                    first_error.get_or_insert(e.into());
                }
            }
            None => debug!(target: "blipq::queue", queue = %self.name, "directory already dropped"),
        }

        self.management_retired.store(true, Ordering::Release);

        let outstanding = self.engine.close();
        if let Err(e) = self.engine.clear() {
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => {
                warn!(target: "blipq::queue", queue = %self.name, error = %e, "queue delete incomplete; left for inspection");
                Err(e)
            }
            None => Ok(outstanding),
        }
    }

    /// Administrative: drop the oldest backlog message.
    pub fn remove_message_from_top(&self) -> Result<Option<MessageId>, QueueError> {
        self.engine.remove_from_top()
    }

    /// Administrative: drop the whole backlog.
    pub fn clear(&self) -> Result<usize, QueueError> {
        self.engine.clear()
    }
}

impl PartialEq for Queue {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Queue {}

impl Hash for Queue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Display for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Queue({})", self.name)
    }
}
