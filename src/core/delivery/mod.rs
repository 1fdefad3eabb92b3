//! Delivery engine: owns the backlog of a queue and matches it against the
//! queue's subscriptions.
//!
//! At most one dispatch pass runs per queue at any instant. A trigger that
//! arrives while a pass is running only raises `pending`; the running pass
//! notices and loops once more, so triggers coalesce instead of racing for
//! the same backlog head.

pub mod pool;

pub use pool::DeliveryPool;

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

use crate::core::error::QueueError;
use crate::core::management::ThresholdNotifier;
use crate::core::message::{Message, MessageId};
use crate::core::queue::QueueName;
use crate::core::subscription::{Subscription, SubscriptionSet};
use crate::metrics;

/// What happened to a message handed to [`DeliveryEngine::deliver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// A consumer took it during the inline pass.
    Delivered,
    /// Left in the backlog for a later pass.
    Queued,
    /// Immediate message with nobody to take it; withdrawn from the backlog.
    NoConsumers,
}

/// Counters describing dispatch activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub passes: u64,
    pub handoffs: u64,
    /// Highest number of passes ever seen running at once. Anything above 1
    /// is a single-flight violation.
    pub peak_concurrent_passes: usize,
}

#[derive(Debug, Default)]
struct Backlog {
    messages: VecDeque<Message>,
    bytes: u64,
    /// Set when the queue is deleted; nothing enters the backlog after.
    closed: bool,
}

impl Backlog {
    fn push_back(&mut self, message: Message) {
        self.bytes += message.size();
        self.messages.push_back(message);
    }

    fn push_front(&mut self, message: Message) {
        self.bytes += message.size();
        self.messages.push_front(message);
    }

    fn pop_front(&mut self) -> Option<Message> {
        let message = self.messages.pop_front()?;
        self.bytes -= message.size();
        Some(message)
    }

    fn remove(&mut self, id: MessageId) -> Option<Message> {
        let idx = self.messages.iter().position(|m| m.id() == id)?;
        let message = self.messages.remove(idx)?;
        self.bytes -= message.size();
        Some(message)
    }
}

#[derive(Debug)]
pub struct DeliveryEngine {
    queue: QueueName,
    backlog: Mutex<Backlog>,
    subscriptions: Arc<SubscriptionSet>,
    notifier: Arc<ThresholdNotifier>,
    processing: AtomicBool,
    pending: AtomicBool,
    scheduled: AtomicBool,
    passes: AtomicU64,
    handoffs: AtomicU64,
    running_passes: AtomicUsize,
    peak_passes: AtomicUsize,
}

impl DeliveryEngine {
    pub fn new(
        queue: QueueName,
        subscriptions: Arc<SubscriptionSet>,
        notifier: Arc<ThresholdNotifier>,
    ) -> Self {
        Self {
            queue,
            backlog: Mutex::new(Backlog::default()),
            subscriptions,
            notifier,
            processing: AtomicBool::new(false),
            pending: AtomicBool::new(false),
            scheduled: AtomicBool::new(false),
            passes: AtomicU64::new(0),
            handoffs: AtomicU64::new(0),
            running_passes: AtomicUsize::new(0),
            peak_passes: AtomicUsize::new(0),
        }
    }

    pub fn message_count(&self) -> usize {
        self.backlog.lock().messages.len()
    }

    /// Aggregate content size of the backlog in bytes.
    pub fn queue_size(&self) -> u64 {
        self.backlog.lock().bytes
    }

    /// Snapshot of the backlog, oldest first.
    pub fn messages(&self) -> Vec<Message> {
        self.backlog.lock().messages.iter().cloned().collect()
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            passes: self.passes.load(Ordering::Relaxed),
            handoffs: self.handoffs.load(Ordering::Relaxed),
            peak_concurrent_passes: self.peak_passes.load(Ordering::Relaxed),
        }
    }

    /// Appends `message` to the backlog and runs a pass inline so an idle
    /// consumer gets it right away. Immediate messages that nobody took are
    /// withdrawn again; the caller must release them.
    ///
    /// Fails only with [`QueueError::QueueDeleted`], in which case nothing
    /// was enqueued. A failure inside the pass concerns other messages and
    /// is logged, not returned.
    pub fn deliver(&self, message: Message) -> Result<PublishOutcome, QueueError> {
        {
            let mut backlog = self.backlog.lock();
            if backlog.closed {
                return Err(QueueError::QueueDeleted(self.queue.clone()));
            }
            backlog.push_back(message.clone());
        }
        metrics::inc_enqueued(1);

        if let Err(e) = self.process_now() {
            error!(target: "blipq::delivery", queue = %self.queue, error = %e, "inline dispatch failed");
        }

        let outcome = if message.is_immediate() {
            if self.backlog.lock().remove(message.id()).is_some() {
                PublishOutcome::NoConsumers
            } else {
                PublishOutcome::Delivered
            }
        } else if message.is_delivered_to_consumer() {
            PublishOutcome::Delivered
        } else {
            PublishOutcome::Queued
        };

        let (count, bytes) = {
            let backlog = self.backlog.lock();
            (backlog.messages.len(), backlog.bytes)
        };
        self.notifier.check(&message, count, bytes);
        Ok(outcome)
    }

    /// Runs dispatch on the caller's thread, or coalesces into the pass
    /// already running. Returns the number of handoffs made by this call.
    pub fn process_now(&self) -> Result<usize, QueueError> {
        self.pending.store(true, Ordering::Release);
        let mut delivered = 0;
        loop {
            if self
                .processing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                trace!(target: "blipq::delivery", queue = %self.queue, "pass already running; coalesced");
                return Ok(delivered);
            }

            let result = self.drain_pending();
            self.processing.store(false, Ordering::Release);
            delivered += result?;

            // A trigger may have landed between our last drain and the release.
            if !self.pending.load(Ordering::Acquire) {
                return Ok(delivered);
            }
        }
    }

    /// Schedules a pass on `pool`. At most one job per queue waits in the
    /// pool at a time; a saturated or stopped pool runs it inline.
    pub fn process_async(self: &Arc<Self>, pool: &DeliveryPool) {
        if self.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let engine = Arc::clone(self);
        let job = Box::new(move || {
            engine.scheduled.store(false, Ordering::Release);
            if let Err(e) = engine.process_now() {
                error!(target: "blipq::delivery", queue = %engine.queue, error = %e, "async dispatch failed");
            }
        });
        if let Err(job) = pool.submit(job) {
            trace!(target: "blipq::delivery", queue = %self.queue, "pool unavailable; dispatching inline");
            job();
        }
    }

    fn drain_pending(&self) -> Result<usize, QueueError> {
        let mut delivered = 0;
        while self.pending.swap(false, Ordering::AcqRel) {
            delivered += self.dispatch()?;
        }
        Ok(delivered)
    }

    /// One dispatch pass. Only ever entered by the holder of `processing`.
    fn dispatch(&self) -> Result<usize, QueueError> {
        let running = self.running_passes.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_passes.fetch_max(running, Ordering::AcqRel);
        self.passes.fetch_add(1, Ordering::Relaxed);

        let result = self.dispatch_backlog();

        self.running_passes.fetch_sub(1, Ordering::AcqRel);
        result
    }

    fn dispatch_backlog(&self) -> Result<usize, QueueError> {
        let mut delivered = 0;
        loop {
            let (subscription, message) = {
                let mut backlog = self.backlog.lock();
                if backlog.messages.is_empty() {
                    break;
                }
                let Some(subscription) = self.subscriptions.next_ready() else {
                    break;
                };
                match backlog.pop_front() {
                    Some(message) => (subscription, message),
                    None => break,
                }
            };

            if self.hand_off(&subscription, message)? {
                delivered += 1;
            }
        }
        if delivered > 0 {
            trace!(target: "blipq::delivery", queue = %self.queue, delivered, "dispatch pass finished");
        }
        Ok(delivered)
    }

    fn hand_off(&self, subscription: &Subscription, message: Message) -> Result<bool, QueueError> {
        message.mark_acquired(subscription.key());
        match subscription.deliver(&self.queue, message.clone()) {
            Ok(_) => {
                self.handoffs.fetch_add(1, Ordering::Relaxed);
                metrics::inc_delivered(1);
                if !subscription.ack_mode().requires_ack() {
                    self.release(&message)?;
                }
                Ok(true)
            }
            Err(message) => {
                debug!(target: "blipq::delivery", queue = %self.queue, consumer = %subscription.key(), "consumer gone; message returned to backlog");
                self.requeue_front(vec![message]);
                Ok(false)
            }
        }
    }

    /// Dequeue path shared by acknowledgement, auto-ack handoff and the
    /// administrative removals. A store failure leaves the message logically
    /// present and is returned; a content cleanup failure is only logged.
    pub fn release(&self, message: &Message) -> Result<(), QueueError> {
        message
            .dequeue(&self.queue)
            .map_err(|source| QueueError::FailedDequeue {
                queue: self.queue.clone(),
                source,
            })?;
        metrics::inc_dequeued(1);

        if let Err(e) = message.decrement_reference() {
            // Already gone from every queue; recovery or an operator must
            // reconcile the store.
            metrics::inc_cleanup_failures(1);
            error!(target: "blipq::delivery", queue = %self.queue, id = %e.id, error = %e, "message cleanup failed");
        }
        Ok(())
    }

    /// Puts previously acquired messages back at the head of the backlog,
    /// keeping their relative order, flagged as redelivered.
    pub fn requeue(&self, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        metrics::inc_redelivered(messages.len() as u64);
        for message in &messages {
            message.set_redelivered();
        }
        self.requeue_front(messages);
    }

    /// Pushes `messages` back to the head in order. A closed backlog takes
    /// nothing, so they are released instead.
    fn requeue_front(&self, messages: Vec<Message>) {
        let mut backlog = self.backlog.lock();
        if !backlog.closed {
            for message in messages.into_iter().rev() {
                message.clear_acquired();
                backlog.push_front(message);
            }
            return;
        }
        drop(backlog);

        for message in messages {
            if let Err(e) = self.release(&message) {
                error!(target: "blipq::delivery", queue = %self.queue, id = %message.id(), error = %e, "failed to release message returned to a deleted queue");
            }
        }
    }

    /// Closes the backlog for good. Returns the number of messages still in
    /// it; [`clear`](Self::clear) releases them.
    pub fn close(&self) -> usize {
        let mut backlog = self.backlog.lock();
        backlog.closed = true;
        backlog.messages.len()
    }

    pub fn is_closed(&self) -> bool {
        self.backlog.lock().closed
    }

    /// Pops and releases the oldest backlog message.
    pub fn remove_from_top(&self) -> Result<Option<MessageId>, QueueError> {
        let Some(message) = self.backlog.lock().pop_front() else {
            return Ok(None);
        };
        if let Err(e) = self.release(&message) {
            self.backlog.lock().push_front(message);
            return Err(e);
        }
        Ok(Some(message.id()))
    }

    /// Drains and releases the whole backlog. On a store failure the
    /// unreleased remainder goes back to the backlog.
    pub fn clear(&self) -> Result<usize, QueueError> {
        let drained: Vec<Message> = {
            let mut backlog = self.backlog.lock();
            backlog.bytes = 0;
            backlog.messages.drain(..).collect()
        };

        let mut released = 0;
        let mut remaining = drained.into_iter();
        while let Some(message) = remaining.next() {
            if let Err(e) = self.release(&message) {
                warn!(target: "blipq::delivery", queue = %self.queue, released, error = %e, "clear interrupted");
                let mut backlog = self.backlog.lock();
                let rest: Vec<Message> = std::iter::once(message).chain(remaining).collect();
                for message in rest.into_iter().rev() {
                    backlog.push_front(message);
                }
                return Err(e);
            }
            released += 1;
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::management::QueueLimits;
    use crate::core::store::MemoryMessageStore;
    use crate::core::subscription::{AckMode, ConsumerEvent, SubscriptionKey};

    fn engine() -> (Arc<DeliveryEngine>, Arc<SubscriptionSet>) {
        let name = QueueName::new("engine-test");
        let subs = Arc::new(SubscriptionSet::new());
        let notifier = Arc::new(ThresholdNotifier::new(
            name.clone(),
            QueueLimits::new(u64::MAX, u64::MAX, u64::MAX),
            8,
        ));
        (
            Arc::new(DeliveryEngine::new(name, Arc::clone(&subs), notifier)),
            subs,
        )
    }

    fn attach(
        subs: &SubscriptionSet,
        tag: &str,
        ack_mode: AckMode,
        prefetch: u32,
    ) -> flume::Receiver<ConsumerEvent> {
        let (tx, rx) = flume::unbounded();
        subs.add(Arc::new(Subscription::new(
            SubscriptionKey::new(1, tag),
            ack_mode,
            prefetch,
            tx,
        )))
        .unwrap();
        rx
    }

    fn enqueued(store: &Arc<MemoryMessageStore>, payload: &'static str) -> Message {
        let msg = store.create_message(payload);
        msg.increment_reference();
        msg
    }

    #[test]
    fn message_waits_without_consumers() {
        let store = Arc::new(MemoryMessageStore::new());
        let (engine, _subs) = engine();
        let outcome = engine.deliver(enqueued(&store, "a")).unwrap();
        assert_eq!(outcome, PublishOutcome::Queued);
        assert_eq!(engine.message_count(), 1);
        assert_eq!(engine.queue_size(), 1);
    }

    #[test]
    fn auto_ack_handoff_releases_immediately() {
        let store = Arc::new(MemoryMessageStore::new());
        let (engine, subs) = engine();
        let rx = attach(&subs, "c1", AckMode::Auto, 0);

        let msg = enqueued(&store, "a");
        assert_eq!(engine.deliver(msg.clone()).unwrap(), PublishOutcome::Delivered);
        assert_eq!(msg.reference_count(), 0);
        assert!(!store.contains(msg.id()));
        assert!(matches!(rx.try_recv(), Ok(ConsumerEvent::Deliver(_))));
    }

    #[test]
    fn backlog_is_spread_round_robin() {
        let store = Arc::new(MemoryMessageStore::new());
        let (engine, subs) = engine();
        for _ in 0..4 {
            engine.deliver(enqueued(&store, "m")).unwrap();
        }
        let rx1 = attach(&subs, "c1", AckMode::Explicit, 0);
        let rx2 = attach(&subs, "c2", AckMode::Explicit, 0);

        assert_eq!(engine.process_now().unwrap(), 4);
        assert_eq!(rx1.try_iter().count(), 2);
        assert_eq!(rx2.try_iter().count(), 2);
        assert_eq!(engine.message_count(), 0);
    }

    #[test]
    fn immediate_message_without_consumer_is_withdrawn() {
        let store = Arc::new(MemoryMessageStore::new());
        let (engine, _subs) = engine();
        let msg = store.create_immediate_message("now");
        msg.increment_reference();
        assert_eq!(engine.deliver(msg).unwrap(), PublishOutcome::NoConsumers);
        assert_eq!(engine.message_count(), 0);
    }

    #[test]
    fn remove_from_top_restores_pre_enqueue_state() {
        let store = Arc::new(MemoryMessageStore::new());
        let (engine, _subs) = engine();
        let msg = store.create_message("new");
        let before = (engine.message_count(), engine.queue_size(), msg.reference_count());

        msg.increment_reference();
        engine.deliver(msg.clone()).unwrap();
        assert_eq!(engine.remove_from_top().unwrap(), Some(msg.id()));

        let after = (engine.message_count(), engine.queue_size(), msg.reference_count());
        assert_eq!(before, after);
        assert_eq!(engine.remove_from_top().unwrap(), None);
    }

    #[test]
    fn remove_from_top_takes_oldest() {
        let store = Arc::new(MemoryMessageStore::new());
        let (engine, _subs) = engine();
        let first = enqueued(&store, "first");
        let second = enqueued(&store, "second");
        engine.deliver(first.clone()).unwrap();
        engine.deliver(second.clone()).unwrap();

        assert_eq!(engine.remove_from_top().unwrap(), Some(first.id()));
        assert_eq!(engine.messages(), vec![second]);
    }

    #[test]
    fn requeued_messages_go_first_and_are_redelivered() {
        let store = Arc::new(MemoryMessageStore::new());
        let (engine, subs) = engine();
        engine.deliver(enqueued(&store, "tail")).unwrap();
        let a = enqueued(&store, "a");
        let b = enqueued(&store, "b");
        engine.requeue(vec![a.clone(), b.clone()]);

        let rx = attach(&subs, "c1", AckMode::Explicit, 0);
        engine.process_now().unwrap();
        let got: Vec<_> = rx
            .try_iter()
            .filter_map(|e| match e {
                ConsumerEvent::Deliver(d) => Some((d.message.id(), d.redelivered)),
                _ => None,
            })
            .collect();
        assert_eq!(got[0], (a.id(), true));
        assert_eq!(got[1], (b.id(), true));
        assert!(!got[2].1);
    }

    #[test]
    fn clear_releases_everything() {
        let store = Arc::new(MemoryMessageStore::new());
        let (engine, _subs) = engine();
        for _ in 0..3 {
            engine.deliver(enqueued(&store, "m")).unwrap();
        }
        assert_eq!(engine.clear().unwrap(), 3);
        assert_eq!(engine.message_count(), 0);
        assert_eq!(engine.queue_size(), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn closed_backlog_takes_nothing() {
        let store = Arc::new(MemoryMessageStore::new());
        let (engine, _subs) = engine();
        engine.deliver(enqueued(&store, "before")).unwrap();
        assert_eq!(engine.close(), 1);
        assert_eq!(engine.clear().unwrap(), 1);

        let late = enqueued(&store, "late");
        assert!(matches!(engine.deliver(late.clone()), Err(QueueError::QueueDeleted(_))));
        assert_eq!(engine.message_count(), 0);

        // Returned deliveries are released rather than stranded.
        engine.requeue(vec![late.clone()]);
        assert_eq!(engine.message_count(), 0);
        assert_eq!(late.reference_count(), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn async_pass_on_inline_pool_runs_on_caller() {
        let store = Arc::new(MemoryMessageStore::new());
        let (engine, subs) = engine();
        engine.deliver(enqueued(&store, "m")).unwrap();
        let rx = attach(&subs, "c1", AckMode::Auto, 0);

        engine.process_async(&DeliveryPool::inline());
        assert_eq!(rx.try_iter().count(), 1);
        assert_eq!(engine.stats().peak_concurrent_passes, 1);
    }
}
