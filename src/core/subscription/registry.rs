use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::core::queue::QueueName;
use crate::core::subscription::{Subscription, SubscriptionKey};

/// Why a subscription could not be added.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddRejected {
    Duplicate,
    /// The set was closed by a delete; the queue is gone.
    Closed,
}

/// Result of removing a subscription.
#[derive(Debug)]
pub struct Removal {
    pub subscription: Arc<Subscription>,
    /// The removal emptied the set and closed it in the same critical
    /// section. Exactly one remover can ever observe this.
    pub closed: bool,
}

/// [`SubscriptionSet`] holds the consumers of one queue in attachment order.
///
/// Membership changes, the suspended flag of each member and the weight are
/// all updated under a single lock, so `weight()` always equals the number of
/// attached, non-suspended subscriptions.
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    inner: Mutex<Inner>,
    weight: AtomicUsize,
}

#[derive(Debug, Default)]
struct Inner {
    subscriptions: Vec<Arc<Subscription>>,
    cursor: usize,
    closed: bool,
}

impl Inner {
    fn position(&self, key: &SubscriptionKey) -> Option<usize> {
        self.subscriptions.iter().position(|s| s.key() == key)
    }
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, subscription: Arc<Subscription>) -> Result<(), AddRejected> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(AddRejected::Closed);
        }
        if inner.position(subscription.key()).is_some() {
            return Err(AddRejected::Duplicate);
        }
        if !subscription.is_suspended() {
            self.weight.fetch_add(1, Ordering::AcqRel);
        }
        inner.subscriptions.push(subscription);
        Ok(())
    }

    /// Removes the subscription identified by `key`. With `close_when_empty`
    /// the set is closed if this removal leaves it empty.
    pub fn remove(&self, key: &SubscriptionKey, close_when_empty: bool) -> Option<Removal> {
        let mut inner = self.inner.lock();
        let idx = inner.position(key)?;
        let subscription = inner.subscriptions.remove(idx);
        if !subscription.is_suspended() {
            self.weight.fetch_sub(1, Ordering::AcqRel);
        }

        if idx < inner.cursor {
            inner.cursor -= 1;
        }
        if inner.cursor >= inner.subscriptions.len() {
            inner.cursor = 0;
        }

        let closed = close_when_empty && inner.subscriptions.is_empty() && !inner.closed;
        if closed {
            inner.closed = true;
        }
        Some(Removal {
            subscription,
            closed,
        })
    }

    pub fn get(&self, key: &SubscriptionKey) -> Option<Arc<Subscription>> {
        let inner = self.inner.lock();
        inner
            .position(key)
            .map(|idx| Arc::clone(&inner.subscriptions[idx]))
    }

    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.inner.lock().position(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of attached subscriptions that are not suspended.
    pub fn weight(&self) -> usize {
        self.weight.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Suspends or resumes a subscription. Returns `None` if it is not
    /// attached, otherwise whether the state changed.
    pub fn set_suspended(&self, key: &SubscriptionKey, suspended: bool) -> Option<bool> {
        let inner = self.inner.lock();
        let idx = inner.position(key)?;
        let changed = inner.subscriptions[idx].set_suspended(suspended);
        if changed {
            if suspended {
                self.weight.fetch_sub(1, Ordering::AcqRel);
            } else {
                self.weight.fetch_add(1, Ordering::AcqRel);
            }
        }
        Some(changed)
    }

    /// Next subscription willing to take a message, round-robin in
    /// attachment order. Suspended or saturated subscriptions are skipped
    /// but stay attached.
    pub fn next_ready(&self) -> Option<Arc<Subscription>> {
        let mut inner = self.inner.lock();
        let len = inner.subscriptions.len();
        for offset in 0..len {
            let idx = (inner.cursor + offset) % len;
            if inner.subscriptions[idx].is_ready() {
                inner.cursor = (idx + 1) % len;
                return Some(Arc::clone(&inner.subscriptions[idx]));
            }
        }
        None
    }

    /// Closes the set only if nobody is attached. Returns whether it is
    /// closed afterwards.
    pub fn close_if_empty(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.subscriptions.is_empty() {
            inner.closed = true;
        }
        inner.closed
    }

    /// Closes the set and detaches everything.
    pub fn close(&self) -> Vec<Arc<Subscription>> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.cursor = 0;
        self.weight.store(0, Ordering::Release);
        std::mem::take(&mut inner.subscriptions)
    }

    pub fn snapshot(&self) -> Vec<Arc<Subscription>> {
        self.inner.lock().subscriptions.clone()
    }

    /// Closes the set and tells every detached subscription that `queue`
    /// is gone. Each subscription hears about it at most once.
    pub fn close_with_notice(&self, queue: &QueueName) -> Vec<Arc<Subscription>> {
        let detached = self.close();
        let notified = detached.iter().filter(|s| s.queue_deleted(queue)).count();
        debug!(target: "blipq::subscription", queue = %queue, notified, "queue-deleted broadcast");
        detached
    }
}
