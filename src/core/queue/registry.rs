use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::debug;

use crate::core::error::DirectoryError;
use crate::core::queue::{Queue, QueueBuilder, QueueName};

/// Name-based lookup of live queues.
pub trait QueueDirectory: Send + Sync + Debug {
    fn register_queue(&self, queue: Arc<Queue>) -> Result<(), DirectoryError>;

    fn unregister_queue(&self, name: &QueueName) -> Result<Arc<Queue>, DirectoryError>;
}

/// [`QueueRegistry`] is a thread-safe directory of queues.
///
/// Uses DashMap internally so lookups from many sessions do not contend.
#[derive(Debug, Default)]
pub struct QueueRegistry {
    queues: DashMap<QueueName, Arc<Queue>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
        }
    }

    /// Starts declaring a queue that will register itself here.
    pub fn declare(self: &Arc<Self>, name: impl Into<QueueName>) -> QueueBuilder {
        Queue::builder(name, Arc::clone(self) as Arc<dyn QueueDirectory>)
    }

    pub fn get_queue(&self, name: &QueueName) -> Option<Arc<Queue>> {
        self.queues.get(name).map(|entry| Arc::clone(&*entry))
    }

    pub fn list_queues(&self) -> Vec<QueueName> {
        self.queues.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

impl QueueDirectory for QueueRegistry {
    fn register_queue(&self, queue: Arc<Queue>) -> Result<(), DirectoryError> {
        match self.queues.entry(queue.name().clone()) {
            Entry::Occupied(entry) => Err(DirectoryError::AlreadyRegistered(entry.key().clone())),
            Entry::Vacant(entry) => {
                debug!(target: "blipq::registry", queue = %queue.name(), "queue registered");
                entry.insert(queue);
                Ok(())
            }
        }
    }

    fn unregister_queue(&self, name: &QueueName) -> Result<Arc<Queue>, DirectoryError> {
        self.queues
            .remove(name)
            .map(|(_, queue)| queue)
            .ok_or_else(|| DirectoryError::NotRegistered(name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declare_registers_under_name() {
        let registry = Arc::new(QueueRegistry::new());
        let queue = registry.declare("orders").build().unwrap();
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.get_queue(queue.name()).unwrap(), &queue));
        assert_eq!(registry.list_queues(), vec![QueueName::new("orders")]);
    }

    #[test]
    fn names_are_unique() {
        let registry = Arc::new(QueueRegistry::new());
        let _first = registry.declare("dup").build().unwrap();
        let err = registry.declare("dup").build().unwrap_err();
        assert!(err.to_string().contains("already registered"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unregister_unknown_fails() {
        let registry = QueueRegistry::new();
        assert_eq!(
            registry.unregister_queue(&QueueName::new("ghost")).unwrap_err(),
            DirectoryError::NotRegistered(QueueName::new("ghost"))
        );
    }
}
