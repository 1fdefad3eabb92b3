//! Exchange bindings owned by a queue, kept only so a delete can undo them.

use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::error::ExchangeError;
use crate::core::queue::QueueName;

/// The binding owner. Routing itself lives outside this crate.
pub trait Exchange: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn deregister_queue(&self, routing_key: &str, queue: &QueueName) -> Result<(), ExchangeError>;
}

#[derive(Debug, Clone)]
pub struct Binding {
    pub routing_key: String,
    pub exchange: Arc<dyn Exchange>,
}

#[derive(Debug, Default)]
pub struct BindingTable {
    bindings: Mutex<Vec<Binding>>,
}

impl BindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, routing_key: impl Into<String>, exchange: Arc<dyn Exchange>) {
        self.bindings.lock().push(Binding {
            routing_key: routing_key.into(),
            exchange,
        });
    }

    pub fn len(&self) -> usize {
        self.bindings.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<(String, String)> {
        self.bindings
            .lock()
            .iter()
            .map(|b| (b.routing_key.clone(), b.exchange.name().to_owned()))
            .collect()
    }

    /// Removes every binding from its exchange in one pass. The table is
    /// emptied even if some exchanges fail; the first failure is returned.
    /// Calling it on an empty table does nothing.
    pub fn deregister_all(&self, queue: &QueueName) -> Result<usize, ExchangeError> {
        let bindings = std::mem::take(&mut *self.bindings.lock());
        let mut first_error = None;
        let mut removed = 0;

        for binding in bindings {
            match binding.exchange.deregister_queue(&binding.routing_key, queue) {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!(target: "blipq::bindings", queue = %queue, exchange = binding.exchange.name(), routing_key = %binding.routing_key, error = %e, "failed to remove binding");
                    first_error.get_or_insert(e);
                }
            }
        }

        debug!(target: "blipq::bindings", queue = %queue, removed, "bindings deregistered");
        match first_error {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }
}
