#![allow(dead_code)]

use std::sync::{Arc, Once};

use blipq::config::QueueDefaults;
use blipq::{DeliveryPool, Queue, QueueRegistry};

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        blipq::logging::init_logging();
    });
}

/// Declares a queue that dispatches on the caller's thread.
pub fn inline_queue(registry: &Arc<QueueRegistry>, name: &str, auto_delete: bool) -> Arc<Queue> {
    registry
        .declare(name)
        .auto_delete(auto_delete)
        .limits(QueueDefaults::default())
        .pool(Arc::new(DeliveryPool::inline()))
        .build()
        .expect("declare queue")
}
