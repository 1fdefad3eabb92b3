mod common;

use std::collections::HashMap;
use std::sync::Arc;

use blipq::{AckMode, QueueRegistry, SubscriptionHandle};
use common::{init_logging, inline_queue};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Register(u8),
    Unregister(u8),
    Suspend(u8),
    Resume(u8),
}

fn op() -> impl Strategy<Value = Op> {
    let tag = 0u8..6;
    prop_oneof![
        tag.clone().prop_map(Op::Register),
        tag.clone().prop_map(Op::Unregister),
        tag.clone().prop_map(Op::Suspend),
        tag.prop_map(Op::Resume),
    ]
}

proptest! {
    /// Consumer counts track a simple model: attached consumers, and the
    /// subset of them that is not suspended.
    #[test]
    fn active_weight_matches_model(ops in prop::collection::vec(op(), 1..64)) {
        init_logging();
        let registry = Arc::new(QueueRegistry::new());
        let queue = inline_queue(&registry, "props", false);
        // tag -> suspended
        let mut model: HashMap<u8, bool> = HashMap::new();
        let mut handles: HashMap<u8, SubscriptionHandle> = HashMap::new();

        for op in ops {
            match op {
                Op::Register(t) => {
                    let result = queue.register_subscription(1, format!("t{t}"), AckMode::Auto);
                    prop_assert_eq!(result.is_ok(), !model.contains_key(&t));
                    if let Ok(handle) = result {
                        model.insert(t, false);
                        handles.insert(t, handle);
                    }
                }
                Op::Unregister(t) => {
                    let result = queue.unregister_subscription(1, &format!("t{t}"));
                    prop_assert_eq!(result.is_ok(), model.remove(&t).is_some());
                    handles.remove(&t);
                }
                Op::Suspend(t) | Op::Resume(t) => {
                    let suspend = matches!(op, Op::Suspend(_));
                    let result = if suspend {
                        queue.suspend_subscription(1, &format!("t{t}"))
                    } else {
                        queue.resume_subscription(1, &format!("t{t}"))
                    };
                    match model.get_mut(&t) {
                        Some(state) => {
                            prop_assert!(result.is_ok());
                            *state = suspend;
                        }
                        None => prop_assert!(result.is_err()),
                    }
                }
            }
            let active = model.values().filter(|suspended| !**suspended).count();
            prop_assert_eq!(queue.consumer_count(), model.len());
            prop_assert_eq!(queue.active_consumer_count(), active);
        }
        prop_assert!(!queue.is_deleted());
    }
}
