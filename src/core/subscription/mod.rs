//! Consumers attached to a queue.
//!
//! Provides the `Subscription` struct, its identity types and the
//! `SubscriptionSet` registry used for round-robin dispatch.

pub mod registry;
#[allow(clippy::module_inception)]
pub mod subscription;

pub use registry::{AddRejected, Removal, SubscriptionSet};
pub use subscription::{
    AckMode, ConsumerEvent, ConsumerTag, Delivery, DeliveryTag, Subscription, SubscriptionHandle,
    SubscriptionKey, SubscriptionOptions,
};
