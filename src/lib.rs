//! blipq – the queue delivery core of an AMQP-style broker.
//!
//! This crate exports
//!  * `core`    – messages, subscriptions, dispatch, bindings and queues
//!  * `config`  – TOML-driven runtime configuration
//!  * `logging` – `tracing` subscriber setup
//!  * `metrics` – process-wide counters
//!
//! Routing, wire protocol and persistence live outside; a broker plugs
//! them in through the [`MessageStore`], [`Exchange`] and
//! [`QueueDirectory`] traits.

// ───────────────────────────────────────────────────────────
// Public modules
// ───────────────────────────────────────────────────────────
pub mod config;
pub mod core;
pub mod logging;
pub mod metrics;

// ───────────────────────────────────────────────────────────
// Re-exports
// ───────────────────────────────────────────────────────────
pub use config::{load_config, Config};
pub use core::bindings::Exchange;
pub use core::delivery::{DeliveryPool, DispatchStats, PublishOutcome};
pub use core::error::{DirectoryError, ExchangeError, QueueError, StoreError};
pub use core::management::{QueueManagement, QueueStats, ThresholdEvent, ThresholdKind};
pub use core::message::{Message, MessageId};
pub use core::queue::{Queue, QueueDirectory, QueueName, QueueRegistry};
pub use core::store::{MemoryMessageStore, MessageStore};
pub use core::subscription::{
    AckMode, ConsumerEvent, Delivery, DeliveryTag, SubscriptionHandle, SubscriptionOptions,
};
