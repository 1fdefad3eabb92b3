pub mod bindings;
pub mod delivery;
pub mod error;
pub mod management;
pub mod message;
pub mod queue;
pub mod store;
pub mod subscription;
