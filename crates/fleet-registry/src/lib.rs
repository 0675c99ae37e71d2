//! Bounded pool of supervised agent instances.
//!
//! The registry is the single authority on which instances exist, what each
//! one is doing, and what events it has emitted. History is bounded per
//! instance; reconnecting clients replay from it and can detect pruned gaps
//! via the total-appended count.

pub mod error;
pub mod history;
pub mod instance;
pub mod registry;

pub use error::RegistryError;
pub use history::EventHistory;
pub use instance::{CurrentTask, InstanceRecord, NewInstance, SessionControl, SessionHandle};
pub use registry::{
    InstanceRegistry, RegistryConfig, RegistryEvent, DEFAULT_HISTORY_CAPACITY,
};
