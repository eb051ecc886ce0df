//! Event subscription engine: durable registrations that convert named
//! incoming signals and messages into targeted wakeups, firing at most
//! once each.

pub mod engine;
pub mod memory;
mod model;
pub mod store;

pub use engine::{SubscriptionEngine, TriggerOutcome};
pub use memory::MemorySubscriptionStore;
pub use model::{EventSubscription, EventType, SubscriptionSpec};
pub use store::{PostgresSubscriptionStore, SubscriptionStore};
