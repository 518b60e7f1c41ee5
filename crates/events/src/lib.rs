//! Lifecycle event delivery mechanics.
//!
//! Delivery is **at-least-once** with **no ordering guarantees**: the same
//! message may arrive several times, possibly after messages published later.
//! Consumers dedupe against the durable admission ledger kept with each job.

pub mod bus;
pub mod delivery;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription, SubscriptionClosed};
pub use delivery::{Delivery, JobScoped};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
