//! Background workers.

pub mod lifecycle_worker;

pub use lifecycle_worker::{LifecycleWorker, WorkerHandle};
