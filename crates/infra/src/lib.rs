//! Infrastructure layer: job store, provisioning, watchdog, buses, config.

pub mod alerts;
pub mod clock;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod jobs;
pub mod object_store;
pub mod orchestrator;
pub mod provisioning;
pub mod watchdog;
pub mod workers;

pub use alerts::{AlertSink, InMemoryAlertSink, OperatorAlert};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, OrchestratorConfig};
pub use error::OrchestratorError;
pub use object_store::{InMemoryObjectStore, ObjectStore, ObjectStoreError, StoredObject};
pub use orchestrator::{IngestOutcome, LifecycleHandler, Orchestrator, SubmitRequest};
pub use watchdog::{CompletionWatchdog, SweepReport, WatchdogHandle, WatchdogStats};

#[cfg(test)]
mod integration_tests;
