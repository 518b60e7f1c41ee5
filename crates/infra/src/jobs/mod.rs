//! Job persistence and the state-machine driver.
//!
//! ## Components
//!
//! - `JobStore`: durable job records with compare-and-swap (in-memory or Postgres)
//! - `JobStateMachine`: guarded read/evaluate/swap loop for every transition
//! - `EventDeduplicator`: admission screening against the job's ledger
//! - `RetryPolicy`: bounded backoff for provisioner calls

pub mod dedup;
pub mod postgres;
pub mod retry;
pub mod state_machine;
pub mod store;

pub use dedup::{DedupStats, EventDeduplicator};
pub use postgres::PostgresJobStore;
pub use retry::{BackoffStrategy, RetryPolicy};
pub use state_machine::{EventOutcome, JobStateMachine, Mutation, Step, TransitionOutcome};
pub use store::{
    InMemoryJobStore, JobScan, JobStore, JobStoreError, PutMode, ScanKind, ScanPage,
    scan_awaiting_reclaim, scan_deadline_expired,
};
