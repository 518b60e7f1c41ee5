//! `warden-core`: job lifecycle domain.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! the job record, its state machine, lifecycle events and the admission ledger
//! used to suppress redelivered events.

pub mod admission;
pub mod error;
pub mod event;
pub mod id;
pub mod job;
pub mod object;

pub use admission::{Admission, AdmissionLedger, DEFAULT_TOKEN_WINDOW};
pub use error::{DomainError, DomainResult};
pub use event::{ComputeUnitHandle, EventKind, LifecycleEvent};
pub use id::{AlertId, ComputeUnitId, DeliveryToken, JobId};
pub use job::{Decision, Expected, Job, JobState, Transition, TransitionRecord};
pub use object::ObjectRef;
