//! Admission screening for at-least-once lifecycle deliveries.
//!
//! The authoritative record of what a job has consumed is the admission
//! ledger stored on the job itself, and it is updated in the same
//! compare-and-swap as the transition it guards. Screening here only saves
//! a write round for deliveries that are already known duplicates.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use warden_core::{Admission, LifecycleEvent};

use super::store::{JobStore, JobStoreError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct DedupStats {
    pub admitted: u64,
    pub duplicates: u64,
}

pub struct EventDeduplicator<S> {
    store: S,
    admitted: AtomicU64,
    duplicates: AtomicU64,
}

impl<S: JobStore> EventDeduplicator<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            admitted: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
        }
    }

    /// `Accept` for the first delivery of a logical event, `Duplicate` for
    /// a physical redelivery or a repeat of an already consumed kind.
    pub async fn admit(&self, event: &LifecycleEvent) -> Result<Admission, JobStoreError> {
        let job = self.store.get(event.job_id).await?;
        let admission = job.admissions.check(event);

        match admission {
            Admission::Accept => {
                self.admitted.fetch_add(1, Ordering::Relaxed);
            }
            Admission::Duplicate => {
                self.duplicates.fetch_add(1, Ordering::Relaxed);
                debug!(
                    job_id = %event.job_id,
                    kind = %event.kind,
                    delivery_token = %event.delivery_token,
                    "duplicate delivery dropped"
                );
            }
        }

        Ok(admission)
    }

    pub fn stats(&self) -> DedupStats {
        DedupStats {
            admitted: self.admitted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
        }
    }
}
