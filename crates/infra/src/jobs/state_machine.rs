//! Drives job transitions through the store's compare-and-swap.
//!
//! Every write re-reads the record, re-evaluates its guard against what was
//! read, and swaps conditioned on that read. A lost race re-reads and
//! re-evaluates; it never blindly retries the same write.

use std::sync::Arc;

use tracing::{debug, warn};

use warden_core::{ComputeUnitHandle, Decision, Job, JobId, JobState, LifecycleEvent, Transition};

use crate::clock::Clock;

use super::store::{JobStore, JobStoreError};

/// Upper bound on re-read/re-evaluate rounds for one write.
pub const DEFAULT_MAX_CAS_ROUNDS: u32 = 16;

/// Result of a guarded mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation<T> {
    /// The guard held and the new record was swapped in.
    Committed { job: Job, value: T },
    /// The guard rejected the record as read; nothing was written.
    Abandoned { job: Job, value: T },
}

/// What a guard wants done with the record it was given.
pub enum Step<T> {
    Commit(T),
    Abandon(T),
}

/// Outcome of feeding one lifecycle event through the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Applied {
        job: Job,
        from: JobState,
        transition: Transition,
    },
    Duplicate {
        job: Job,
    },
    Stale {
        job: Job,
        reason: String,
    },
}

/// Outcome of an orchestrator-initiated edge (deadline, cancel, reclaim).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied(Job),
    /// The job had already left the allowed source states.
    Skipped(Job),
}

pub struct JobStateMachine<S> {
    store: S,
    clock: Arc<dyn Clock>,
    max_rounds: u32,
}

impl<S: JobStore> JobStateMachine<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            max_rounds: DEFAULT_MAX_CAS_ROUNDS,
        }
    }

    pub fn with_max_rounds(mut self, rounds: u32) -> Self {
        self.max_rounds = rounds.max(1);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Read, let `guard` edit a copy, and swap it in conditioned on the read.
    pub async fn mutate<T, F>(&self, id: JobId, mut guard: F) -> Result<Mutation<T>, JobStoreError>
    where
        F: FnMut(&mut Job) -> Step<T> + Send,
        T: Send,
    {
        for round in 1..=self.max_rounds {
            let current = self.store.get(id).await?;
            let mut next = current.clone();

            let value = match guard(&mut next) {
                Step::Commit(value) => value,
                Step::Abandon(value) => {
                    return Ok(Mutation::Abandoned {
                        job: current,
                        value,
                    });
                }
            };

            match self
                .store
                .compare_and_swap(id, current.expected(), next)
                .await
            {
                Ok(job) => return Ok(Mutation::Committed { job, value }),
                Err(JobStoreError::Conflict { reason, .. }) => {
                    debug!(job_id = %id, round, %reason, "lost compare-and-swap; re-evaluating");
                }
                Err(e) => return Err(e),
            }
        }

        warn!(job_id = %id, rounds = self.max_rounds, "gave up after repeated compare-and-swap conflicts");
        Err(JobStoreError::Conflict {
            id,
            reason: format!("still contended after {} rounds", self.max_rounds),
        })
    }

    /// Apply a lifecycle event: the admission ledger and the transition are
    /// committed in the same swap.
    pub async fn apply_event(&self, event: &LifecycleEvent) -> Result<EventOutcome, JobStoreError> {
        let now = self.clock.now();

        let mutation = self
            .mutate(event.job_id, |job| {
                let from = job.state;
                match job.apply_event(event, now) {
                    Ok(Decision::Apply(transition)) => Step::Commit((from, Decision::Apply(transition))),
                    Ok(other) => Step::Abandon((from, other)),
                    Err(e) => Step::Abandon((from, Decision::Stale(e.to_string()))),
                }
            })
            .await?;

        Ok(match mutation {
            Mutation::Committed {
                job,
                value: (from, Decision::Apply(transition)),
            } => EventOutcome::Applied {
                job,
                from,
                transition,
            },
            Mutation::Committed { job, .. } => EventOutcome::Stale {
                job,
                reason: "committed without a transition".to_string(),
            },
            Mutation::Abandoned {
                job,
                value: (_, Decision::Duplicate),
            } => EventOutcome::Duplicate { job },
            Mutation::Abandoned {
                job,
                value: (_, Decision::Stale(reason)),
            } => EventOutcome::Stale { job, reason },
            Mutation::Abandoned {
                job,
                value: (_, Decision::Apply(_)),
            } => EventOutcome::Stale {
                job,
                reason: "transition abandoned".to_string(),
            },
        })
    }

    /// Move the job to `to` if it is currently in one of `from`.
    pub async fn transition(
        &self,
        id: JobId,
        from: &[JobState],
        to: JobState,
        reason: Option<String>,
    ) -> Result<TransitionOutcome, JobStoreError> {
        let now = self.clock.now();

        let mutation = self
            .mutate(id, |job| {
                if !from.contains(&job.state) {
                    return Step::Abandon(());
                }
                match job.transition(to, now, reason.clone()) {
                    Ok(()) => Step::Commit(()),
                    Err(_) => Step::Abandon(()),
                }
            })
            .await?;

        Ok(match mutation {
            Mutation::Committed { job, .. } => TransitionOutcome::Applied(job),
            Mutation::Abandoned { job, .. } => TransitionOutcome::Skipped(job),
        })
    }

    /// Attach a freshly created compute unit to a job still in
    /// `Provisioning`, optionally advancing it to `Running` in the same swap.
    ///
    /// `Skipped` means the unit was not recorded and is an orphan.
    pub async fn record_compute_unit(
        &self,
        handle: ComputeUnitHandle,
        advance_to_running: bool,
    ) -> Result<TransitionOutcome, JobStoreError> {
        let now = self.clock.now();

        let mutation = self
            .mutate(handle.job_id, |job| {
                if job.record_compute_unit(handle.clone()).is_err() {
                    return Step::Abandon(());
                }
                if advance_to_running
                    && job
                        .transition(
                            JobState::Running,
                            now,
                            Some("compute unit created".to_string()),
                        )
                        .is_err()
                {
                    return Step::Abandon(());
                }
                Step::Commit(())
            })
            .await?;

        Ok(match mutation {
            Mutation::Committed { job, .. } => TransitionOutcome::Applied(job),
            Mutation::Abandoned { job, .. } => TransitionOutcome::Skipped(job),
        })
    }

    /// Count a failed reclaim round on a job still awaiting reclaim.
    pub async fn note_reclaim_attempt(&self, id: JobId) -> Result<Job, JobStoreError> {
        let mutation = self
            .mutate(id, |job| {
                if job.state.awaits_reclaim() {
                    job.reclaim_attempts += 1;
                    Step::Commit(())
                } else {
                    Step::Abandon(())
                }
            })
            .await?;

        Ok(match mutation {
            Mutation::Committed { job, .. } | Mutation::Abandoned { job, .. } => job,
        })
    }
}
