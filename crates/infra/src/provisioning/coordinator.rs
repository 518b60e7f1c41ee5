//! Creates and destroys the compute unit behind each job.
//!
//! - Creation retries transient provisioner failures with bounded backoff,
//!   then fails the job.
//! - A unit whose job moved on before it could be recorded is terminated
//!   straight away, so no unit outlives its job unrecorded.
//! - Reclaim terminates the recorded unit (tolerating "already gone") and
//!   only then moves the job to `Reclaimed`. Exhausted termination retries
//!   raise an operator alert and leave the job for the watchdog.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, instrument, warn};

use warden_core::{ComputeUnitHandle, Job, JobId, JobState};

use crate::alerts::{AlertSink, OperatorAlert};
use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::jobs::{JobStateMachine, JobStore, RetryPolicy, TransitionOutcome};

use super::provisioner::{Provisioner, ProvisionerError, UnitTags};

#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorSettings {
    pub provision_retry: RetryPolicy,
    pub terminate_retry: RetryPolicy,
    /// When false, a recorded unit moves the job to `Running` immediately.
    pub await_provision_ack: bool,
    pub unit_tags: BTreeMap<String, String>,
}

impl From<&OrchestratorConfig> for CoordinatorSettings {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            provision_retry: config.provision_retry.clone(),
            terminate_retry: config.terminate_retry.clone(),
            await_provision_ack: config.await_provision_ack,
            unit_tags: config.unit_tags.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// The unit is recorded on the job.
    Provisioned(Job),
    /// The job left `Provisioning` before the unit could be recorded; the
    /// unit was terminated.
    Orphaned { job: Job, unit: ComputeUnitHandle },
    /// The job is not waiting for a unit.
    NotNeeded(Job),
    /// Creation gave up and the job was failed.
    Failed { job: Job, error: OrchestratorError },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReclaimOutcome {
    Reclaimed(Job),
    AlreadyReclaimed(Job),
    /// Another reclaim of the same job is running in this process.
    InProgress(JobId),
}

pub struct ProvisioningCoordinator<S, P> {
    machine: Arc<JobStateMachine<S>>,
    provisioner: P,
    alerts: Arc<dyn AlertSink>,
    settings: CoordinatorSettings,
    reclaiming: Mutex<HashSet<JobId>>,
}

/// Removes a job from the in-flight reclaim set on drop.
struct ReclaimSlot<'a> {
    set: &'a Mutex<HashSet<JobId>>,
    job_id: JobId,
}

impl Drop for ReclaimSlot<'_> {
    fn drop(&mut self) {
        match self.set.lock() {
            Ok(mut set) => {
                set.remove(&self.job_id);
            }
            Err(poisoned) => {
                poisoned.into_inner().remove(&self.job_id);
            }
        }
    }
}

impl<S, P> ProvisioningCoordinator<S, P>
where
    S: JobStore,
    P: Provisioner,
{
    pub fn new(
        machine: Arc<JobStateMachine<S>>,
        provisioner: P,
        alerts: Arc<dyn AlertSink>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            machine,
            provisioner,
            alerts,
            settings,
            reclaiming: Mutex::new(HashSet::new()),
        }
    }

    pub fn provisioner(&self) -> &P {
        &self.provisioner
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    /// Create the job's compute unit and record it.
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    pub async fn provision(&self, job: &Job) -> Result<ProvisionOutcome, OrchestratorError> {
        if job.state != JobState::Provisioning || job.compute_unit.is_some() {
            return Ok(ProvisionOutcome::NotNeeded(job.clone()));
        }

        let tags = UnitTags::for_job(job.id, &job.input_reference, &self.settings.unit_tags);
        let policy = &self.settings.provision_retry;
        let mut attempt = 0;

        let handle = loop {
            attempt += 1;
            let err = match self.provisioner.create(&tags).await {
                Ok(handle) => break handle,
                Err(err) => err,
            };

            let retry = err.is_transient() && policy.should_retry(attempt);
            warn!(job_id = %job.id, attempt, error = %err, retry, "compute unit creation failed");

            if !retry {
                let error = OrchestratorError::ProvisionerUnavailable {
                    job_id: job.id,
                    attempts: attempt,
                    message: err.to_string(),
                };
                return self.give_up(job.id, error).await;
            }

            policy.backoff(attempt).await;

            // Stop retrying for a job that has moved on or run out of time.
            let current = self.machine.store().get(job.id).await?;
            if current.state != JobState::Provisioning {
                return Ok(ProvisionOutcome::NotNeeded(current));
            }
            if current.is_overdue(self.machine.clock().now()) {
                return self
                    .give_up(job.id, OrchestratorError::DeadlineExceeded(job.id))
                    .await;
            }
        };

        let recorded = match self
            .machine
            .record_compute_unit(handle.clone(), !self.settings.await_provision_ack)
            .await
        {
            Ok(recorded) => recorded,
            Err(err) => {
                warn!(compute_unit = %handle.id, error = %err, "could not record compute unit; terminating it");
                self.terminate_orphan(&handle).await;
                return Err(err.into());
            }
        };

        match recorded {
            TransitionOutcome::Applied(job) => {
                info!(
                    job_id = %job.id,
                    compute_unit = %handle.id,
                    state = %job.state,
                    attempts = attempt,
                    "compute unit recorded"
                );
                Ok(ProvisionOutcome::Provisioned(job))
            }
            TransitionOutcome::Skipped(current) => {
                warn!(
                    job_id = %current.id,
                    compute_unit = %handle.id,
                    state = %current.state,
                    "job moved on during creation; terminating orphaned unit"
                );
                self.terminate_orphan(&handle).await;
                Ok(ProvisionOutcome::Orphaned {
                    job: current,
                    unit: handle,
                })
            }
        }
    }

    /// Terminate the job's unit (if any) and move it to `Reclaimed`.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn reclaim(&self, job_id: JobId) -> Result<ReclaimOutcome, OrchestratorError> {
        let Some(_slot) = self.claim_reclaim(job_id) else {
            debug!(job_id = %job_id, "reclaim already in progress");
            return Ok(ReclaimOutcome::InProgress(job_id));
        };

        let job = self.machine.store().get(job_id).await?;
        if job.state == JobState::Reclaimed {
            return Ok(ReclaimOutcome::AlreadyReclaimed(job));
        }
        if !job.state.awaits_reclaim() {
            return Err(OrchestratorError::Conflict(format!(
                "job {job_id} is {}; nothing to reclaim yet",
                job.state
            )));
        }

        if let Some(unit) = &job.compute_unit {
            if let Err((attempts, err)) = self.terminate_with_retry(unit).await {
                let job = self.machine.note_reclaim_attempt(job_id).await?;
                self.alerts.raise(OperatorAlert::new(
                    job_id,
                    Some(unit.id.clone()),
                    self.machine.clock().now(),
                    attempts,
                    format!(
                        "compute unit {} could not be terminated after {attempts} attempts ({} reclaim rounds): {err}",
                        unit.id, job.reclaim_attempts
                    ),
                ));
                return Err(OrchestratorError::TerminationFailed {
                    job_id,
                    unit: unit.id.clone(),
                    attempts,
                    message: err.to_string(),
                });
            }
        }

        match self
            .machine
            .transition(
                job_id,
                &[JobState::Completed, JobState::Failed],
                JobState::Reclaimed,
                None,
            )
            .await?
        {
            TransitionOutcome::Applied(job) => {
                info!(
                    job_id = %job.id,
                    compute_unit = ?job.compute_unit.as_ref().map(|u| u.id.as_str()),
                    "job reclaimed"
                );
                Ok(ReclaimOutcome::Reclaimed(job))
            }
            TransitionOutcome::Skipped(job) if job.state == JobState::Reclaimed => {
                Ok(ReclaimOutcome::AlreadyReclaimed(job))
            }
            TransitionOutcome::Skipped(job) => Err(OrchestratorError::Conflict(format!(
                "job {} is {}; cannot reclaim",
                job.id, job.state
            ))),
        }
    }

    /// Terminate with bounded retries. `AlreadyTerminated` counts as success;
    /// `Rejected` is returned without retrying.
    ///
    /// Returns the number of calls made, or the last error once retries are
    /// exhausted.
    pub async fn terminate_with_retry(
        &self,
        unit: &ComputeUnitHandle,
    ) -> Result<u32, (u32, ProvisionerError)> {
        let policy = &self.settings.terminate_retry;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.provisioner.terminate(unit).await {
                Ok(()) => return Ok(attempt),
                Err(ProvisionerError::AlreadyTerminated(_)) => {
                    debug!(compute_unit = %unit.id, "compute unit already terminated");
                    return Ok(attempt);
                }
                Err(err) if err.is_transient() && policy.should_retry(attempt) => {
                    warn!(compute_unit = %unit.id, attempt, error = %err, "terminate failed; retrying");
                    policy.backoff(attempt).await;
                }
                Err(err) => return Err((attempt, err)),
            }
        }
    }

    async fn give_up(
        &self,
        job_id: JobId,
        error: OrchestratorError,
    ) -> Result<ProvisionOutcome, OrchestratorError> {
        let outcome = self
            .machine
            .transition(
                job_id,
                &[JobState::Provisioning],
                JobState::Failed,
                Some(error.to_string()),
            )
            .await?;

        let job = match outcome {
            TransitionOutcome::Applied(job) => job,
            TransitionOutcome::Skipped(job) => return Ok(ProvisionOutcome::NotNeeded(job)),
        };
        warn!(job_id = %job_id, error = %error, "provisioning abandoned; job failed");

        let job = match self.reclaim(job_id).await? {
            ReclaimOutcome::Reclaimed(job) | ReclaimOutcome::AlreadyReclaimed(job) => job,
            ReclaimOutcome::InProgress(_) => job,
        };
        Ok(ProvisionOutcome::Failed { job, error })
    }

    async fn terminate_orphan(&self, unit: &ComputeUnitHandle) {
        if let Err((attempts, err)) = self.terminate_with_retry(unit).await {
            self.alerts.raise(OperatorAlert::new(
                unit.job_id,
                Some(unit.id.clone()),
                self.machine.clock().now(),
                attempts,
                format!("orphaned compute unit {} could not be terminated: {err}", unit.id),
            ));
        }
    }

    fn claim_reclaim(&self, job_id: JobId) -> Option<ReclaimSlot<'_>> {
        let mut set = match self.reclaiming.lock() {
            Ok(set) => set,
            Err(poisoned) => poisoned.into_inner(),
        };
        if set.insert(job_id) {
            Some(ReclaimSlot {
                set: &self.reclaiming,
                job_id,
            })
        } else {
            None
        }
    }
}
