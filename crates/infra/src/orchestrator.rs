//! Job orchestrator: submission, lifecycle ingestion, status and cancel.
//!
//! Ingestion is the only path by which lifecycle signals move a job. Each
//! event is screened for duplicates, applied through the state machine and,
//! when it produced an edge, followed by that edge's side effect:
//!
//! | Edge into      | Side effect                         |
//! |----------------|-------------------------------------|
//! | `Provisioning` | create and record the compute unit  |
//! | `Completed`    | reclaim the compute unit            |
//! | `Failed`       | reclaim the compute unit            |
//!
//! Only the caller whose swap won the edge runs the side effect, so a side
//! effect runs once per job no matter how often its trigger is delivered.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use warden_core::{Admission, Job, JobId, JobState, LifecycleEvent, ObjectRef};

use crate::alerts::AlertSink;
use crate::clock::Clock;
use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::jobs::{
    DedupStats, EventDeduplicator, EventOutcome, JobStateMachine, JobStore, PutMode,
    TransitionOutcome,
};
use crate::provisioning::{
    CoordinatorSettings, ProvisionOutcome, Provisioner, ProvisioningCoordinator, ReclaimOutcome,
};
use crate::watchdog::CompletionWatchdog;

/// Upper bound for `list`.
pub const MAX_LIST_LIMIT: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub input_reference: ObjectRef,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Overrides the configured runtime budget for this job.
    #[serde(default)]
    pub max_runtime_secs: Option<u64>,
}

impl SubmitRequest {
    pub fn new(input_reference: ObjectRef) -> Self {
        Self {
            input_reference,
            metadata: BTreeMap::new(),
            max_runtime_secs: None,
        }
    }
}

/// What ingesting one event did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    Applied {
        job_id: JobId,
        from: JobState,
        to: JobState,
    },
    Duplicate {
        job_id: JobId,
    },
    Stale {
        job_id: JobId,
        reason: String,
    },
}

impl IngestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestOutcome::Applied { .. } => "applied",
            IngestOutcome::Duplicate { .. } => "duplicate",
            IngestOutcome::Stale { .. } => "stale",
        }
    }
}

/// Anything that can take lifecycle events off a bus.
#[async_trait]
pub trait LifecycleHandler: Send + Sync + 'static {
    async fn handle(&self, event: LifecycleEvent) -> Result<IngestOutcome, OrchestratorError>;
}

pub struct Orchestrator<S, P> {
    store: S,
    machine: Arc<JobStateMachine<S>>,
    dedup: EventDeduplicator<S>,
    coordinator: Arc<ProvisioningCoordinator<S, P>>,
    config: OrchestratorConfig,
}

impl<S, P> Orchestrator<S, P>
where
    S: JobStore + Clone + 'static,
    P: Provisioner + 'static,
{
    pub fn new(
        store: S,
        provisioner: P,
        alerts: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
        config: OrchestratorConfig,
    ) -> Self {
        let machine = Arc::new(JobStateMachine::new(store.clone(), clock));
        let coordinator = Arc::new(ProvisioningCoordinator::new(
            machine.clone(),
            provisioner,
            alerts,
            CoordinatorSettings::from(&config),
        ));

        Self {
            dedup: EventDeduplicator::new(store.clone()),
            store,
            machine,
            coordinator,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<ProvisioningCoordinator<S, P>> {
        &self.coordinator
    }

    pub fn dedup_stats(&self) -> DedupStats {
        self.dedup.stats()
    }

    /// A watchdog sharing this orchestrator's store, clock and coordinator.
    pub fn watchdog(&self) -> CompletionWatchdog<S, P> {
        CompletionWatchdog::new(
            self.machine.clone(),
            self.coordinator.clone(),
            self.config.scan_page_size,
            self.config.reclaim_grace_chrono(),
        )
    }

    /// Persist a new job in `Submitted` without starting it.
    ///
    /// The caller is expected to deliver `LifecycleEvent::provision_requested`
    /// for the returned id (directly or through a bus).
    #[instrument(skip(self, request))]
    pub async fn register(&self, request: SubmitRequest) -> Result<Job, OrchestratorError> {
        let max_runtime = match request.max_runtime_secs {
            Some(0) => {
                return Err(OrchestratorError::Validation(
                    "max_runtime_secs must be positive".to_string(),
                ));
            }
            Some(secs) => chrono::Duration::from_std(Duration::from_secs(secs))
                .map_err(|e| OrchestratorError::Validation(e.to_string()))?,
            None => self.config.max_runtime_chrono(),
        };

        let job = Job::submit(
            JobId::new(),
            request.input_reference,
            request.metadata,
            self.machine.clock().now(),
            max_runtime,
            self.config.dedup_token_window,
        )?;
        let job = self.store.put(job, PutMode::CreateOnly).await?;

        info!(
            job_id = %job.id,
            input = %job.input_reference,
            deadline = %job.deadline,
            "job submitted"
        );
        Ok(job)
    }

    /// Persist a new job and drive it into provisioning.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Job, OrchestratorError> {
        let job = self.register(request).await?;
        self.ingest(LifecycleEvent::provision_requested(job.id))
            .await?;
        self.get_status(job.id).await
    }

    /// Apply one lifecycle delivery and run the side effect of the edge it
    /// produced, if any.
    #[instrument(
        skip(self, event),
        fields(job_id = %event.job_id, kind = %event.kind, delivery_token = %event.delivery_token)
    )]
    pub async fn ingest(&self, event: LifecycleEvent) -> Result<IngestOutcome, OrchestratorError> {
        event.validate()?;

        let job_id = event.job_id;
        if self.dedup.admit(&event).await? == Admission::Duplicate {
            return Ok(IngestOutcome::Duplicate { job_id });
        }

        match self.machine.apply_event(&event).await? {
            EventOutcome::Applied {
                job,
                from,
                transition,
            } => {
                info!(
                    job_id = %job_id,
                    from = %from,
                    to = %transition.to,
                    reason = ?transition.reason,
                    "job transitioned"
                );
                self.after_transition(&job).await;
                Ok(IngestOutcome::Applied {
                    job_id,
                    from,
                    to: transition.to,
                })
            }
            EventOutcome::Duplicate { .. } => {
                debug!(job_id = %job_id, "duplicate delivery lost the race; dropped");
                Ok(IngestOutcome::Duplicate { job_id })
            }
            EventOutcome::Stale { job, reason } => {
                info!(job_id = %job_id, state = %job.state, %reason, "stale event ignored");
                Ok(IngestOutcome::Stale { job_id, reason })
            }
        }
    }

    pub async fn get_status(&self, id: JobId) -> Result<Job, OrchestratorError> {
        Ok(self.store.get(id).await?)
    }

    /// Stop a job that has not finished. Cancelling a finished job is a no-op.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: JobId, reason: Option<String>) -> Result<Job, OrchestratorError> {
        let reason = reason.unwrap_or_else(|| "cancelled".to_string());

        match self
            .machine
            .transition(
                id,
                &[JobState::Submitted, JobState::Provisioning, JobState::Running],
                JobState::Failed,
                Some(reason),
            )
            .await?
        {
            TransitionOutcome::Applied(job) => {
                info!(job_id = %id, "job cancelled");
                self.after_transition(&job).await;
                self.get_status(id).await
            }
            TransitionOutcome::Skipped(job) => {
                debug!(job_id = %id, state = %job.state, "cancel ignored for finished job");
                Ok(job)
            }
        }
    }

    pub async fn list(
        &self,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<Job>, OrchestratorError> {
        Ok(self.store.list(state, limit.clamp(1, MAX_LIST_LIMIT)).await?)
    }

    /// Retry reclaim for a Completed/Failed job (operator action).
    pub async fn reclaim(&self, id: JobId) -> Result<ReclaimOutcome, OrchestratorError> {
        self.coordinator.reclaim(id).await
    }

    async fn after_transition(&self, job: &Job) {
        match job.state {
            JobState::Provisioning => match self.coordinator.provision(job).await {
                Ok(ProvisionOutcome::Failed { error, .. }) => {
                    warn!(job_id = %job.id, error = %error, "provisioning failed");
                }
                Ok(_) => {}
                Err(err) => {
                    // The deadline sweep fails the job if nothing else moves it.
                    warn!(job_id = %job.id, error = %err, "provisioning interrupted");
                }
            },
            JobState::Completed | JobState::Failed => {
                if let Err(err) = self.coordinator.reclaim(job.id).await {
                    warn!(job_id = %job.id, error = %err, "reclaim did not finish; watchdog will retry");
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl<S, P> LifecycleHandler for Orchestrator<S, P>
where
    S: JobStore + Clone + 'static,
    P: Provisioner + 'static,
{
    async fn handle(&self, event: LifecycleEvent) -> Result<IngestOutcome, OrchestratorError> {
        self.ingest(event).await
    }
}
