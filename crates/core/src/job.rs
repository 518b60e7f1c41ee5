//! Job record and its lifecycle state machine.
//!
//! ```text
//! Submitted ──▶ Provisioning ──▶ Running ──▶ Completed ──┐
//!     │              │              │                    ├──▶ Reclaimed
//!     └──────────────┴──────────────┴──────▶ Failed ─────┘
//! ```
//!
//! `Reclaimed` means the compute unit is confirmed gone; it is distinct from the
//! outcome (`Completed`/`Failed`) because completion and teardown fail
//! independently. Once an outcome is reached it never changes.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::admission::{Admission, AdmissionLedger};
use crate::error::{DomainError, DomainResult};
use crate::event::{ComputeUnitHandle, EventKind, LifecycleEvent};
use crate::id::JobId;
use crate::object::ObjectRef;

/// Lifecycle state of a job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Submitted,
    Provisioning,
    Running,
    Completed,
    Failed,
    Reclaimed,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Submitted,
        JobState::Provisioning,
        JobState::Running,
        JobState::Completed,
        JobState::Failed,
        JobState::Reclaimed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Submitted => "submitted",
            JobState::Provisioning => "provisioning",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Reclaimed => "reclaimed",
        }
    }

    /// No further work will be started for the job.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Reclaimed
        )
    }

    /// Outcome reached, compute unit not yet confirmed gone.
    pub fn awaits_reclaim(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Check if transition from this state to `to` is an edge of the machine.
    pub fn can_transition_to(self, to: JobState) -> bool {
        use JobState::*;

        matches!(
            (self, to),
            (Submitted, Provisioning)
                | (Submitted, Failed)
                | (Provisioning, Running)
                | (Provisioning, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Completed, Reclaimed)
                | (Failed, Reclaimed)
        )
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| DomainError::validation(format!("unknown job state: {s}")))
    }
}

/// Compare-and-swap expectation for a job record.
///
/// Both the state and the revision must match; the revision catches
/// concurrent writes that did not change the state (e.g. ledger updates).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expected {
    pub state: JobState,
    pub revision: u64,
}

impl Expected {
    pub fn matches(&self, job: &Job) -> bool {
        job.state == self.state && job.revision == self.revision
    }

    pub fn check(&self, job: &Job) -> DomainResult<()> {
        if self.matches(job) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "compare-and-swap failed for job {} (expected: {}@{}, actual: {}@{})",
                job.id, self.state, self.revision, job.state, job.revision
            )))
        }
    }
}

/// A transition the state machine decided to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub to: JobState,
    pub reason: Option<String>,
}

/// What a lifecycle event means for a job in its current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Apply(Transition),
    /// Already consumed (physically or logically).
    Duplicate,
    /// Not applicable in the current state; ignored without side effects.
    Stale(String),
}

/// One applied edge, kept for auditing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: JobState,
    pub to: JobState,
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Durable record of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub input_reference: ObjectRef,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub state: JobState,
    /// The single compute unit serving this job, once provisioning succeeded.
    pub compute_unit: Option<ComputeUnitHandle>,
    pub submitted_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub failure_reason: Option<String>,
    pub output_reference: Option<ObjectRef>,
    /// Incremented by the store on every write.
    pub revision: u64,
    pub reclaim_attempts: u32,
    pub admissions: AdmissionLedger,
    #[serde(default)]
    pub history: Vec<TransitionRecord>,
}

impl Job {
    /// Create a new job in `Submitted`.
    pub fn submit(
        id: JobId,
        input_reference: ObjectRef,
        metadata: BTreeMap<String, String>,
        submitted_at: DateTime<Utc>,
        max_runtime: Duration,
        token_window: usize,
    ) -> DomainResult<Self> {
        input_reference.validate()?;

        if max_runtime <= Duration::zero() {
            return Err(DomainError::validation("max runtime must be positive"));
        }
        if metadata.keys().any(|k| k.trim().is_empty()) {
            return Err(DomainError::validation("metadata keys must not be empty"));
        }
        let deadline = submitted_at
            .checked_add_signed(max_runtime)
            .ok_or_else(|| DomainError::validation("max runtime too large"))?;

        Ok(Self {
            id,
            input_reference,
            metadata,
            state: JobState::Submitted,
            compute_unit: None,
            submitted_at,
            last_transition_at: submitted_at,
            deadline,
            failure_reason: None,
            output_reference: None,
            revision: 0,
            reclaim_attempts: 0,
            admissions: AdmissionLedger::with_window(token_window),
            history: Vec::new(),
        })
    }

    pub fn expected(&self) -> Expected {
        Expected {
            state: self.state,
            revision: self.revision,
        }
    }

    /// Deadline passed while work was still outstanding.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        !self.state.is_terminal() && self.deadline <= now
    }

    /// Apply a state-machine edge.
    pub fn transition(
        &mut self,
        to: JobState,
        at: DateTime<Utc>,
        reason: Option<String>,
    ) -> DomainResult<()> {
        if !self.state.can_transition_to(to) {
            return Err(DomainError::InvalidTransition {
                from: self.state,
                to,
            });
        }

        if to == JobState::Failed {
            self.failure_reason = Some(reason.clone().unwrap_or_else(|| "failed".to_string()));
        }

        self.history.push(TransitionRecord {
            from: self.state,
            to,
            at,
            reason,
        });
        self.state = to;
        self.last_transition_at = at;
        Ok(())
    }

    /// Force a failure (deadline, cancellation, provisioner exhaustion).
    pub fn fail(&mut self, reason: impl Into<String>, at: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobState::Failed, at, Some(reason.into()))
    }

    /// Record the compute unit created for this job.
    ///
    /// A job owns at most one compute unit for its whole life.
    pub fn record_compute_unit(&mut self, handle: ComputeUnitHandle) -> DomainResult<()> {
        if handle.job_id != self.id {
            return Err(DomainError::validation(format!(
                "compute unit {} is tagged for job {}",
                handle.id, handle.job_id
            )));
        }
        if self.state != JobState::Provisioning {
            return Err(DomainError::conflict(format!(
                "job {} is {}, not provisioning",
                self.id, self.state
            )));
        }
        if let Some(existing) = &self.compute_unit {
            return Err(DomainError::conflict(format!(
                "job {} already owns compute unit {}",
                self.id, existing.id
            )));
        }

        self.compute_unit = Some(handle);
        Ok(())
    }

    /// Decide what `event` means for this job without mutating it.
    pub fn decide(&self, event: &LifecycleEvent) -> Decision {
        if event.job_id != self.id {
            return Decision::Stale(format!("event addressed to job {}", event.job_id));
        }
        if self.admissions.check(event) == Admission::Duplicate {
            return Decision::Duplicate;
        }
        if let (Some(source), Some(current)) = (&event.source, &self.compute_unit) {
            if source.id != current.id {
                return Decision::Stale(format!(
                    "signal from compute unit {} but job owns {}",
                    source.id, current.id
                ));
            }
        }

        let has_unit = self.compute_unit.is_some();
        let to = match (event.kind, self.state) {
            (EventKind::ProvisionRequested, JobState::Submitted) => JobState::Provisioning,
            (EventKind::ProvisionAcked, JobState::Provisioning) if has_unit => JobState::Running,
            (EventKind::CompletionSignaled, JobState::Running) => JobState::Completed,
            (EventKind::FailureSignaled, JobState::Provisioning | JobState::Running)
                if has_unit =>
            {
                JobState::Failed
            }
            (kind, state) => {
                return Decision::Stale(format!("{kind} not applicable while {state}"));
            }
        };

        let reason = match event.kind {
            EventKind::FailureSignaled => Some(
                event
                    .detail
                    .clone()
                    .unwrap_or_else(|| "failure signaled".to_string()),
            ),
            _ => None,
        };

        Decision::Apply(Transition { to, reason })
    }

    /// Decide and, if applicable, apply `event` (ledger + transition together).
    pub fn apply_event(
        &mut self,
        event: &LifecycleEvent,
        at: DateTime<Utc>,
    ) -> DomainResult<Decision> {
        let decision = self.decide(event);

        if let Decision::Apply(transition) = &decision {
            self.transition(transition.to, at, transition.reason.clone())?;
            self.admissions.record(event);
            if event.kind == EventKind::CompletionSignaled {
                self.output_reference = event.output_reference.clone();
            }
        }

        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{ComputeUnitId, DeliveryToken};

    fn new_job() -> Job {
        Job::submit(
            JobId::new(),
            ObjectRef::object("uploads/input.txt"),
            BTreeMap::new(),
            Utc::now(),
            Duration::minutes(5),
            8,
        )
        .unwrap()
    }

    fn unit(job: &Job, id: &str) -> ComputeUnitHandle {
        ComputeUnitHandle::new(ComputeUnitId::new(id), job.id)
    }

    fn running_job() -> Job {
        let mut job = new_job();
        let now = Utc::now();
        job.apply_event(&LifecycleEvent::provision_requested(job.id), now)
            .unwrap();
        job.record_compute_unit(unit(&job, "u-1")).unwrap();
        job.apply_event(
            &LifecycleEvent::provision_acked(unit(&job, "u-1"), DeliveryToken::new("ack")),
            now,
        )
        .unwrap();
        assert_eq!(job.state, JobState::Running);
        job
    }

    #[test]
    fn submission_validates_input() {
        let err = Job::submit(
            JobId::new(),
            ObjectRef::object(""),
            BTreeMap::new(),
            Utc::now(),
            Duration::minutes(5),
            8,
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        let err = Job::submit(
            JobId::new(),
            ObjectRef::object("a"),
            BTreeMap::new(),
            Utc::now(),
            Duration::zero(),
            8,
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn deadline_is_submission_plus_runtime() {
        let job = new_job();
        assert_eq!(job.deadline, job.submitted_at + Duration::minutes(5));
        assert!(!job.is_overdue(job.submitted_at));
        assert!(job.is_overdue(job.deadline));
    }

    #[test]
    fn runtime_past_the_calendar_is_a_validation_error() {
        let err = Job::submit(
            JobId::new(),
            ObjectRef::object("a"),
            BTreeMap::new(),
            Utc::now(),
            Duration::seconds(10_000_000_000_000),
            8,
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn invalid_edges_are_rejected() {
        let mut job = new_job();
        let err = job
            .transition(JobState::Completed, Utc::now(), None)
            .unwrap_err();
        assert_eq!(
            err,
            DomainError::InvalidTransition {
                from: JobState::Submitted,
                to: JobState::Completed
            }
        );
        assert_eq!(job.state, JobState::Submitted);
        assert!(job.history.is_empty());
    }

    #[test]
    fn completion_before_running_is_stale_and_not_recorded() {
        let mut job = new_job();
        job.apply_event(&LifecycleEvent::provision_requested(job.id), Utc::now())
            .unwrap();
        job.record_compute_unit(unit(&job, "u-1")).unwrap();

        let completion = LifecycleEvent::completion(unit(&job, "u-1"), DeliveryToken::new("c1"));
        let decision = job.apply_event(&completion, Utc::now()).unwrap();
        assert!(matches!(decision, Decision::Stale(_)));
        assert!(!job.admissions.has_consumed(EventKind::CompletionSignaled));

        job.apply_event(
            &LifecycleEvent::provision_acked(unit(&job, "u-1"), DeliveryToken::new("a1")),
            Utc::now(),
        )
        .unwrap();

        // Redelivery after the ack now applies.
        let decision = job.apply_event(&completion, Utc::now()).unwrap();
        assert!(matches!(decision, Decision::Apply(_)));
        assert_eq!(job.state, JobState::Completed);
    }

    #[test]
    fn duplicate_completion_is_consumed_once() {
        let mut job = running_job();
        let completion = LifecycleEvent::completion(unit(&job, "u-1"), DeliveryToken::new("c1"))
            .with_output(ObjectRef::object("outputs/result.txt"));

        assert!(matches!(
            job.apply_event(&completion, Utc::now()).unwrap(),
            Decision::Apply(_)
        ));
        assert_eq!(job.apply_event(&completion, Utc::now()).unwrap(), Decision::Duplicate);
        assert_eq!(
            job.output_reference,
            Some(ObjectRef::object("outputs/result.txt"))
        );
        assert_eq!(
            job.history
                .iter()
                .filter(|r| r.to == JobState::Completed)
                .count(),
            1
        );
    }

    #[test]
    fn failure_after_completion_is_stale() {
        let mut job = running_job();
        job.apply_event(
            &LifecycleEvent::completion(unit(&job, "u-1"), DeliveryToken::new("c1")),
            Utc::now(),
        )
        .unwrap();

        let decision = job
            .apply_event(
                &LifecycleEvent::failure(unit(&job, "u-1"), DeliveryToken::new("f1"), "boom"),
                Utc::now(),
            )
            .unwrap();
        assert!(matches!(decision, Decision::Stale(_)));
        assert_eq!(job.state, JobState::Completed);
        assert!(job.failure_reason.is_none());
    }

    #[test]
    fn signals_from_foreign_units_are_stale() {
        let mut job = running_job();
        let decision = job
            .apply_event(
                &LifecycleEvent::completion(unit(&job, "u-orphan"), DeliveryToken::new("c1")),
                Utc::now(),
            )
            .unwrap();
        assert!(matches!(decision, Decision::Stale(_)));
        assert_eq!(job.state, JobState::Running);
    }

    #[test]
    fn failure_signal_records_reason() {
        let mut job = running_job();
        job.apply_event(
            &LifecycleEvent::failure(unit(&job, "u-1"), DeliveryToken::new("f1"), "script crashed"),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.failure_reason.as_deref(), Some("script crashed"));
    }

    #[test]
    fn only_one_compute_unit_per_job() {
        let mut job = new_job();
        assert!(job.record_compute_unit(unit(&job, "u-1")).is_err());

        job.apply_event(&LifecycleEvent::provision_requested(job.id), Utc::now())
            .unwrap();
        job.record_compute_unit(unit(&job, "u-1")).unwrap();
        let err = job.record_compute_unit(unit(&job, "u-2")).unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn expected_detects_revision_drift() {
        let mut job = new_job();
        let expected = job.expected();
        assert!(expected.check(&job).is_ok());

        job.revision += 1;
        assert!(matches!(expected.check(&job), Err(DomainError::Conflict(_))));
    }

    #[test]
    fn state_parses_case_insensitively() {
        assert_eq!("Running".parse::<JobState>().unwrap(), JobState::Running);
        assert!("paused".parse::<JobState>().is_err());
    }
}
