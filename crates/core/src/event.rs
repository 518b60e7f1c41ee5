//! Lifecycle events reported by the orchestrator and by compute units.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{ComputeUnitId, DeliveryToken, JobId};
use crate::object::ObjectRef;

/// Kind of lifecycle signal.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// The orchestrator's intent to provision compute for a job.
    ProvisionRequested,
    /// The compute unit confirmed startup.
    ProvisionAcked,
    /// The compute unit finished its work.
    CompletionSignaled,
    /// The compute unit gave up.
    FailureSignaled,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::ProvisionRequested => "provision_requested",
            EventKind::ProvisionAcked => "provision_acked",
            EventKind::CompletionSignaled => "completion_signaled",
            EventKind::FailureSignaled => "failure_signaled",
        }
    }
}

impl core::fmt::Display for EventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A compute unit, tagged with the one job it serves.
///
/// The tag is what lets an asynchronous signal from the unit be correlated
/// back to its job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComputeUnitHandle {
    pub id: ComputeUnitId,
    pub job_id: JobId,
}

impl ComputeUnitHandle {
    pub fn new(id: ComputeUnitId, job_id: JobId) -> Self {
        Self { id, job_id }
    }
}

/// A lifecycle signal for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub job_id: JobId,
    pub kind: EventKind,
    /// Unit that emitted the signal (absent for orchestrator intents).
    #[serde(default)]
    pub source: Option<ComputeUnitHandle>,
    pub delivery_token: DeliveryToken,
    /// Failure reason carried by `FailureSignaled`.
    #[serde(default)]
    pub detail: Option<String>,
    /// Output location carried by `CompletionSignaled`.
    #[serde(default)]
    pub output_reference: Option<ObjectRef>,
}

impl LifecycleEvent {
    /// The provision intent for a job.
    ///
    /// The token is derived from the job id, so repeated intents for the same
    /// job are physical duplicates of one another.
    pub fn provision_requested(job_id: JobId) -> Self {
        Self {
            job_id,
            kind: EventKind::ProvisionRequested,
            source: None,
            delivery_token: DeliveryToken::new(format!("provision:{job_id}")),
            detail: None,
            output_reference: None,
        }
    }

    pub fn provision_acked(source: ComputeUnitHandle, token: DeliveryToken) -> Self {
        Self::from_unit(EventKind::ProvisionAcked, source, token)
    }

    pub fn completion(source: ComputeUnitHandle, token: DeliveryToken) -> Self {
        Self::from_unit(EventKind::CompletionSignaled, source, token)
    }

    pub fn failure(
        source: ComputeUnitHandle,
        token: DeliveryToken,
        reason: impl Into<String>,
    ) -> Self {
        let mut event = Self::from_unit(EventKind::FailureSignaled, source, token);
        event.detail = Some(reason.into());
        event
    }

    pub fn with_output(mut self, output: ObjectRef) -> Self {
        self.output_reference = Some(output);
        self
    }

    fn from_unit(kind: EventKind, source: ComputeUnitHandle, token: DeliveryToken) -> Self {
        Self {
            job_id: source.job_id,
            kind,
            source: Some(source),
            delivery_token: token,
            detail: None,
            output_reference: None,
        }
    }

    /// Structural checks applied before an event reaches the state machine.
    pub fn validate(&self) -> DomainResult<()> {
        if let Some(source) = &self.source {
            if source.job_id != self.job_id {
                return Err(DomainError::validation(format!(
                    "compute unit {} is tagged for job {}, not {}",
                    source.id, source.job_id, self.job_id
                )));
            }
        } else if self.kind != EventKind::ProvisionRequested {
            return Err(DomainError::validation(format!(
                "{} must name its source compute unit",
                self.kind
            )));
        }

        if let Some(output) = &self.output_reference {
            output.validate()?;
        }

        Ok(())
    }
}
