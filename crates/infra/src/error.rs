use warden_core::{ComputeUnitId, DomainError, JobId};

use crate::jobs::JobStoreError;
use crate::object_store::ObjectStoreError;

/// Errors surfaced by orchestrator operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrchestratorError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("provisioner unavailable for job {job_id} after {attempts} attempts: {message}")]
    ProvisionerUnavailable {
        job_id: JobId,
        attempts: u32,
        message: String,
    },

    #[error("deadline exceeded for job {0}")]
    DeadlineExceeded(JobId),

    #[error("termination of compute unit {unit} for job {job_id} failed after {attempts} attempts: {message}")]
    TerminationFailed {
        job_id: JobId,
        unit: ComputeUnitId,
        attempts: u32,
        message: String,
    },

    #[error("storage error: {0}")]
    Store(String),
}

impl From<JobStoreError> for OrchestratorError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(id) => OrchestratorError::NotFound(id),
            JobStoreError::Conflict { .. } | JobStoreError::AlreadyExists(_) => {
                OrchestratorError::Conflict(err.to_string())
            }
            JobStoreError::Storage(msg) => OrchestratorError::Store(msg),
        }
    }
}

impl From<DomainError> for OrchestratorError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => {
                OrchestratorError::Validation(msg)
            }
            DomainError::Conflict(msg) => OrchestratorError::Conflict(msg),
            other => OrchestratorError::Conflict(other.to_string()),
        }
    }
}

impl From<ObjectStoreError> for OrchestratorError {
    fn from(err: ObjectStoreError) -> Self {
        match err {
            ObjectStoreError::Invalid(msg) => OrchestratorError::Validation(msg),
            ObjectStoreError::NotFound(key) => {
                OrchestratorError::Validation(format!("object not found: {key}"))
            }
            ObjectStoreError::Storage(msg) => OrchestratorError::Store(msg),
        }
    }
}
