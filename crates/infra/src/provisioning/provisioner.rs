use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use warden_core::{ComputeUnitHandle, ComputeUnitId, JobId, ObjectRef};

use crate::config::JOB_ID_TAG;

/// Tag carrying the object key a unit should read, when the input is stored.
pub const INPUT_KEY_TAG: &str = "input_key";

/// Labels attached to a compute unit at creation.
///
/// Always carries the owning job id, so the unit's later signals can be
/// correlated without the orchestrator's help.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitTags {
    job_id: JobId,
    labels: BTreeMap<String, String>,
}

impl UnitTags {
    pub fn for_job(job_id: JobId, input: &ObjectRef, extra: &BTreeMap<String, String>) -> Self {
        let mut labels = extra.clone();
        labels.insert(JOB_ID_TAG.to_string(), job_id.to_string());
        if let ObjectRef::Object { key } = input {
            labels.insert(INPUT_KEY_TAG.to_string(), key.clone());
        }
        Self { job_id, labels }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProvisionerError {
    /// Transient; the call may be retried.
    #[error("provisioner unavailable: {0}")]
    Unavailable(String),
    #[error("compute unit already terminated: {0}")]
    AlreadyTerminated(ComputeUnitId),
    /// Permanent refusal (bad tags, quota, unknown unit).
    #[error("provisioner rejected the request: {0}")]
    Rejected(String),
}

impl ProvisionerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProvisionerError::Unavailable(_))
    }
}

/// External system that creates and destroys compute units.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Create one unit labelled with `tags`. The returned handle is bound to
    /// `tags.job_id()`.
    async fn create(&self, tags: &UnitTags) -> Result<ComputeUnitHandle, ProvisionerError>;

    /// Destroy a unit. `AlreadyTerminated` is reported but means the unit is gone.
    async fn terminate(&self, unit: &ComputeUnitHandle) -> Result<(), ProvisionerError>;
}

#[async_trait]
impl<P> Provisioner for Arc<P>
where
    P: Provisioner + ?Sized,
{
    async fn create(&self, tags: &UnitTags) -> Result<ComputeUnitHandle, ProvisionerError> {
        (**self).create(tags).await
    }

    async fn terminate(&self, unit: &ComputeUnitHandle) -> Result<(), ProvisionerError> {
        (**self).terminate(unit).await
    }
}
