//! Request/response DTOs and mapping helpers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use warden_core::{Job, JobId, JobState, ObjectRef, TransitionRecord};
use warden_infra::SubmitRequest;

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub input_reference: ObjectRef,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub max_runtime_secs: Option<u64>,
}

impl From<SubmitJobRequest> for SubmitRequest {
    fn from(body: SubmitJobRequest) -> Self {
        SubmitRequest {
            input_reference: body.input_reference,
            metadata: body.metadata,
            max_runtime_secs: body.max_runtime_secs,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SubmitJobResponse {
    pub id: JobId,
    pub input_reference: ObjectRef,
    pub status: JobState,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub state: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelJobRequest {
    pub reason: Option<String>,
}

/// Job as shown to API clients.
#[derive(Debug, Serialize)]
pub struct JobView {
    pub id: JobId,
    pub status: JobState,
    pub input_reference: ObjectRef,
    pub output_reference: Option<ObjectRef>,
    pub metadata: BTreeMap<String, String>,
    pub compute_unit: Option<String>,
    pub failure_reason: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub reclaim_attempts: u32,
    pub history: Vec<TransitionRecord>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            status: job.state,
            input_reference: job.input_reference,
            output_reference: job.output_reference,
            metadata: job.metadata,
            compute_unit: job.compute_unit.map(|unit| unit.id.to_string()),
            failure_reason: job.failure_reason,
            submitted_at: job.submitted_at,
            last_transition_at: job.last_transition_at,
            deadline: job.deadline,
            reclaim_attempts: job.reclaim_attempts,
            history: job.history,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StoredObjectResponse {
    pub key: String,
    pub content_type: String,
    pub size: usize,
    pub reference: ObjectRef,
}
