use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use warden_core::{JobId, LifecycleEvent};

/// Envelope for one physical delivery of a message.
///
/// Notes:
/// - `message_id` is assigned by the transport (stream entry id, queue receipt, ...).
/// - `attempt` starts at 1 and grows each time the transport redelivers.
/// - `payload` carries its own delivery token; redeliveries keep it unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery<M> {
    message_id: String,
    attempt: u32,
    published_at: DateTime<Utc>,
    payload: M,
}

impl<M> Delivery<M> {
    pub fn new(message_id: impl Into<String>, published_at: DateTime<Utc>, payload: M) -> Self {
        Self {
            message_id: message_id.into(),
            attempt: 1,
            published_at,
            payload,
        }
    }

    /// The same message delivered once more.
    pub fn redelivered(&self) -> Self
    where
        M: Clone,
    {
        Self {
            message_id: self.message_id.clone(),
            attempt: self.attempt.saturating_add(1),
            published_at: self.published_at,
            payload: self.payload.clone(),
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt.max(1);
        self
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }

    pub fn payload(&self) -> &M {
        &self.payload
    }

    pub fn into_payload(self) -> M {
        self.payload
    }
}

/// Messages that concern exactly one job.
pub trait JobScoped {
    fn job_id(&self) -> JobId;
}

impl JobScoped for LifecycleEvent {
    fn job_id(&self) -> JobId {
        self.job_id
    }
}

impl<M: JobScoped> JobScoped for Delivery<M> {
    fn job_id(&self) -> JobId {
        self.payload.job_id()
    }
}
