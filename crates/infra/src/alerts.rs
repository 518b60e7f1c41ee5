//! Operator alerts for compute units that could not be reclaimed.
//!
//! Alerts are separate from the lifecycle stream: they ask a human to act,
//! they do not drive the state machine.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;

use warden_core::{AlertId, ComputeUnitId, JobId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperatorAlert {
    pub id: AlertId,
    pub job_id: JobId,
    pub compute_unit: Option<ComputeUnitId>,
    pub raised_at: DateTime<Utc>,
    pub attempts: u32,
    pub message: String,
}

impl OperatorAlert {
    pub fn new(
        job_id: JobId,
        compute_unit: Option<ComputeUnitId>,
        raised_at: DateTime<Utc>,
        attempts: u32,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: AlertId::new(),
            job_id,
            compute_unit,
            raised_at,
            attempts,
            message: message.into(),
        }
    }
}

pub trait AlertSink: Send + Sync + 'static {
    fn raise(&self, alert: OperatorAlert);
}

/// Logs alerts at error level and keeps them for inspection.
#[derive(Debug, Default)]
pub struct InMemoryAlertSink {
    inner: Mutex<Vec<OperatorAlert>>,
}

impl InMemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<OperatorAlert> {
        match self.inner.lock() {
            Ok(alerts) => alerts.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn for_job(&self, job_id: JobId) -> Vec<OperatorAlert> {
        self.all()
            .into_iter()
            .filter(|alert| alert.job_id == job_id)
            .collect()
    }
}

impl AlertSink for InMemoryAlertSink {
    fn raise(&self, alert: OperatorAlert) {
        error!(
            alert_id = %alert.id,
            job_id = %alert.job_id,
            compute_unit = ?alert.compute_unit.as_ref().map(|u| u.as_str()),
            attempts = alert.attempts,
            message = %alert.message,
            "operator alert raised"
        );
        match self.inner.lock() {
            Ok(mut alerts) => alerts.push(alert),
            Err(poisoned) => poisoned.into_inner().push(alert),
        }
    }
}
