//! Completion watchdog.
//!
//! Each sweep does two passes over the job store:
//! 1. jobs past their deadline that never finished are failed and reclaimed;
//! 2. Completed/Failed jobs that have waited longer than the grace period
//!    get their reclaim re-driven (e.g. after a termination outage).
//!
//! Sweeps are idempotent: the failing edge is a compare-and-swap, so a job
//! is failed at most once however many sweeps see it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use warden_core::{JobId, JobState};

use crate::error::OrchestratorError;
use crate::jobs::{
    JobStateMachine, JobStore, JobStoreError, TransitionOutcome, scan_awaiting_reclaim,
    scan_deadline_expired,
};
use crate::provisioning::{Provisioner, ProvisioningCoordinator, ReclaimOutcome};

/// Reason recorded on jobs failed by the watchdog.
pub const DEADLINE_EXCEEDED: &str = "deadline exceeded";

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Overdue jobs seen by the deadline pass.
    pub expired: usize,
    /// Jobs this sweep moved to `Failed`.
    pub failed: usize,
    pub reclaimed: usize,
    pub reclaim_failures: usize,
    /// Jobs whose stalled reclaim was retried.
    pub redriven: usize,
}

/// Running totals across sweeps.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WatchdogStats {
    pub sweeps: u64,
    pub failed: u64,
    pub reclaimed: u64,
    pub reclaim_failures: u64,
    pub last_sweep_at: Option<DateTime<Utc>>,
}

pub struct CompletionWatchdog<S, P> {
    machine: Arc<JobStateMachine<S>>,
    coordinator: Arc<ProvisioningCoordinator<S, P>>,
    page_size: usize,
    reclaim_grace: chrono::Duration,
}

impl<S, P> CompletionWatchdog<S, P>
where
    S: JobStore + 'static,
    P: Provisioner + 'static,
{
    pub fn new(
        machine: Arc<JobStateMachine<S>>,
        coordinator: Arc<ProvisioningCoordinator<S, P>>,
        page_size: usize,
        reclaim_grace: chrono::Duration,
    ) -> Self {
        Self {
            machine,
            coordinator,
            page_size: page_size.max(1),
            reclaim_grace,
        }
    }

    /// Run both passes once at the clock's current time.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> Result<SweepReport, JobStoreError> {
        let now = self.machine.clock().now();
        let mut report = SweepReport::default();

        let store = self.machine.store();
        let mut expired = scan_deadline_expired(store, now, self.page_size);
        while let Some(page) = expired.next_page().await? {
            for job_id in page {
                report.expired += 1;
                self.expire(job_id, &mut report).await;
            }
        }

        // A grace reaching past the earliest representable time re-drives nothing.
        if let Some(settled_before) = now.checked_sub_signed(self.reclaim_grace) {
            let mut stalled = scan_awaiting_reclaim(store, settled_before, self.page_size);
            while let Some(page) = stalled.next_page().await? {
                for job_id in page {
                    report.redriven += 1;
                    debug!(job_id = %job_id, "re-driving stalled reclaim");
                    self.reclaim(job_id, &mut report).await;
                }
            }
        }

        if report != SweepReport::default() {
            info!(
                expired = report.expired,
                failed = report.failed,
                reclaimed = report.reclaimed,
                reclaim_failures = report.reclaim_failures,
                redriven = report.redriven,
                "watchdog sweep finished"
            );
        }
        Ok(report)
    }

    async fn expire(&self, job_id: JobId, report: &mut SweepReport) {
        let outcome = self
            .machine
            .transition(
                job_id,
                &[JobState::Submitted, JobState::Provisioning, JobState::Running],
                JobState::Failed,
                Some(DEADLINE_EXCEEDED.to_string()),
            )
            .await;

        match outcome {
            Ok(TransitionOutcome::Applied(job)) => {
                report.failed += 1;
                warn!(
                    job_id = %job_id,
                    deadline = %job.deadline,
                    compute_unit = ?job.compute_unit.as_ref().map(|u| u.id.as_str()),
                    "job exceeded its deadline; failing"
                );
                self.reclaim(job_id, report).await;
            }
            Ok(TransitionOutcome::Skipped(job)) => {
                debug!(job_id = %job_id, state = %job.state, "job finished before the watchdog got to it");
            }
            Err(err) => {
                warn!(job_id = %job_id, error = %err, "could not fail overdue job");
            }
        }
    }

    async fn reclaim(&self, job_id: JobId, report: &mut SweepReport) {
        match self.coordinator.reclaim(job_id).await {
            Ok(ReclaimOutcome::Reclaimed(_)) => report.reclaimed += 1,
            Ok(ReclaimOutcome::AlreadyReclaimed(_) | ReclaimOutcome::InProgress(_)) => {}
            Err(OrchestratorError::TerminationFailed { .. }) => report.reclaim_failures += 1,
            Err(err) => warn!(job_id = %job_id, error = %err, "reclaim failed"),
        }
    }

    /// Sweep every `interval` until the returned handle is shut down.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> WatchdogHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let stats = Arc::new(Mutex::new(WatchdogStats::default()));
        let task_stats = stats.clone();

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        match self.sweep().await {
                            Ok(report) => record(&task_stats, &report, self.machine.clock().now()),
                            Err(err) => error!(error = %err, "watchdog sweep failed"),
                        }
                    }
                }
            }
            info!("watchdog stopped");
        });

        WatchdogHandle {
            shutdown: Some(shutdown_tx),
            join: Some(join),
            stats,
        }
    }
}

fn record(stats: &Mutex<WatchdogStats>, report: &SweepReport, at: DateTime<Utc>) {
    let mut stats = match stats.lock() {
        Ok(stats) => stats,
        Err(poisoned) => poisoned.into_inner(),
    };
    stats.sweeps += 1;
    stats.failed += report.failed as u64;
    stats.reclaimed += report.reclaimed as u64;
    stats.reclaim_failures += report.reclaim_failures as u64;
    stats.last_sweep_at = Some(at);
}

/// Handle to control a running watchdog.
#[derive(Debug)]
pub struct WatchdogHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<WatchdogStats>>,
}

impl WatchdogHandle {
    /// Request graceful shutdown and wait for the current sweep to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }

    pub fn stats(&self) -> WatchdogStats {
        match self.stats.lock() {
            Ok(stats) => stats.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}
