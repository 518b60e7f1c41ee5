//! End-to-end tests for the job lifecycle.
//!
//! Tests: submit → provision → lifecycle signals → reclaim, plus the
//! watchdog and bus-driven paths, against the in-memory store and the
//! simulated provisioner with a manual clock.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use warden_core::{
    ComputeUnitHandle, ComputeUnitId, DeliveryToken, Job, JobId, JobState, LifecycleEvent,
    ObjectRef,
};
use warden_events::{Delivery, EventBus, InMemoryEventBus};

use crate::alerts::InMemoryAlertSink;
use crate::clock::{Clock, ManualClock};
use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::jobs::{InMemoryJobStore, RetryPolicy};
use crate::object_store::{InMemoryObjectStore, ObjectStore};
use crate::orchestrator::{IngestOutcome, Orchestrator, SubmitRequest};
use crate::provisioning::{Autopilot, Provisioner, ProvisionerError, SimulatedProvisioner};
use crate::watchdog::DEADLINE_EXCEEDED;
use crate::workers::LifecycleWorker;

type TestOrchestrator = Orchestrator<Arc<InMemoryJobStore>, Arc<SimulatedProvisioner>>;

struct Harness {
    orchestrator: Arc<TestOrchestrator>,
    provisioner: Arc<SimulatedProvisioner>,
    alerts: Arc<InMemoryAlertSink>,
    clock: Arc<ManualClock>,
}

fn config(await_ack: bool) -> OrchestratorConfig {
    OrchestratorConfig {
        max_runtime: Duration::from_secs(5 * 60),
        await_provision_ack: await_ack,
        provision_retry: RetryPolicy::fixed(3, Duration::from_millis(1)),
        terminate_retry: RetryPolicy::fixed(3, Duration::from_millis(1)),
        ..OrchestratorConfig::default()
    }
}

fn harness_with(provisioner: SimulatedProvisioner, config: OrchestratorConfig) -> Harness {
    let provisioner = Arc::new(provisioner);
    let alerts = Arc::new(InMemoryAlertSink::new());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let orchestrator = Arc::new(Orchestrator::new(
        InMemoryJobStore::arc(),
        provisioner.clone(),
        alerts.clone(),
        clock.clone(),
        config,
    ));

    Harness {
        orchestrator,
        provisioner,
        alerts,
        clock,
    }
}

fn harness(await_ack: bool) -> Harness {
    harness_with(SimulatedProvisioner::new(), config(await_ack))
}

fn request() -> SubmitRequest {
    SubmitRequest::new(ObjectRef::object("uploads/input.txt"))
}

fn unit_of(job: &Job) -> ComputeUnitHandle {
    job.compute_unit.clone().expect("job should own a compute unit")
}

fn states(job: &Job) -> Vec<JobState> {
    job.history.iter().map(|record| record.to).collect()
}

#[tokio::test]
async fn submitted_job_is_provisioned_and_running() {
    let h = harness(false);
    let job = h.orchestrator.submit(request()).await.unwrap();

    assert_eq!(job.state, JobState::Running);
    assert_eq!(h.provisioner.create_calls(), 1);
    assert_eq!(unit_of(&job).job_id, job.id);
    assert_eq!(job.deadline, job.submitted_at + chrono::Duration::minutes(5));
}

#[tokio::test]
async fn provision_ack_moves_job_to_running_when_awaited() {
    let h = harness(true);
    let job = h.orchestrator.submit(request()).await.unwrap();
    assert_eq!(job.state, JobState::Provisioning);

    let ack = LifecycleEvent::provision_acked(unit_of(&job), DeliveryToken::new("ack-1"));
    let outcome = h.orchestrator.ingest(ack.clone()).await.unwrap();
    assert_eq!(
        outcome,
        IngestOutcome::Applied {
            job_id: job.id,
            from: JobState::Provisioning,
            to: JobState::Running
        }
    );
    assert_eq!(
        h.orchestrator.ingest(ack).await.unwrap(),
        IngestOutcome::Duplicate { job_id: job.id }
    );
}

#[tokio::test]
async fn deadline_without_ack_fails_then_reclaims() {
    let h = harness(true);
    let job = h.orchestrator.submit(request()).await.unwrap();
    assert_eq!(job.state, JobState::Provisioning);

    h.clock.advance(chrono::Duration::minutes(6));
    let report = h.orchestrator.watchdog().sweep().await.unwrap();
    assert_eq!(report.expired, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.reclaimed, 1);

    let job = h.orchestrator.get_status(job.id).await.unwrap();
    assert_eq!(job.state, JobState::Reclaimed);
    assert_eq!(job.failure_reason.as_deref(), Some(DEADLINE_EXCEEDED));
    assert_eq!(
        states(&job),
        vec![JobState::Provisioning, JobState::Failed, JobState::Reclaimed]
    );
    assert_eq!(h.provisioner.terminate_calls(), 1);
    assert!(h.provisioner.live_units().is_empty());

    // A second sweep finds nothing to do.
    let again = h.orchestrator.watchdog().sweep().await.unwrap();
    assert_eq!(again.failed, 0);
    assert_eq!(h.provisioner.terminate_calls(), 1);
}

#[tokio::test]
async fn duplicate_completions_terminate_once() {
    let h = harness(false);
    let job = h.orchestrator.submit(request()).await.unwrap();
    let unit = unit_of(&job);

    let first = LifecycleEvent::completion(unit.clone(), DeliveryToken::new("done-a"))
        .with_output(ObjectRef::object("outputs/result.txt"));
    let second = LifecycleEvent::completion(unit, DeliveryToken::new("done-b"));

    let outcome = h.orchestrator.ingest(first).await.unwrap();
    assert!(matches!(outcome, IngestOutcome::Applied { to: JobState::Completed, .. }));

    h.clock.advance(chrono::Duration::seconds(1));
    let outcome = h.orchestrator.ingest(second).await.unwrap();
    assert_eq!(outcome, IngestOutcome::Duplicate { job_id: job.id });

    let job = h.orchestrator.get_status(job.id).await.unwrap();
    assert_eq!(job.state, JobState::Reclaimed);
    assert_eq!(
        states(&job),
        vec![
            JobState::Provisioning,
            JobState::Running,
            JobState::Completed,
            JobState::Reclaimed
        ]
    );
    assert_eq!(job.output_reference, Some(ObjectRef::object("outputs/result.txt")));
    assert_eq!(h.provisioner.terminate_calls(), 1);
}

#[tokio::test]
async fn redelivering_one_completion_many_times_has_one_effect() {
    let h = harness(false);
    let job = h.orchestrator.submit(request()).await.unwrap();
    let event = LifecycleEvent::completion(unit_of(&job), DeliveryToken::new("done"));

    let mut applied = 0;
    for _ in 0..5 {
        if let IngestOutcome::Applied { .. } = h.orchestrator.ingest(event.clone()).await.unwrap() {
            applied += 1;
        }
    }

    assert_eq!(applied, 1);
    assert_eq!(h.provisioner.terminate_calls(), 1);
    assert_eq!(h.orchestrator.dedup_stats().duplicates, 4);
}

#[tokio::test]
async fn out_of_order_events_are_ignored() {
    let h = harness(true);
    let job = h.orchestrator.register(request()).await.unwrap();
    let stray = ComputeUnitHandle::new(ComputeUnitId::new("sim-99"), job.id);

    // Nothing has been provisioned yet.
    for event in [
        LifecycleEvent::completion(stray.clone(), DeliveryToken::new("c")),
        LifecycleEvent::provision_acked(stray.clone(), DeliveryToken::new("a")),
        LifecycleEvent::failure(stray, DeliveryToken::new("f"), "boom"),
    ] {
        let outcome = h.orchestrator.ingest(event).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Stale { .. }), "{outcome:?}");
    }

    let stored = h.orchestrator.get_status(job.id).await.unwrap();
    assert_eq!(stored.state, JobState::Submitted);
    assert_eq!(stored.revision, 0);

    // Completion while still provisioning is stale too.
    h.orchestrator
        .ingest(LifecycleEvent::provision_requested(job.id))
        .await
        .unwrap();
    let job = h.orchestrator.get_status(job.id).await.unwrap();
    let outcome = h
        .orchestrator
        .ingest(LifecycleEvent::completion(unit_of(&job), DeliveryToken::new("early")))
        .await
        .unwrap();
    assert!(matches!(outcome, IngestOutcome::Stale { .. }));
    assert_eq!(
        h.orchestrator.get_status(job.id).await.unwrap().state,
        JobState::Provisioning
    );
}

#[tokio::test]
async fn signals_from_a_foreign_unit_are_stale() {
    let h = harness(false);
    let job = h.orchestrator.submit(request()).await.unwrap();
    let impostor = ComputeUnitHandle::new(ComputeUnitId::new("not-ours"), job.id);

    let outcome = h
        .orchestrator
        .ingest(LifecycleEvent::completion(impostor, DeliveryToken::new("x")))
        .await
        .unwrap();
    assert!(matches!(outcome, IngestOutcome::Stale { .. }));
    assert_eq!(
        h.orchestrator.get_status(job.id).await.unwrap().state,
        JobState::Running
    );
}

#[tokio::test]
async fn reclaim_tolerates_an_already_terminated_unit() {
    let h = harness(false);
    let job = h.orchestrator.submit(request()).await.unwrap();
    let unit = unit_of(&job);

    // Someone else already tore the unit down.
    h.provisioner.terminate(&unit).await.unwrap();

    h.orchestrator
        .ingest(LifecycleEvent::completion(unit, DeliveryToken::new("done")))
        .await
        .unwrap();

    let job = h.orchestrator.get_status(job.id).await.unwrap();
    assert_eq!(job.state, JobState::Reclaimed);
    assert!(h.alerts.all().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_completion_and_failure_reach_one_terminal_state() {
    for _ in 0..10 {
        let h = harness(false);
        let job = h.orchestrator.submit(request()).await.unwrap();
        let unit = unit_of(&job);

        let done = LifecycleEvent::completion(unit.clone(), DeliveryToken::new("done"));
        let failed = LifecycleEvent::failure(unit, DeliveryToken::new("fail"), "script crashed");

        let (a, b) = tokio::join!(
            tokio::spawn({
                let o = h.orchestrator.clone();
                async move { o.ingest(done).await }
            }),
            tokio::spawn({
                let o = h.orchestrator.clone();
                async move { o.ingest(failed).await }
            }),
        );
        let outcomes = [a.unwrap().unwrap(), b.unwrap().unwrap()];

        let applied = outcomes
            .iter()
            .filter(|o| matches!(o, IngestOutcome::Applied { .. }))
            .count();
        assert_eq!(applied, 1, "{outcomes:?}");

        let job = h.orchestrator.get_status(job.id).await.unwrap();
        assert_eq!(job.state, JobState::Reclaimed);
        let terminal: Vec<_> = states(&job)
            .into_iter()
            .filter(|s| matches!(s, JobState::Completed | JobState::Failed))
            .collect();
        assert_eq!(terminal.len(), 1);
        assert_eq!(h.provisioner.terminate_calls(), 1);
    }
}

#[tokio::test]
async fn transient_creation_failures_are_retried() {
    let h = harness(false);
    h.provisioner.fail_next_creates(2);

    let job = h.orchestrator.submit(request()).await.unwrap();
    assert_eq!(job.state, JobState::Running);
    assert_eq!(h.provisioner.create_calls(), 3);
}

#[tokio::test]
async fn exhausted_provisioner_fails_the_job() {
    let h = harness(false);
    h.provisioner.fail_next_creates(10);

    let job = h.orchestrator.submit(request()).await.unwrap();
    assert_eq!(job.state, JobState::Reclaimed);
    assert!(job
        .failure_reason
        .as_deref()
        .is_some_and(|r| r.contains("provisioner unavailable")));
    assert_eq!(h.provisioner.create_calls(), 3);
    assert_eq!(h.provisioner.terminate_calls(), 0);
    assert!(job.compute_unit.is_none());
}

#[tokio::test]
async fn rejected_creation_is_not_retried() {
    let h = harness(false);
    h.provisioner.reject_creates(true);

    let job = h.orchestrator.submit(request()).await.unwrap();
    assert_eq!(job.state, JobState::Reclaimed);
    assert_eq!(h.provisioner.create_calls(), 1);
}

#[tokio::test]
async fn termination_outage_alerts_and_watchdog_redrives() {
    let h = harness(false);
    let job = h.orchestrator.submit(request()).await.unwrap();
    h.provisioner.fail_all_terminates(true);

    h.orchestrator
        .ingest(LifecycleEvent::completion(unit_of(&job), DeliveryToken::new("done")))
        .await
        .unwrap();

    let stuck = h.orchestrator.get_status(job.id).await.unwrap();
    assert_eq!(stuck.state, JobState::Completed);
    assert_eq!(stuck.reclaim_attempts, 1);
    assert_eq!(h.provisioner.terminate_calls(), 3);

    let alerts = h.alerts.for_job(job.id);
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].compute_unit, Some(unit_of(&job).id));
    assert_eq!(alerts[0].attempts, 3);

    // Outage over; the watchdog re-drives once the grace period has passed.
    h.provisioner.fail_all_terminates(false);
    let early = h.orchestrator.watchdog().sweep().await.unwrap();
    assert_eq!(early.redriven, 0);

    h.clock.advance(chrono::Duration::minutes(2));
    let report = h.orchestrator.watchdog().sweep().await.unwrap();
    assert_eq!(report.redriven, 1);
    assert_eq!(report.reclaimed, 1);
    assert_eq!(
        h.orchestrator.get_status(job.id).await.unwrap().state,
        JobState::Reclaimed
    );
}

#[tokio::test]
async fn direct_reclaim_reports_termination_failure() {
    let h = harness(false);
    let job = h.orchestrator.submit(request()).await.unwrap();
    h.provisioner.fail_all_terminates(true);
    h.orchestrator.cancel(job.id, None).await.unwrap();

    let err = h.orchestrator.reclaim(job.id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::TerminationFailed { attempts: 3, .. }));
}

#[tokio::test]
async fn rejected_termination_is_not_retried() {
    let h = harness(false);
    let unknown = ComputeUnitHandle::new(ComputeUnitId::new("never-created"), JobId::new());

    let (attempts, err) = h
        .orchestrator
        .coordinator()
        .terminate_with_retry(&unknown)
        .await
        .unwrap_err();
    assert_eq!(attempts, 1);
    assert!(matches!(err, ProvisionerError::Rejected(_)));
    assert_eq!(h.provisioner.terminate_calls(), 1);
}

#[tokio::test]
async fn cancel_fails_and_reclaims_running_job() {
    let h = harness(false);
    let job = h.orchestrator.submit(request()).await.unwrap();

    let cancelled = h.orchestrator.cancel(job.id, None).await.unwrap();
    assert_eq!(cancelled.state, JobState::Reclaimed);
    assert_eq!(cancelled.failure_reason.as_deref(), Some("cancelled"));
    assert_eq!(h.provisioner.terminate_calls(), 1);

    // Cancelling again changes nothing.
    let again = h.orchestrator.cancel(job.id, None).await.unwrap();
    assert_eq!(again.state, JobState::Reclaimed);
    assert_eq!(h.provisioner.terminate_calls(), 1);

    // Late completion from the unit is stale.
    let outcome = h
        .orchestrator
        .ingest(LifecycleEvent::completion(unit_of(&job), DeliveryToken::new("late")))
        .await
        .unwrap();
    assert!(matches!(outcome, IngestOutcome::Stale { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unit_created_after_cancel_is_terminated() {
    let h = harness_with(
        SimulatedProvisioner::new().with_create_latency(Duration::from_millis(100)),
        config(false),
    );
    let job = h.orchestrator.register(request()).await.unwrap();

    let provisioning = tokio::spawn({
        let o = h.orchestrator.clone();
        let id = job.id;
        async move { o.ingest(LifecycleEvent::provision_requested(id)).await }
    });

    // Cancel while the create call is in flight.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let cancelled = h.orchestrator.cancel(job.id, None).await.unwrap();
    assert_eq!(cancelled.state, JobState::Reclaimed);

    provisioning.await.unwrap().unwrap();

    assert_eq!(h.provisioner.create_calls(), 1);
    assert_eq!(h.provisioner.units().len(), 1);
    assert!(h.provisioner.live_units().is_empty());
    let job = h.orchestrator.get_status(job.id).await.unwrap();
    assert!(job.compute_unit.is_none());
}

#[tokio::test]
async fn unknown_job_and_bad_submissions_are_surfaced() {
    let h = harness(false);

    let missing = JobId::new();
    assert_eq!(
        h.orchestrator.get_status(missing).await.unwrap_err(),
        OrchestratorError::NotFound(missing)
    );
    assert_eq!(
        h.orchestrator
            .ingest(LifecycleEvent::provision_requested(missing))
            .await
            .unwrap_err(),
        OrchestratorError::NotFound(missing)
    );

    let err = h
        .orchestrator
        .submit(SubmitRequest::new(ObjectRef::object("")))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));

    let mut endless = request();
    endless.max_runtime_secs = Some(10_000_000_000_000);
    let err = h.orchestrator.register(endless).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));
    assert!(h.orchestrator.list(None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn huge_reclaim_grace_still_enforces_deadlines() {
    let h = harness_with(
        SimulatedProvisioner::new(),
        OrchestratorConfig {
            reclaim_grace: Duration::from_secs(10_000_000_000_000),
            ..config(true)
        },
    );
    let job = h.orchestrator.submit(request()).await.unwrap();

    h.clock.advance(chrono::Duration::minutes(6));
    let report = h.orchestrator.watchdog().sweep().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.reclaimed, 1);
    assert_eq!(report.redriven, 0);

    let job = h.orchestrator.get_status(job.id).await.unwrap();
    assert_eq!(job.state, JobState::Reclaimed);
}

#[tokio::test]
async fn list_filters_by_state() {
    let h = harness(true);
    let provisioning = h.orchestrator.submit(request()).await.unwrap();
    let cancelled = h.orchestrator.submit(request()).await.unwrap();
    h.orchestrator.cancel(cancelled.id, None).await.unwrap();

    let reclaimed = h
        .orchestrator
        .list(Some(JobState::Reclaimed), 10)
        .await
        .unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, cancelled.id);

    let waiting = h
        .orchestrator
        .list(Some(JobState::Provisioning), 10)
        .await
        .unwrap();
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].id, provisioning.id);

    assert_eq!(h.orchestrator.list(None, 10).await.unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bus_driven_lifecycle_runs_to_reclaim() {
    let bus = Arc::new(InMemoryEventBus::<Delivery<LifecycleEvent>>::new());
    let objects = Arc::new(InMemoryObjectStore::new());
    objects
        .put("uploads/input.txt", "text/plain", b"hello".to_vec())
        .await
        .unwrap();

    let signal_bus = bus.clone();
    let provisioner = SimulatedProvisioner::new().with_autopilot(Autopilot {
        signals: Arc::new(move |event: LifecycleEvent| {
            let _ = signal_bus.publish(Delivery::new(
                event.delivery_token.to_string(),
                Utc::now(),
                event,
            ));
        }),
        objects: Some(objects.clone() as Arc<dyn ObjectStore>),
        boot_time: Duration::from_millis(20),
        work_time: Duration::from_millis(10),
        send_ack: true,
    });
    let h = harness_with(provisioner, config(true));
    let worker = LifecycleWorker::spawn("test-lifecycle", &bus, h.orchestrator.clone());

    let job = h.orchestrator.register(request()).await.unwrap();
    bus.publish(Delivery::new(
        "intent-1",
        h.clock.now(),
        LifecycleEvent::provision_requested(job.id),
    ))
    .unwrap();

    let mut state = JobState::Submitted;
    for _ in 0..200 {
        state = h.orchestrator.get_status(job.id).await.unwrap().state;
        if state == JobState::Reclaimed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    worker.shutdown().await;

    assert_eq!(state, JobState::Reclaimed);
    let job = h.orchestrator.get_status(job.id).await.unwrap();
    let Some(ObjectRef::Object { key }) = job.output_reference else {
        panic!("expected an output object");
    };
    assert_eq!(objects.get(&key).await.unwrap().bytes, b"hello : 5");
    assert!(h.provisioner.live_units().is_empty());
}

#[tokio::test]
async fn spawned_watchdog_sweeps_until_shut_down() {
    let h = harness(true);
    let job = h.orchestrator.submit(request()).await.unwrap();
    h.clock.advance(chrono::Duration::minutes(6));

    let handle = Arc::new(h.orchestrator.watchdog()).spawn(Duration::from_millis(10));
    let mut stats = handle.stats();
    for _ in 0..100 {
        stats = handle.stats();
        if stats.failed > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.shutdown().await;

    assert!(stats.sweeps >= 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.reclaimed, 1);
    assert_eq!(
        h.orchestrator.get_status(job.id).await.unwrap().state,
        JobState::Reclaimed
    );
}
