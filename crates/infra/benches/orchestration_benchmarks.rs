use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::runtime::Runtime;
use warden_core::{
    AdmissionLedger, ComputeUnitHandle, ComputeUnitId, DeliveryToken, JobId, LifecycleEvent,
    ObjectRef,
};
use warden_infra::jobs::{InMemoryJobStore, RetryPolicy};
use warden_infra::provisioning::SimulatedProvisioner;
use warden_infra::{
    Clock, InMemoryAlertSink, ManualClock, Orchestrator, OrchestratorConfig, SubmitRequest,
};

type BenchOrchestrator = Orchestrator<Arc<InMemoryJobStore>, Arc<SimulatedProvisioner>>;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn orchestrator(clock: Arc<ManualClock>) -> BenchOrchestrator {
    let config = OrchestratorConfig {
        max_runtime: Duration::from_secs(60),
        provision_retry: RetryPolicy::no_retry(),
        terminate_retry: RetryPolicy::no_retry(),
        ..OrchestratorConfig::default()
    };
    Orchestrator::new(
        InMemoryJobStore::arc(),
        Arc::new(SimulatedProvisioner::new()),
        Arc::new(InMemoryAlertSink::new()),
        clock,
        config,
    )
}

fn request() -> SubmitRequest {
    SubmitRequest::new(ObjectRef::object("uploads/input.txt"))
}

/// Submit, provision, complete and reclaim one job.
fn bench_full_lifecycle(c: &mut Criterion) {
    let rt = runtime();
    let orchestrator = orchestrator(Arc::new(ManualClock::new(Utc::now())));

    let mut group = c.benchmark_group("job_lifecycle");
    group.throughput(Throughput::Elements(1));

    group.bench_function("submit_complete_reclaim", |b| {
        b.iter(|| {
            rt.block_on(async {
                let job = orchestrator.submit(request()).await.unwrap();
                let unit = job.compute_unit.clone().unwrap();
                let outcome = orchestrator
                    .ingest(LifecycleEvent::completion(unit, DeliveryToken::generate()))
                    .await
                    .unwrap();
                black_box(outcome);
            })
        });
    });

    group.finish();
}

/// Cost of screening a redelivered signal that has already been applied.
fn bench_duplicate_ingest(c: &mut Criterion) {
    let rt = runtime();
    let orchestrator = orchestrator(Arc::new(ManualClock::new(Utc::now())));

    let event = rt.block_on(async {
        let job = orchestrator.submit(request()).await.unwrap();
        let unit = job.compute_unit.clone().unwrap();
        let event = LifecycleEvent::completion(unit, DeliveryToken::new("done"));
        orchestrator.ingest(event.clone()).await.unwrap();
        event
    });

    let mut group = c.benchmark_group("duplicate_ingest");
    group.sample_size(1000);
    group.bench_function("redelivered_completion", |b| {
        b.iter(|| rt.block_on(async { black_box(orchestrator.ingest(event.clone()).await.unwrap()) }));
    });
    group.finish();
}

/// Admission checks against a full token window.
fn bench_admission_ledger(c: &mut Criterion) {
    let mut group = c.benchmark_group("admission_ledger");

    for window in [8usize, 32, 256].iter() {
        let job_id = JobId::new();
        let unit = ComputeUnitHandle::new(ComputeUnitId::new("bench-unit"), job_id);
        let mut ledger = AdmissionLedger::with_window(*window);
        for i in 0..*window {
            ledger.record(&LifecycleEvent::provision_acked(
                unit.clone(),
                DeliveryToken::new(format!("ack-{i}")),
            ));
        }
        let fresh = LifecycleEvent::completion(unit.clone(), DeliveryToken::new("fresh"));

        group.bench_with_input(BenchmarkId::from_parameter(window), window, |b, _| {
            b.iter(|| black_box(ledger.check(&fresh)));
        });
    }

    group.finish();
}

/// One watchdog sweep over a store where every job is overdue.
fn bench_watchdog_sweep(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("watchdog_sweep");
    group.sample_size(20);

    for job_count in [10usize, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*job_count as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(job_count),
            job_count,
            |b, &job_count| {
                b.iter_batched(
                    || {
                        let clock = Arc::new(ManualClock::new(Utc::now()));
                        let orchestrator = orchestrator(clock.clone());
                        rt.block_on(async {
                            for _ in 0..job_count {
                                orchestrator.register(request()).await.unwrap();
                            }
                        });
                        clock.advance(chrono::Duration::minutes(2));
                        (orchestrator, clock)
                    },
                    |(orchestrator, clock)| {
                        let report = rt.block_on(orchestrator.watchdog().sweep()).unwrap();
                        assert_eq!(report.failed, job_count);
                        black_box((report, clock.now()));
                    },
                    criterion::BatchSize::LargeInput,
                );
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_full_lifecycle,
    bench_duplicate_ingest,
    bench_admission_ledger,
    bench_watchdog_sweep
);
criterion_main!(benches);
