//! Service wiring: job store, lifecycle bus, provisioner, orchestrator.
//!
//! Two flavours, picked at startup:
//! - in-memory (dev/test): everything lives in the process
//! - persistent (`USE_PERSISTENT_STORES=true`): Postgres job store, plus the
//!   Redis Streams lifecycle bus when built with the `redis` feature

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use warden_core::LifecycleEvent;
use warden_events::{Delivery, EventBus, InMemoryEventBus};
use warden_infra::jobs::{InMemoryJobStore, JobStore, PostgresJobStore};
use warden_infra::provisioning::{Autopilot, SimulatedProvisioner};
use warden_infra::workers::{LifecycleWorker, WorkerHandle};
use warden_infra::{
    InMemoryAlertSink, InMemoryObjectStore, ObjectStore, Orchestrator, OrchestratorConfig,
    SystemClock, WatchdogHandle, WatchdogStats,
};

#[cfg(feature = "redis")]
use warden_infra::event_bus::RedisStreamsEventBus;

/// Orchestrator as wired by the API (store chosen at startup).
pub type ApiOrchestrator = Orchestrator<Arc<dyn JobStore>, Arc<SimulatedProvisioner>>;

/// How simulated compute units behave.
#[derive(Debug, Clone)]
pub struct SimulationSettings {
    pub boot_time: Duration,
    pub work_time: Duration,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            boot_time: Duration::from_millis(200),
            work_time: Duration::from_secs(1),
        }
    }
}

impl SimulationSettings {
    /// `WARDEN_SIM_BOOT_MS` / `WARDEN_SIM_WORK_MS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let millis = |key: &str, fallback: Duration| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(fallback)
        };

        Self {
            boot_time: millis("WARDEN_SIM_BOOT_MS", defaults.boot_time),
            work_time: millis("WARDEN_SIM_WORK_MS", defaults.work_time),
        }
    }
}

/// Where lifecycle deliveries travel between publishers and the worker.
#[derive(Clone)]
pub enum LifecycleBus {
    InMemory(Arc<InMemoryEventBus<Delivery<LifecycleEvent>>>),
    #[cfg(feature = "redis")]
    Redis(Arc<RedisStreamsEventBus>),
}

impl LifecycleBus {
    pub fn publish(&self, event: LifecycleEvent) -> Result<(), String> {
        let delivery = Delivery::new(Uuid::now_v7().to_string(), Utc::now(), event);
        match self {
            LifecycleBus::InMemory(bus) => bus.publish(delivery).map_err(|e| format!("{e:?}")),
            #[cfg(feature = "redis")]
            LifecycleBus::Redis(bus) => bus.publish(delivery).map_err(|e| e.to_string()),
        }
    }

    fn spawn_worker(&self, orchestrator: Arc<ApiOrchestrator>) -> WorkerHandle {
        match self {
            LifecycleBus::InMemory(bus) => LifecycleWorker::spawn("lifecycle", bus, orchestrator),
            #[cfg(feature = "redis")]
            LifecycleBus::Redis(bus) => LifecycleWorker::spawn("lifecycle", bus, orchestrator),
        }
    }
}

pub struct AppServices {
    pub orchestrator: Arc<ApiOrchestrator>,
    pub objects: Arc<dyn ObjectStore>,
    pub alerts: Arc<InMemoryAlertSink>,
    pub bus: LifecycleBus,
}

impl AppServices {
    /// Wire services around an already chosen store and bus.
    pub fn assemble(
        store: Arc<dyn JobStore>,
        bus: LifecycleBus,
        config: OrchestratorConfig,
        simulation: SimulationSettings,
    ) -> Self {
        let objects: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let alerts = Arc::new(InMemoryAlertSink::new());

        // Simulated units report back over the same bus real ones would use.
        let signal_bus = bus.clone();
        let provisioner = SimulatedProvisioner::new().with_autopilot(Autopilot {
            signals: Arc::new(move |event: LifecycleEvent| {
                if let Err(e) = signal_bus.publish(event) {
                    tracing::warn!(error = %e, "failed to publish unit signal");
                }
            }),
            objects: Some(objects.clone()),
            boot_time: simulation.boot_time,
            work_time: simulation.work_time,
            send_ack: config.await_provision_ack,
        });

        let orchestrator = Arc::new(Orchestrator::new(
            store,
            Arc::new(provisioner),
            alerts.clone(),
            Arc::new(SystemClock),
            config,
        ));

        Self {
            orchestrator,
            objects,
            alerts,
            bus,
        }
    }

    /// Everything in-process.
    pub fn in_memory(config: OrchestratorConfig, simulation: SimulationSettings) -> Self {
        let store: Arc<dyn JobStore> = InMemoryJobStore::arc();
        let bus = LifecycleBus::InMemory(Arc::new(InMemoryEventBus::new()));
        Self::assemble(store, bus, config, simulation)
    }

    /// Publish the provision intent for a freshly registered job.
    ///
    /// Falls back to in-process ingestion when the bus refuses the message.
    pub fn request_provisioning(&self, event: LifecycleEvent) {
        if let Err(e) = self.bus.publish(event.clone()) {
            tracing::warn!(job_id = %event.job_id, error = %e, "bus publish failed; ingesting directly");
            let orchestrator = self.orchestrator.clone();
            tokio::spawn(async move {
                if let Err(e) = orchestrator.ingest(event).await {
                    tracing::warn!(error = %e, "direct provision ingest failed");
                }
            });
        }
    }

    /// Start the lifecycle worker and the watchdog.
    pub fn start_background(&self) -> BackgroundTasks {
        let interval = self.orchestrator.config().watchdog_interval;
        let watchdog = Arc::new(self.orchestrator.watchdog()).spawn(interval);
        let worker = self.bus.spawn_worker(self.orchestrator.clone());

        BackgroundTasks { watchdog, worker }
    }
}

/// Handles for the background loops.
pub struct BackgroundTasks {
    watchdog: WatchdogHandle,
    worker: WorkerHandle,
}

impl BackgroundTasks {
    pub fn watchdog_stats(&self) -> WatchdogStats {
        self.watchdog.stats()
    }

    pub async fn shutdown(self) {
        self.worker.shutdown().await;
        self.watchdog.shutdown().await;
    }
}

/// Pick the service flavour from the environment.
pub async fn build_services(config: OrchestratorConfig) -> anyhow::Result<AppServices> {
    let use_persistent = std::env::var("USE_PERSISTENT_STORES")
        .unwrap_or_else(|_| "false".to_string())
        .parse::<bool>()
        .unwrap_or(false);
    let simulation = SimulationSettings::from_env();

    if !use_persistent {
        return Ok(AppServices::in_memory(config, simulation));
    }

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set when USE_PERSISTENT_STORES=true"))?;
    let pool = sqlx::PgPool::connect(&database_url).await?;
    let store = PostgresJobStore::new(pool);
    store.ensure_schema().await?;
    let store: Arc<dyn JobStore> = Arc::new(store);

    Ok(AppServices::assemble(store, persistent_bus()?, config, simulation))
}

#[cfg(feature = "redis")]
fn persistent_bus() -> anyhow::Result<LifecycleBus> {
    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
    let bus = RedisStreamsEventBus::new(&redis_url, None, None)?;
    Ok(LifecycleBus::Redis(Arc::new(bus)))
}

#[cfg(not(feature = "redis"))]
fn persistent_bus() -> anyhow::Result<LifecycleBus> {
    tracing::warn!("redis feature not enabled; lifecycle bus stays in-memory");
    Ok(LifecycleBus::InMemory(Arc::new(InMemoryEventBus::new())))
}
