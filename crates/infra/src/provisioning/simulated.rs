//! In-process provisioner for tests and local development.
//!
//! Units are bookkeeping entries. Faults can be injected per call, and an
//! optional autopilot plays the part of the workload: it acknowledges,
//! transforms the job input and signals completion like a real unit would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use warden_core::{ComputeUnitHandle, ComputeUnitId, DeliveryToken, LifecycleEvent, ObjectRef};

use crate::object_store::ObjectStore;

use super::provisioner::{INPUT_KEY_TAG, Provisioner, ProvisionerError, UnitTags};

/// Where a unit's lifecycle signals are sent.
pub type SignalSink = Arc<dyn Fn(LifecycleEvent) + Send + Sync>;

/// Scripted workload run by every unit the simulator creates.
#[derive(Clone)]
pub struct Autopilot {
    pub signals: SignalSink,
    pub objects: Option<Arc<dyn ObjectStore>>,
    /// Delay before the unit acknowledges.
    pub boot_time: Duration,
    pub work_time: Duration,
    pub send_ack: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedUnit {
    pub handle: ComputeUnitHandle,
    pub tags: UnitTags,
    pub terminated: bool,
}

#[derive(Default)]
pub struct SimulatedProvisioner {
    units: Mutex<HashMap<ComputeUnitId, SimulatedUnit>>,
    next_unit: AtomicUsize,
    create_calls: AtomicUsize,
    terminate_calls: AtomicUsize,
    failing_creates: AtomicU32,
    failing_terminates: AtomicU32,
    reject_creates: AtomicBool,
    terminates_always_fail: AtomicBool,
    create_latency: Mutex<Option<Duration>>,
    autopilot: Option<Autopilot>,
}

impl SimulatedProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_autopilot(mut self, autopilot: Autopilot) -> Self {
        self.autopilot = Some(autopilot);
        self
    }

    pub fn with_create_latency(self, latency: Duration) -> Self {
        if let Ok(mut slot) = self.create_latency.lock() {
            *slot = Some(latency);
        }
        self
    }

    /// The next `n` creates fail with `Unavailable`.
    pub fn fail_next_creates(&self, n: u32) {
        self.failing_creates.store(n, Ordering::SeqCst);
    }

    pub fn reject_creates(&self, reject: bool) {
        self.reject_creates.store(reject, Ordering::SeqCst);
    }

    /// The next `n` terminates fail with `Unavailable`.
    pub fn fail_next_terminates(&self, n: u32) {
        self.failing_terminates.store(n, Ordering::SeqCst);
    }

    pub fn fail_all_terminates(&self, fail: bool) {
        self.terminates_always_fail.store(fail, Ordering::SeqCst);
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn terminate_calls(&self) -> usize {
        self.terminate_calls.load(Ordering::SeqCst)
    }

    pub fn units(&self) -> Vec<SimulatedUnit> {
        self.units
            .lock()
            .map(|units| units.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Units created and not yet terminated.
    pub fn live_units(&self) -> Vec<SimulatedUnit> {
        self.units()
            .into_iter()
            .filter(|unit| !unit.terminated)
            .collect()
    }

    pub fn is_live(&self, id: &ComputeUnitId) -> bool {
        self.units
            .lock()
            .map(|units| units.get(id).is_some_and(|u| !u.terminated))
            .unwrap_or(false)
    }

    fn take_fault(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Provisioner for SimulatedProvisioner {
    async fn create(&self, tags: &UnitTags) -> Result<ComputeUnitHandle, ProvisionerError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);

        let latency = self.create_latency.lock().ok().and_then(|slot| *slot);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if Self::take_fault(&self.failing_creates) {
            return Err(ProvisionerError::Unavailable(
                "simulated capacity shortage".to_string(),
            ));
        }
        if self.reject_creates.load(Ordering::SeqCst) {
            return Err(ProvisionerError::Rejected("simulated quota exceeded".to_string()));
        }

        let n = self.next_unit.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = ComputeUnitHandle::new(ComputeUnitId::new(format!("sim-{n}")), tags.job_id());

        self.units
            .lock()
            .map_err(|_| ProvisionerError::Unavailable("simulator lock poisoned".to_string()))?
            .insert(
                handle.id.clone(),
                SimulatedUnit {
                    handle: handle.clone(),
                    tags: tags.clone(),
                    terminated: false,
                },
            );

        debug!(compute_unit = %handle.id, job_id = %handle.job_id, "simulated unit created");

        if let Some(autopilot) = self.autopilot.clone() {
            tokio::spawn(run_autopilot(autopilot, handle.clone(), tags.clone()));
        }

        Ok(handle)
    }

    async fn terminate(&self, unit: &ComputeUnitHandle) -> Result<(), ProvisionerError> {
        self.terminate_calls.fetch_add(1, Ordering::SeqCst);

        if self.terminates_always_fail.load(Ordering::SeqCst)
            || Self::take_fault(&self.failing_terminates)
        {
            return Err(ProvisionerError::Unavailable(
                "simulated control plane outage".to_string(),
            ));
        }

        let mut units = self
            .units
            .lock()
            .map_err(|_| ProvisionerError::Unavailable("simulator lock poisoned".to_string()))?;

        match units.get_mut(&unit.id) {
            Some(existing) if !existing.terminated => {
                existing.terminated = true;
                debug!(compute_unit = %unit.id, "simulated unit terminated");
                Ok(())
            }
            Some(_) => Err(ProvisionerError::AlreadyTerminated(unit.id.clone())),
            None => Err(ProvisionerError::Rejected(format!(
                "unknown compute unit {}",
                unit.id
            ))),
        }
    }
}

/// Output key for a processed input: `outputs/<job>/modified_<file name>`.
pub fn output_key(handle: &ComputeUnitHandle, input_key: &str) -> String {
    let file_name = input_key.rsplit('/').next().unwrap_or(input_key);
    format!("outputs/{}/modified_{}", handle.job_id, file_name)
}

/// Appends the input's character count, the way the sample workload does.
pub fn transform(input: &str) -> String {
    format!("{input} : {}", input.chars().count())
}

async fn run_autopilot(autopilot: Autopilot, handle: ComputeUnitHandle, tags: UnitTags) {
    tokio::time::sleep(autopilot.boot_time).await;
    if autopilot.send_ack {
        (autopilot.signals)(LifecycleEvent::provision_acked(
            handle.clone(),
            DeliveryToken::generate(),
        ));
    }

    tokio::time::sleep(autopilot.work_time).await;

    let outcome = match (tags.get(INPUT_KEY_TAG), &autopilot.objects) {
        (Some(key), Some(objects)) => match objects.get(key).await {
            Ok(input) => {
                let text = String::from_utf8_lossy(&input.bytes).into_owned();
                let out_key = output_key(&handle, key);
                objects
                    .put(&out_key, &input.content_type, transform(&text).into_bytes())
                    .await
                    .map_err(|e| e.to_string())
            }
            Err(e) => Err(e.to_string()),
        },
        _ => Ok(ObjectRef::inline(format!("processed by {}", handle.id))),
    };

    let token = DeliveryToken::generate();
    let event = match outcome {
        Ok(output) => {
            info!(compute_unit = %handle.id, job_id = %handle.job_id, "simulated work finished");
            LifecycleEvent::completion(handle, token).with_output(output)
        }
        Err(reason) => {
            warn!(compute_unit = %handle.id, job_id = %handle.job_id, %reason, "simulated work failed");
            LifecycleEvent::failure(handle, token, reason)
        }
    };
    (autopilot.signals)(event);
}
