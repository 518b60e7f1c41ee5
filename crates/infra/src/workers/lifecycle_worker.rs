use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use warden_core::LifecycleEvent;
use warden_events::{Delivery, EventBus, Subscription};

use crate::orchestrator::LifecycleHandler;

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for in-flight deliveries to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

/// Feeds lifecycle deliveries from a bus into a handler.
///
/// - every delivery runs as its own task, so one slow job does not hold up others
/// - the handler must tolerate redelivery (at-least-once)
/// - shutdown drains in-flight deliveries before returning
#[derive(Debug)]
pub struct LifecycleWorker;

impl LifecycleWorker {
    pub fn spawn<B, H>(name: &'static str, bus: &B, handler: Arc<H>) -> WorkerHandle
    where
        B: EventBus<Delivery<LifecycleEvent>>,
        H: LifecycleHandler + ?Sized,
    {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let sub = bus.subscribe();

        let join = tokio::spawn(worker_loop(name, sub, shutdown_rx, handler));

        WorkerHandle {
            shutdown: Some(shutdown_tx),
            join: Some(join),
        }
    }
}

async fn worker_loop<H>(
    name: &'static str,
    mut sub: Subscription<Delivery<LifecycleEvent>>,
    mut shutdown_rx: oneshot::Receiver<()>,
    handler: Arc<H>,
) where
    H: LifecycleHandler + ?Sized,
{
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            delivery = sub.recv() => {
                let Some(delivery) = delivery else { break };
                let handler = handler.clone();
                in_flight.spawn(handle_delivery(name, delivery, handler));
            }
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
        }
    }

    while in_flight.join_next().await.is_some() {}
    info!(worker = name, "lifecycle worker stopped");
}

async fn handle_delivery<H>(name: &'static str, delivery: Delivery<LifecycleEvent>, handler: Arc<H>)
where
    H: LifecycleHandler + ?Sized,
{
    let message_id = delivery.message_id().to_string();
    let attempt = delivery.attempt();

    match handler.handle(delivery.into_payload()).await {
        Ok(outcome) => {
            debug!(
                worker = name,
                message_id = %message_id,
                attempt,
                outcome = outcome.as_str(),
                "lifecycle delivery handled"
            );
        }
        Err(err) => {
            warn!(
                worker = name,
                message_id = %message_id,
                attempt,
                error = %err,
                "lifecycle delivery failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use warden_core::JobId;
    use warden_events::InMemoryEventBus;

    use super::*;
    use crate::error::OrchestratorError;
    use crate::orchestrator::IngestOutcome;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<JobId>>,
    }

    #[async_trait]
    impl LifecycleHandler for Recording {
        async fn handle(&self, event: LifecycleEvent) -> Result<IngestOutcome, OrchestratorError> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.seen.lock().unwrap().push(event.job_id);
            Ok(IngestOutcome::Duplicate {
                job_id: event.job_id,
            })
        }
    }

    #[tokio::test]
    async fn shutdown_drains_in_flight_deliveries() {
        let bus = InMemoryEventBus::<Delivery<LifecycleEvent>>::new();
        let handler = Arc::new(Recording::default());
        let worker = LifecycleWorker::spawn("test-lifecycle", &bus, handler.clone());

        let ids: Vec<JobId> = (0..3).map(|_| JobId::new()).collect();
        for (i, id) in ids.iter().enumerate() {
            bus.publish(Delivery::new(
                format!("m-{i}"),
                Utc::now(),
                LifecycleEvent::provision_requested(*id),
            ))
            .unwrap();
        }

        // Let the worker pick the deliveries up before asking it to stop.
        tokio::time::sleep(Duration::from_millis(50)).await;
        worker.shutdown().await;

        let mut seen = handler.seen.lock().unwrap().clone();
        seen.sort();
        let mut expected = ids.clone();
        expected.sort();
        assert_eq!(seen, expected);
    }
}
