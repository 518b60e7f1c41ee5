//! Event publishing/subscription abstraction (mechanics only).
//!
//! The bus makes minimal assumptions:
//!
//! - **Transport-agnostic**: in-memory channels, Redis Streams, queues, ...
//! - **At-least-once delivery**: messages may be delivered multiple times
//! - **No ordering guarantees**: redeliveries may overtake newer messages
//! - **No persistence**: the job store is the source of truth, not the bus

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

/// The bus behind a subscription was dropped.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("subscription closed")]
pub struct SubscriptionClosed;

/// A subscription to a message stream.
///
/// Each subscription gets a copy of every message published after it was
/// created (broadcast semantics).
///
/// ```ignore
/// let mut subscription = bus.subscribe();
/// while let Some(delivery) = subscription.recv().await {
///     orchestrator.ingest(delivery.into_payload()).await?;
/// }
/// ```
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: mpsc::UnboundedReceiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: mpsc::UnboundedReceiver<M>) -> Self {
        Self { receiver }
    }

    /// Wait for the next message; `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<M> {
        self.receiver.recv().await
    }

    /// Try to receive a message without waiting.
    pub fn try_recv(&mut self) -> Result<M, mpsc::error::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Wait up to `timeout`; `Ok(None)` on timeout.
    pub async fn recv_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<M>, SubscriptionClosed> {
        match tokio::time::timeout(timeout, self.receiver.recv()).await {
            Ok(Some(message)) => Ok(Some(message)),
            Ok(None) => Err(SubscriptionClosed),
            Err(_) => Ok(None),
        }
    }
}

/// Transport-agnostic pub/sub for lifecycle deliveries.
///
/// `publish()` can fail (bus full, network error). Publishing again is always
/// safe because consumers dedupe.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
