//! Publish/subscribe bus abstraction.
//!
//! Producers publish serialized events to `notifications:<user_id>`; every
//! connection actor holds exactly one subscription to its user's channel.
//! Two backends are provided: Redis for multi-process deployments and an
//! in-memory bus for single-node runs and tests.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use relay_common::error::AppError;

pub mod memory;
pub mod redis;

pub use memory::MemoryBus;
pub use self::redis::RedisBus;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("redis: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("bus is closed")]
    Closed,
}

impl From<BusError> for AppError {
    fn from(err: BusError) -> Self {
        AppError::Bus(err.to_string())
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Open a subscription to `channel`.
    async fn subscribe(&self, channel: &str) -> Result<BusSubscription, BusError>;

    /// Publish `payload` to every current subscriber of `channel`.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BusError>;
}

/// A live subscription owned by one connection actor.
///
/// Messages arrive through a bounded buffer; when the buffer is full the
/// backend drops the message for this subscriber instead of blocking.
/// Dropping the subscription releases it.
pub struct BusSubscription {
    channel: String,
    rx: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl BusSubscription {
    pub(crate) fn new(
        channel: String,
        rx: mpsc::Receiver<Vec<u8>>,
        cancel: CancellationToken,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            channel,
            rx,
            cancel,
            task,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next payload, or `None` once the backend has closed the subscription.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Tear the subscription down and wait for its forwarder to exit.
    pub async fn close(mut self) {
        self.cancel.cancel();
        self.rx.close();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            tracing::warn!(channel = %self.channel, error = %e, "Bus forwarder task failed");
        }
        tracing::debug!(channel = %self.channel, "Bus subscription closed");
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for BusSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusSubscription")
            .field("channel", &self.channel)
            .finish()
    }
}
