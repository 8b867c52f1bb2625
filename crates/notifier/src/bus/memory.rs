//! In-process bus for single-node deployments and tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use super::{BusError, BusSubscription, MessageBus};

/// In-memory pub/sub keyed by channel name.
#[derive(Debug, Clone)]
pub struct MemoryBus {
    /// Channel → buffered senders of every live subscription.
    topics: Arc<Mutex<HashMap<String, Vec<mpsc::Sender<Vec<u8>>>>>>,
    /// Buffer size for each subscription.
    buffer_size: usize,
}

impl MemoryBus {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            buffer_size: buffer_size.max(1),
        }
    }

    /// Number of live subscriptions on `channel`.
    pub async fn subscriber_count(&self, channel: &str) -> usize {
        let topics = self.topics.lock().await;
        topics
            .get(channel)
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn subscribe(&self, channel: &str) -> Result<BusSubscription, BusError> {
        let (tx, rx) = mpsc::channel(self.buffer_size);
        {
            let mut topics = self.topics.lock().await;
            let subs = topics.entry(channel.to_string()).or_default();
            subs.retain(|tx| !tx.is_closed());
            subs.push(tx.clone());
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(release_on_cancel(
            self.topics.clone(),
            channel.to_string(),
            tx,
            cancel.clone(),
        ));

        Ok(BusSubscription::new(
            channel.to_string(),
            rx,
            cancel,
            Some(task),
        ))
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let mut topics = self.topics.lock().await;
        let Some(subs) = topics.get_mut(channel) else {
            return Ok(());
        };

        subs.retain(|tx| !tx.is_closed());
        for tx in subs.iter() {
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(payload.clone()) {
                tracing::warn!(channel = %channel, "Subscription buffer full, message dropped");
            }
        }
        if subs.is_empty() {
            topics.remove(channel);
        }
        Ok(())
    }
}

/// Remove the subscription's sender once it is cancelled, dropping the
/// topic when no subscribers remain.
async fn release_on_cancel(
    topics: Arc<Mutex<HashMap<String, Vec<mpsc::Sender<Vec<u8>>>>>>,
    channel: String,
    tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
) {
    cancel.cancelled().await;

    let mut topics = topics.lock().await;
    if let Some(subs) = topics.get_mut(&channel) {
        subs.retain(|sub| !sub.same_channel(&tx) && !sub.is_closed());
        if subs.is_empty() {
            topics.remove(&channel);
        }
    }
}
