//! Redis-backed bus. Each subscription owns a dedicated pub/sub connection.

use async_trait::async_trait;
use futures::StreamExt;
use ::redis::AsyncCommands;
use ::redis::Client;
use ::redis::aio::{ConnectionManager, PubSub};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use relay_common::redis_pool::create_redis_pool;

use super::{BusError, BusSubscription, MessageBus};

#[derive(Clone)]
pub struct RedisBus {
    client: Client,
    publisher: ConnectionManager,
    buffer_size: usize,
}

impl RedisBus {
    pub async fn connect(redis_url: &str, buffer_size: usize) -> anyhow::Result<Self> {
        let (client, publisher) = create_redis_pool(redis_url).await?;
        Ok(Self {
            client,
            publisher,
            buffer_size: buffer_size.max(1),
        })
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn subscribe(&self, channel: &str) -> Result<BusSubscription, BusError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::channel(self.buffer_size);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(forward(pubsub, tx, cancel.clone(), channel.to_string()));

        tracing::debug!(channel = %channel, "Redis subscription opened");
        Ok(BusSubscription::new(
            channel.to_string(),
            rx,
            cancel,
            Some(task),
        ))
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let mut conn = self.publisher.clone();
        let receivers: i64 = conn.publish(channel, payload).await?;
        tracing::debug!(channel = %channel, receivers, "Published to Redis");
        Ok(())
    }
}

/// Pump messages from the pub/sub connection into the subscription buffer
/// until cancelled. Dropping the connection on exit unsubscribes.
async fn forward(
    pubsub: PubSub,
    tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
    channel: String,
) {
    let messages = pubsub.into_on_message();
    tokio::pin!(messages);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = messages.next() => {
                let Some(msg) = msg else {
                    tracing::warn!(channel = %channel, "Redis message stream ended");
                    break;
                };
                match tx.try_send(msg.get_payload_bytes().to_vec()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(channel = %channel, "Subscription buffer full, message dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
        }
    }
}
