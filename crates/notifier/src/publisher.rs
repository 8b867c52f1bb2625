//! Entry point other subsystems use to notify a user.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use relay_common::error::AppError;
use relay_common::types::{UserId, notification_channel};

use crate::bus::{BusError, MessageBus};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    Bus(#[from] BusError),
}

impl From<PublishError> for AppError {
    fn from(err: PublishError) -> Self {
        match err {
            PublishError::Serialize(e) => AppError::Serialization(e),
            PublishError::Bus(e) => e.into(),
        }
    }
}

/// Fire-and-forget fan-out to a user's live connections.
///
/// Delivery is at most once: whoever is connected when the bus delivers the
/// message receives it, and nothing is kept for offline devices.
#[derive(Clone)]
pub struct Publisher {
    bus: Arc<dyn MessageBus>,
}

impl Publisher {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self { bus }
    }

    pub async fn publish<T>(&self, user_id: UserId, event: &T) -> Result<(), PublishError>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(event)?;
        let channel = notification_channel(user_id);
        self.bus.publish(&channel, payload).await?;

        tracing::debug!(user_id = %user_id, channel = %channel, "Notification published");
        Ok(())
    }
}
