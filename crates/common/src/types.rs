use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Authenticated user identifier attached to a connection.
pub type UserId = Uuid;

/// Per-connection identifier, unique for the lifetime of the process.
pub type ConnectionId = Uuid;

/// Prefix of the per-user bus channel.
pub const NOTIFICATION_CHANNEL_PREFIX: &str = "notifications:";

/// Bus channel carrying events for one user (`notifications:<user_id>`).
pub fn notification_channel(user_id: UserId) -> String {
    format!("{}{}", NOTIFICATION_CHANNEL_PREFIX, user_id)
}

/// Envelope kinds sent to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeType {
    /// Sent once right after the connection is registered.
    Connected,
    /// Wraps a domain event forwarded from the bus.
    Notification,
}

impl std::fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvelopeType::Connected => write!(f, "connected"),
            EnvelopeType::Notification => write!(f, "notification"),
        }
    }
}

/// Wire message written to clients: `{"type": ..., "payload": ...}`.
///
/// Envelopes are immutable once queued; every one serializes to a
/// self-contained JSON text frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    pub payload: serde_json::Value,
}

/// Payload of the `connected` acknowledgment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedPayload {
    pub user_id: UserId,
    pub connection_id: ConnectionId,
}

impl Envelope {
    pub fn connected(user_id: UserId, connection_id: ConnectionId) -> Self {
        Self {
            kind: EnvelopeType::Connected,
            payload: serde_json::json!({
                "user_id": user_id,
                "connection_id": connection_id,
            }),
        }
    }

    pub fn notification(event: serde_json::Value) -> Self {
        Self {
            kind: EnvelopeType::Notification,
            payload: event,
        }
    }

    /// Serialize into the JSON text sent over the wire.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
