//! Real-time notification delivery.
//!
//! - [`hub`]: single-owner registry of live connections per user
//! - [`client`]: per-connection actor with inbound and outbound loops
//! - [`bus`]: pub/sub bridge between producers and connections (Redis or in-memory)
//! - [`publisher`]: `publish(user_id, event)` for other subsystems

pub mod bus;
pub mod client;
pub mod hub;
pub mod publisher;
pub mod settings;

pub use bus::{BusError, BusSubscription, MemoryBus, MessageBus, RedisBus};
pub use client::{Client, CloseReason};
pub use hub::{Hub, HubError, HubHandle, HubStats};
pub use publisher::{PublishError, Publisher};
pub use settings::ConnectionSettings;
