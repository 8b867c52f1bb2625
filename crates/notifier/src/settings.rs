use std::time::Duration;

use relay_common::config::AppConfig;

/// Default heartbeat period.
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default rolling read deadline.
const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(60);

/// Default per-write deadline.
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_MAILBOX_CAPACITY: usize = 256;

/// Tuning knobs for a single connection actor.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// How often the outbound loop sends a ping.
    pub heartbeat_interval: Duration,
    /// Time allowed between received frames before the peer is considered dead.
    pub liveness_timeout: Duration,
    /// Deadline for a single write, also bounds each teardown step.
    pub write_timeout: Duration,
    /// Capacity of the outbound mailbox.
    pub mailbox_capacity: usize,
}

impl ConnectionSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(config.ws_heartbeat_interval_secs),
            liveness_timeout: Duration::from_secs(config.ws_liveness_timeout_secs),
            write_timeout: Duration::from_secs(config.ws_write_timeout_secs),
            mailbox_capacity: config.ws_mailbox_capacity.max(1),
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
        }
    }
}
