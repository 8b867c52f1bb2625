use std::net::SocketAddr;

use serde::Deserialize;

/// Which message bus backend the process talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusBackend {
    /// External Redis pub/sub (multi-process deployments).
    Redis,
    /// In-process bus (single-node deployments and tests).
    Memory,
}

impl std::str::FromStr for BusBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "redis" => Ok(BusBackend::Redis),
            "memory" => Ok(BusBackend::Memory),
            other => Err(anyhow::anyhow!(
                "BUS_BACKEND must be 'redis' or 'memory', got '{}'",
                other
            )),
        }
    }
}

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Address the HTTP server binds to
    pub bind_addr: SocketAddr,

    /// Message bus backend
    pub bus_backend: BusBackend,

    /// Redis connection string
    pub redis_url: String,

    /// JWT secret for access token validation
    pub jwt_secret: String,

    /// JWT token expiry in hours
    pub jwt_expiry_hours: u64,

    /// Heartbeat (ping) period in seconds (default: 30)
    pub ws_heartbeat_interval_secs: u64,

    /// Rolling read deadline in seconds; must exceed the heartbeat interval (default: 60)
    pub ws_liveness_timeout_secs: u64,

    /// Per-write deadline in seconds (default: 10)
    pub ws_write_timeout_secs: u64,

    /// Bounded outbound mailbox size per connection (default: 256)
    pub ws_mailbox_capacity: usize,

    /// Largest inbound frame accepted from a client (default: 4096)
    pub ws_max_message_bytes: usize,

    /// Per-subscription buffer between the bus and a connection (default: 64)
    pub bus_buffer: usize,

    /// Capacity of each registry inbound channel (default: 1024)
    pub hub_queue_capacity: usize,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            bind_addr: parse_var("BIND_ADDR", "0.0.0.0:3000")?,
            bus_backend: parse_var("BUS_BACKEND", "redis")?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            jwt_secret: std::env::var("JWT_SECRET")
                .map_err(|_| anyhow::anyhow!("JWT_SECRET environment variable is required"))?,
            jwt_expiry_hours: parse_var("JWT_EXPIRY_HOURS", "24")?,
            ws_heartbeat_interval_secs: parse_var("WS_HEARTBEAT_INTERVAL_SECS", "30")?,
            ws_liveness_timeout_secs: parse_var("WS_LIVENESS_TIMEOUT_SECS", "60")?,
            ws_write_timeout_secs: parse_var("WS_WRITE_TIMEOUT_SECS", "10")?,
            ws_mailbox_capacity: parse_var("WS_MAILBOX_CAPACITY", "256")?,
            ws_max_message_bytes: parse_var("WS_MAX_MESSAGE_BYTES", "4096")?,
            bus_buffer: parse_var("BUS_BUFFER", "64")?,
            hub_queue_capacity: parse_var("HUB_QUEUE_CAPACITY", "1024")?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that would make every healthy connection time out.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ws_heartbeat_interval_secs == 0 {
            anyhow::bail!("WS_HEARTBEAT_INTERVAL_SECS must be greater than zero");
        }
        if self.ws_liveness_timeout_secs <= self.ws_heartbeat_interval_secs {
            anyhow::bail!(
                "WS_LIVENESS_TIMEOUT_SECS ({}) must be greater than WS_HEARTBEAT_INTERVAL_SECS ({})",
                self.ws_liveness_timeout_secs,
                self.ws_heartbeat_interval_secs
            );
        }
        if self.ws_mailbox_capacity == 0 || self.bus_buffer == 0 || self.hub_queue_capacity == 0 {
            anyhow::bail!("queue capacities must be greater than zero");
        }
        Ok(())
    }
}

fn parse_var<T>(name: &str, default: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
{
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| anyhow::anyhow!("{} has an invalid value", name))
}
