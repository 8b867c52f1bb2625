//! Shared application state for the Axum API server.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use relay_common::config::AppConfig;
use relay_notifier::{ConnectionSettings, HubHandle, MessageBus, Publisher};

use crate::middleware::auth::{JwtValidator, TokenValidator};

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub bus: Arc<dyn MessageBus>,
    pub publisher: Publisher,
    pub validator: Arc<dyn TokenValidator>,
    pub settings: ConnectionSettings,
    pub config: AppConfig,
    /// Process-wide shutdown signal observed by every connection actor.
    pub shutdown: CancellationToken,
    /// Connection actors still running, upgraded sockets included.
    pub connections: TaskTracker,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        hub: HubHandle,
        bus: Arc<dyn MessageBus>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            hub,
            publisher: Publisher::new(bus.clone()),
            bus,
            validator: Arc::new(JwtValidator::new(config.jwt_secret.clone())),
            settings: ConnectionSettings::from_config(&config),
            config,
            shutdown,
            connections: TaskTracker::new(),
        }
    }

    /// Swap the credential validator, e.g. for an external auth service.
    pub fn with_validator(mut self, validator: Arc<dyn TokenValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Stop accepting new actors and wait for running ones to finish teardown.
    ///
    /// Teardown has four steps each bounded by the write timeout, plus the
    /// final write in flight. Returns `false` if actors were still running
    /// at the deadline.
    pub async fn drain_connections(&self) -> bool {
        self.connections.close();
        let deadline = self.settings.write_timeout * 5;
        match tokio::time::timeout(deadline, self.connections.wait()).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(
                    remaining = self.connections.len(),
                    deadline = ?deadline,
                    "Connection actors still running after shutdown deadline"
                );
                false
            }
        }
    }
}
