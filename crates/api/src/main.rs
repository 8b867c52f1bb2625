//! Relay API server binary entrypoint.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use relay_common::config::{AppConfig, BusBackend};
use relay_notifier::{Hub, MemoryBus, MessageBus, RedisBus};

use relay_api::routes::create_router;
use relay_api::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("relay_api=debug,relay_notifier=debug,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting relay API server...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Connect the message bus
    let bus: Arc<dyn MessageBus> = match config.bus_backend {
        BusBackend::Redis => {
            Arc::new(RedisBus::connect(&config.redis_url, config.bus_buffer).await?)
        }
        BusBackend::Memory => {
            tracing::warn!(
                "Using in-memory bus; events published by other processes are not delivered"
            );
            Arc::new(MemoryBus::new(config.bus_buffer))
        }
    };

    // Start the connection registry
    let shutdown = CancellationToken::new();
    let (hub, mut hub_task) = Hub::spawn(config.hub_queue_capacity, shutdown.clone());

    // Build application state
    let state = AppState::new(config.clone(), hub, bus, shutdown.clone());
    let drain = state.clone();

    // Build router
    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!("API server listening on {}", config.bind_addr);

    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(server_shutdown.cancelled_owned())
            .await
    });

    // Run until Ctrl+C, or fail if the registry dies underneath us
    let registry_failed = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping gracefully...");
            false
        }
        result = &mut hub_task => {
            match result {
                Ok(()) => tracing::error!("Connection registry stopped unexpectedly"),
                Err(e) => tracing::error!(error = %e, "Connection registry panicked"),
            }
            true
        }
    };

    shutdown.cancel();
    server.await??;

    // Upgraded sockets outlive `axum::serve`; wait for their actors to close.
    if drain.drain_connections().await {
        tracing::info!("All connections closed");
    }
    if !registry_failed && let Err(e) = hub_task.await {
        tracing::warn!(error = %e, "Connection registry did not stop cleanly");
    }

    if registry_failed {
        anyhow::bail!("connection registry stopped unexpectedly");
    }

    tracing::info!("Relay API server stopped.");
    Ok(())
}
