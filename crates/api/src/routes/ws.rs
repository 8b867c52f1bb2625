//! WebSocket upgrade endpoint.

use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::StreamExt;

use relay_common::error::AppError;
use relay_notifier::Client;

use crate::middleware::auth::AuthUser;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(ws_upgrade))
}

/// GET /ws — Authenticate, then switch to a push-only WebSocket.
///
/// Authentication happens before the upgrade; a rejected request never
/// becomes a WebSocket and never touches the registry. There is no retry:
/// the client reconnects from scratch.
async fn ws_upgrade(
    State(state): State<AppState>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    auth: Result<AuthUser, AppError>,
) -> Result<Response, AppError> {
    let upgrade = upgrade.map_err(|rejection| {
        tracing::debug!(reason = %rejection, "Rejected non-upgrade request to /ws");
        AppError::UpgradeRequired
    })?;
    let auth = auth.inspect_err(|e| {
        tracing::warn!(error = %e, "WebSocket handshake rejected");
    })?;

    let client = Client::new(
        auth.user_id,
        state.settings.clone(),
        state.hub.clone(),
        state.bus.clone(),
        state.shutdown.clone(),
    );

    tracing::info!(
        user_id = %auth.user_id,
        connection_id = %client.connection_id(),
        source = ?auth.source,
        "WebSocket connection authenticated"
    );

    let connections = state.connections.clone();
    Ok(upgrade
        .max_message_size(state.config.ws_max_message_bytes)
        .on_failed_upgrade(|e| {
            tracing::warn!(error = %e, "WebSocket upgrade failed");
        })
        .on_upgrade(move |socket| {
            connections.track_future(async move {
                let (sink, stream) = socket.split();
                client.run(sink, stream).await;
            })
        }))
}
