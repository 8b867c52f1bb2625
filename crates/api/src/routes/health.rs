//! Health check endpoint.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use relay_common::error::AppError;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

/// GET /health — Service status plus live registry counts.
async fn health_check(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let stats = state.hub.stats().await?;
    Ok(Json(json!({
        "status": "ok",
        "service": "relay-api",
        "version": env!("CARGO_PKG_VERSION"),
        "users": stats.users,
        "connections": stats.connections
    })))
}
