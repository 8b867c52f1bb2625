//! Relay API server: WebSocket upgrade endpoint and health check.
//!
//! Endpoints:
//! - GET /ws     — Authenticate, then upgrade to a push-only WebSocket
//! - GET /health — Liveness plus registry occupancy

pub mod middleware;
pub mod routes;
pub mod state;
