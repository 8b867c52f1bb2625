//! Integration tests for the WebSocket endpoint.
//!
//! Runs the real router on a random local port with the in-memory bus and
//! talks to it with `tokio-tungstenite` clients. Plain HTTP routes go
//! through `tower::ServiceExt` without a listener.
//!
//! ```bash
//! cargo test -p relay-api --test integration -- --nocapture
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use uuid::Uuid;

use relay_api::middleware::auth::{TokenValidator, encode_jwt};
use relay_api::routes::create_router;
use relay_api::state::AppState;
use relay_common::config::{AppConfig, BusBackend};
use relay_common::error::AppError;
use relay_common::types::{Envelope, EnvelopeType, UserId, notification_channel};
use relay_notifier::{Hub, HubStats, MemoryBus, MessageBus};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ============================================================
// Helpers
// ============================================================

/// Create a test AppConfig with a specific JWT secret.
fn test_config() -> AppConfig {
    AppConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        bus_backend: BusBackend::Memory,
        redis_url: "redis://unused".to_string(),
        jwt_secret: "test-jwt-secret-for-integration-tests".to_string(),
        jwt_expiry_hours: 24,
        ws_heartbeat_interval_secs: 30,
        ws_liveness_timeout_secs: 60,
        ws_write_timeout_secs: 5,
        ws_mailbox_capacity: 32,
        ws_max_message_bytes: 4096,
        bus_buffer: 32,
        hub_queue_capacity: 64,
    }
}

/// Build an AppState backed by the in-memory bus and a fresh registry.
fn build_test_state() -> AppState {
    build_test_state_with_bus().0
}

/// Same as `build_test_state`, keeping a handle on the in-memory bus.
fn build_test_state_with_bus() -> (AppState, MemoryBus) {
    let config = test_config();
    let shutdown = CancellationToken::new();
    let bus = MemoryBus::new(config.bus_buffer);
    let shared: Arc<dyn MessageBus> = Arc::new(bus.clone());
    let (hub, _task) = Hub::spawn(config.hub_queue_capacity, shutdown.clone());
    (AppState::new(config, hub, shared, shutdown), bus)
}

/// Serve the router on a random port and return its address.
async fn start_server(state: AppState) -> SocketAddr {
    let app = create_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

fn token_for(user_id: UserId) -> String {
    let config = test_config();
    encode_jwt(user_id, &config.jwt_secret, config.jwt_expiry_hours).unwrap()
}

/// Connect with a bearer header and consume the `connected` acknowledgment.
async fn connect_as(addr: SocketAddr, user_id: UserId) -> WsClient {
    let mut request = format!("ws://{}/ws", addr).into_client_request().unwrap();
    request.headers_mut().insert(
        "authorization",
        format!("Bearer {}", token_for(user_id)).parse().unwrap(),
    );
    let (mut ws, _) = connect_async(request).await.unwrap();

    let ack = next_envelope(&mut ws).await;
    assert_eq!(ack.kind, EnvelopeType::Connected);
    assert_eq!(ack.payload["user_id"], user_id.to_string());
    ws
}

/// Next text frame as an envelope, skipping control frames.
async fn next_envelope(ws: &mut WsClient) -> Envelope {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(3), ws.next())
            .await
            .expect("timed out waiting for envelope")
            .expect("connection closed")
            .expect("websocket error");
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Assert no text frame arrives within `window`.
async fn expect_silence(ws: &mut WsClient, window: Duration) {
    let result = tokio::time::timeout(window, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return text.to_string(),
                Some(Ok(_)) => continue,
                _ => futures::future::pending::<()>().await,
            }
        }
    })
    .await;
    assert!(result.is_err(), "unexpected frame: {:?}", result);
}

/// Poll the registry until `user_id` has `expected` connections.
async fn wait_for_connections(state: &AppState, user_id: UserId, expected: usize) {
    for _ in 0..100 {
        if state.hub.connection_count(user_id).await.unwrap() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("user {} never reached {} connections", user_id, expected);
}

type HandshakeResult =
    Result<(WsClient, tungstenite::handshake::client::Response), tungstenite::Error>;

fn rejection_status(result: HandshakeResult) -> u16 {
    match result {
        Err(tungstenite::Error::Http(response)) => response.status().as_u16(),
        Err(e) => panic!("expected HTTP rejection, got {}", e),
        Ok(_) => panic!("expected HTTP rejection, got an upgraded connection"),
    }
}

/// Validator backed by a fixed token table.
struct StaticValidator(HashMap<String, UserId>);

impl TokenValidator for StaticValidator {
    fn validate(&self, token: &str) -> Result<UserId, AppError> {
        self.0
            .get(token)
            .copied()
            .ok_or_else(|| AppError::InvalidCredential("unknown token".to_string()))
    }
}

// ============================================================
// Delivery
// ============================================================

#[tokio::test]
async fn test_publish_reaches_every_device_of_user_only() {
    let state = build_test_state();
    let addr = start_server(state.clone()).await;
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    let mut device1 = connect_as(addr, alice).await;
    let mut device2 = connect_as(addr, alice).await;
    let mut bob_device = connect_as(addr, bob).await;
    assert_eq!(state.hub.connection_count(alice).await.unwrap(), 2);

    state
        .publisher
        .publish(alice, &serde_json::json!({ "type": "like", "post": "p1" }))
        .await
        .unwrap();

    for ws in [&mut device1, &mut device2] {
        let envelope = next_envelope(ws).await;
        assert_eq!(envelope.kind, EnvelopeType::Notification);
        assert_eq!(envelope.payload["type"], "like");
        assert_eq!(envelope.payload["post"], "p1");
    }
    expect_silence(&mut bob_device, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_events_arrive_in_publish_order() {
    let state = build_test_state();
    let addr = start_server(state.clone()).await;
    let user = Uuid::new_v4();
    let mut ws = connect_as(addr, user).await;

    for n in 1..=3 {
        state
            .publisher
            .publish(user, &serde_json::json!({ "type": "reply", "seq": n }))
            .await
            .unwrap();
    }

    for n in 1..=3 {
        assert_eq!(next_envelope(&mut ws).await.payload["seq"], n);
    }
}

#[tokio::test]
async fn test_closing_one_device_keeps_the_other() {
    let state = build_test_state();
    let addr = start_server(state.clone()).await;
    let alice = Uuid::new_v4();

    let mut device1 = connect_as(addr, alice).await;
    let mut device2 = connect_as(addr, alice).await;

    device1.close(None).await.unwrap();
    wait_for_connections(&state, alice, 1).await;

    state
        .publisher
        .publish(alice, &serde_json::json!({ "type": "follow", "from": "bob" }))
        .await
        .unwrap();

    let envelope = next_envelope(&mut device2).await;
    assert_eq!(envelope.payload["type"], "follow");
}

#[tokio::test]
async fn test_client_messages_are_ignored() {
    let state = build_test_state();
    let addr = start_server(state.clone()).await;
    let user = Uuid::new_v4();
    let mut ws = connect_as(addr, user).await;

    use futures::SinkExt;
    ws.send(Message::Text("garbage".into())).await.unwrap();
    ws.send(Message::Text(r#"{"type":"ack"}"#.into())).await.unwrap();

    state
        .publisher
        .publish(user, &serde_json::json!({ "type": "payment_confirmed" }))
        .await
        .unwrap();
    assert_eq!(
        next_envelope(&mut ws).await.payload["type"],
        "payment_confirmed"
    );
    assert_eq!(state.hub.connection_count(user).await.unwrap(), 1);
}

// ============================================================
// Handshake
// ============================================================

#[tokio::test]
async fn test_missing_credential_rejected_before_registration() {
    let state = build_test_state();
    let addr = start_server(state.clone()).await;
    let before = state.hub.stats().await.unwrap();

    let request = format!("ws://{}/ws", addr).into_client_request().unwrap();
    assert_eq!(rejection_status(connect_async(request).await), 401);

    assert_eq!(state.hub.stats().await.unwrap(), before);
    assert_eq!(before, HubStats::default());
}

#[tokio::test]
async fn test_invalid_credential_rejected() {
    let state = build_test_state();
    let addr = start_server(state.clone()).await;

    let mut request = format!("ws://{}/ws", addr).into_client_request().unwrap();
    request
        .headers_mut()
        .insert("authorization", "Bearer not.a.jwt".parse().unwrap());
    assert_eq!(rejection_status(connect_async(request).await), 401);

    let wrong_secret = encode_jwt(Uuid::new_v4(), "another-secret", 1).unwrap();
    let request = format!("ws://{}/ws?token={}", addr, wrong_secret)
        .into_client_request()
        .unwrap();
    assert_eq!(rejection_status(connect_async(request).await), 401);
    assert_eq!(state.hub.stats().await.unwrap(), HubStats::default());
}

#[tokio::test]
async fn test_cookie_and_query_credentials_accepted() {
    let state = build_test_state();
    let addr = start_server(state.clone()).await;
    let user = Uuid::new_v4();

    let mut request = format!("ws://{}/ws", addr).into_client_request().unwrap();
    request.headers_mut().insert(
        "cookie",
        format!("access_token={}", token_for(user)).parse().unwrap(),
    );
    let (mut by_cookie, _) = connect_async(request).await.unwrap();
    assert_eq!(next_envelope(&mut by_cookie).await.kind, EnvelopeType::Connected);

    let request = format!("ws://{}/ws?token={}", addr, token_for(user))
        .into_client_request()
        .unwrap();
    let (mut by_query, _) = connect_async(request).await.unwrap();
    assert_eq!(next_envelope(&mut by_query).await.kind, EnvelopeType::Connected);

    assert_eq!(state.hub.connection_count(user).await.unwrap(), 2);
}

#[tokio::test]
async fn test_custom_validator_is_consulted() {
    let user = Uuid::new_v4();
    let validator = StaticValidator(HashMap::from([("opaque-token".to_string(), user)]));
    let state = build_test_state().with_validator(Arc::new(validator));
    let addr = start_server(state.clone()).await;

    let mut request = format!("ws://{}/ws", addr).into_client_request().unwrap();
    request
        .headers_mut()
        .insert("authorization", "Bearer opaque-token".parse().unwrap());
    let (mut ws, _) = connect_async(request).await.unwrap();

    let ack = next_envelope(&mut ws).await;
    assert_eq!(ack.payload["user_id"], user.to_string());
}

#[tokio::test]
async fn test_non_upgrade_request_gets_upgrade_required() {
    let state = build_test_state();
    let app = create_router(state.clone());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/ws")
                .header("authorization", format!("Bearer {}", token_for(Uuid::new_v4())))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UPGRADE_REQUIRED);
    assert_eq!(state.hub.stats().await.unwrap(), HubStats::default());
}

// ============================================================
// Lifecycle
// ============================================================

#[tokio::test]
async fn test_health_reports_registry_counts() {
    let state = build_test_state();
    let addr = start_server(state.clone()).await;
    let _ws = connect_as(addr, Uuid::new_v4()).await;

    let response = create_router(state)
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["service"], "relay-api");
    assert_eq!(json["connections"], 1);
    assert_eq!(json["users"], 1);
}

#[tokio::test]
async fn test_shutdown_closes_open_connections() {
    let state = build_test_state();
    let addr = start_server(state.clone()).await;
    let mut ws = connect_as(addr, Uuid::new_v4()).await;

    state.shutdown.cancel();

    let close = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(frame))) => return frame,
                Some(Ok(_)) => continue,
                _ => return None,
            }
        }
    })
    .await
    .expect("connection was not closed");
    let frame = close.expect("expected a close frame");
    assert_eq!(u16::from(frame.code), 1001);
}

#[tokio::test]
async fn test_drain_waits_for_actor_teardown() {
    let (state, bus) = build_test_state_with_bus();
    let addr = start_server(state.clone()).await;
    let user = Uuid::new_v4();
    let channel = notification_channel(user);
    let _ws = connect_as(addr, user).await;

    assert_eq!(state.connections.len(), 1);
    assert_eq!(bus.subscriber_count(&channel).await, 1);

    state.shutdown.cancel();
    assert!(state.drain_connections().await);

    assert!(state.connections.is_empty());
    assert_eq!(bus.subscriber_count(&channel).await, 0);
}
