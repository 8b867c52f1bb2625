//! Connection actor ("client").
//!
//! One actor per WebSocket. It registers with the hub, subscribes to the
//! user's bus channel, then runs two loops until either ends:
//! - the write loop, a spawned task owning the sink, the mailbox and the
//!   bus subscription, which multiplexes mailbox items, bus events and
//!   heartbeat pings onto the socket;
//! - the read loop, which watches inbound frames under a rolling liveness
//!   deadline.
//!
//! Teardown then closes the subscription, the mailbox, the hub entry and the
//! socket, in that order, each step bounded by the write timeout.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, close_code};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use relay_common::types::{ConnectionId, Envelope, UserId, notification_channel};

use crate::bus::{BusSubscription, MessageBus};
use crate::hub::{ClientHandle, HubHandle};
use crate::settings::ConnectionSettings;

/// Lifecycle of an actor. Handshaking happens before construction, so a
/// new actor starts `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Active,
    Closing,
    Closed,
}

/// Why a connection left the `Active` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client sent a close frame or the stream ended.
    PeerClosed,
    ReadError,
    /// No frame arrived within the liveness timeout.
    LivenessTimeout,
    WriteError,
    WriteTimeout,
    /// The hub dropped this connection and closed its mailbox.
    Evicted,
    /// The bus ended the subscription.
    BusClosed,
    /// Registration or subscription could not be set up.
    SetupFailed,
    Shutdown,
}

impl Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CloseReason::PeerClosed => "peer_closed",
            CloseReason::ReadError => "read_error",
            CloseReason::LivenessTimeout => "liveness_timeout",
            CloseReason::WriteError => "write_error",
            CloseReason::WriteTimeout => "write_timeout",
            CloseReason::Evicted => "evicted",
            CloseReason::BusClosed => "bus_closed",
            CloseReason::SetupFailed => "setup_failed",
            CloseReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

pub struct Client {
    connection_id: ConnectionId,
    user_id: UserId,
    settings: ConnectionSettings,
    hub: HubHandle,
    bus: Arc<dyn MessageBus>,
    shutdown: CancellationToken,
    state: ConnectionState,
}

/// Everything the write loop owns, handed back for teardown.
struct WriteHalf<W> {
    sink: W,
    mailbox: mpsc::Receiver<Envelope>,
    subscription: BusSubscription,
    reason: Option<CloseReason>,
}

impl Client {
    pub fn new(
        user_id: UserId,
        settings: ConnectionSettings,
        hub: HubHandle,
        bus: Arc<dyn MessageBus>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            user_id,
            settings,
            hub,
            bus,
            shutdown,
            state: ConnectionState::Active,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Drive the connection to completion and report why it closed.
    pub async fn run<W, R, E>(mut self, mut sink: W, stream: R) -> CloseReason
    where
        W: Sink<Message> + Unpin + Send + 'static,
        W::Error: Display,
        R: Stream<Item = Result<Message, E>> + Unpin + Send,
        E: Display,
    {
        let (mailbox_tx, mailbox) = mpsc::channel(self.settings.mailbox_capacity.max(1));
        // Fresh channel with capacity >= 1, so the ack always fits.
        let _ = mailbox_tx.try_send(Envelope::connected(self.user_id, self.connection_id));

        let handle = ClientHandle::new(self.connection_id, self.user_id, mailbox_tx);
        if let Err(e) = self.hub.register(handle).await {
            tracing::warn!(user_id = %self.user_id, error = %e, "Registration failed");
            self.transition(ConnectionState::Closing);
            let _ = timeout(self.settings.write_timeout, sink.close()).await;
            self.transition(ConnectionState::Closed);
            return CloseReason::SetupFailed;
        }

        let channel = notification_channel(self.user_id);
        let subscription = match self.bus.subscribe(&channel).await {
            Ok(subscription) => subscription,
            Err(e) => {
                tracing::warn!(
                    user_id = %self.user_id,
                    channel = %channel,
                    error = %e,
                    "Bus subscription failed"
                );
                self.transition(ConnectionState::Closing);
                self.leave_hub().await;
                let _ = timeout(self.settings.write_timeout, sink.close()).await;
                self.transition(ConnectionState::Closed);
                return CloseReason::SetupFailed;
            }
        };

        tracing::info!(
            user_id = %self.user_id,
            connection_id = %self.connection_id,
            "Connection actor started"
        );

        let token = self.shutdown.child_token();
        let writer = tokio::spawn(write_loop(
            sink,
            mailbox,
            subscription,
            self.settings.clone(),
            token.clone(),
            self.connection_id,
        ));
        let read_reason = read_loop(
            stream,
            self.settings.liveness_timeout,
            &token,
            self.connection_id,
        )
        .await;
        token.cancel();
        self.transition(ConnectionState::Closing);

        let write_half = match writer.await {
            Ok(half) => Some(half),
            Err(e) => {
                tracing::error!(
                    connection_id = %self.connection_id,
                    error = %e,
                    "Write loop panicked"
                );
                None
            }
        };
        let write_reason = write_half.as_ref().and_then(|half| half.reason);
        let reason = read_reason.or(write_reason).unwrap_or(CloseReason::Shutdown);

        self.teardown(write_half, reason).await;

        tracing::info!(
            user_id = %self.user_id,
            connection_id = %self.connection_id,
            reason = %reason,
            "Connection actor stopped"
        );
        reason
    }

    async fn teardown<W>(&mut self, write_half: Option<WriteHalf<W>>, reason: CloseReason)
    where
        W: Sink<Message> + Unpin,
        W::Error: Display,
    {
        let limit = self.settings.write_timeout;
        let mut sink = None;

        if let Some(half) = write_half {
            if timeout(limit, half.subscription.close()).await.is_err() {
                tracing::warn!(
                    connection_id = %self.connection_id,
                    "Timed out closing bus subscription"
                );
            }
            let mut mailbox = half.mailbox;
            mailbox.close();
            drop(mailbox);
            sink = Some(half.sink);
        }

        self.leave_hub().await;

        if let Some(mut sink) = sink {
            if reason == CloseReason::Shutdown {
                let frame = CloseFrame {
                    code: close_code::AWAY,
                    reason: "server shutting down".into(),
                };
                let _ = timeout(limit, sink.send(Message::Close(Some(frame)))).await;
            }
            match timeout(limit, sink.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(connection_id = %self.connection_id, error = %e, "Socket close failed");
                }
                Err(_) => {
                    tracing::debug!(connection_id = %self.connection_id, "Timed out closing socket");
                }
            }
        }

        self.transition(ConnectionState::Closed);
    }

    async fn leave_hub(&self) {
        match timeout(
            self.settings.write_timeout,
            self.hub.unregister(self.user_id, self.connection_id),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(connection_id = %self.connection_id, error = %e, "Unregister skipped");
            }
            Err(_) => {
                tracing::warn!(connection_id = %self.connection_id, "Timed out unregistering");
            }
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        tracing::trace!(
            connection_id = %self.connection_id,
            from = ?self.state,
            to = ?next,
            "Connection state change"
        );
        self.state = next;
    }
}

/// Watch inbound frames. Any frame refreshes the liveness deadline.
///
/// Returns `None` when stopped by the shared token.
async fn read_loop<R, E>(
    mut stream: R,
    liveness: Duration,
    token: &CancellationToken,
    connection_id: ConnectionId,
) -> Option<CloseReason>
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => return None,
            frame = timeout(liveness, stream.next()) => frame,
        };

        match frame {
            Err(_) => {
                tracing::info!(connection_id = %connection_id, "Liveness deadline exceeded");
                return Some(CloseReason::LivenessTimeout);
            }
            Ok(None) => return Some(CloseReason::PeerClosed),
            Ok(Some(Err(e))) => {
                tracing::debug!(connection_id = %connection_id, error = %e, "WebSocket receive error");
                return Some(CloseReason::ReadError);
            }
            Ok(Some(Ok(message))) => match message {
                Message::Text(text) => inspect_client_message(text.as_str(), connection_id),
                Message::Binary(data) => {
                    tracing::debug!(
                        connection_id = %connection_id,
                        len = data.len(),
                        "Ignoring binary frame from client"
                    );
                }
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Close(frame) => {
                    tracing::debug!(connection_id = %connection_id, frame = ?frame, "Client initiated close");
                    return Some(CloseReason::PeerClosed);
                }
            },
        }
    }
}

/// The channel is push-only; client messages are parsed for the log and dropped.
fn inspect_client_message(text: &str, connection_id: ConnectionId) {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(value) => {
            tracing::debug!(
                connection_id = %connection_id,
                kind = value.get("type").and_then(|t| t.as_str()).unwrap_or("unknown"),
                "Ignoring client message"
            );
        }
        Err(e) => {
            tracing::debug!(connection_id = %connection_id, error = %e, "Malformed client message");
        }
    }
}

/// Multiplex mailbox, bus and heartbeat onto the socket, one write at a time.
async fn write_loop<W>(
    mut sink: W,
    mut mailbox: mpsc::Receiver<Envelope>,
    mut subscription: BusSubscription,
    settings: ConnectionSettings,
    token: CancellationToken,
    connection_id: ConnectionId,
) -> WriteHalf<W>
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    let mut heartbeat = interval_at(
        Instant::now() + settings.heartbeat_interval,
        settings.heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        let envelope = tokio::select! {
            biased;

            _ = token.cancelled() => break None,
            item = mailbox.recv() => match item {
                Some(envelope) => envelope,
                None => break Some(CloseReason::Evicted),
            },
            payload = subscription.recv() => match payload {
                Some(bytes) => match serde_json::from_slice(&bytes) {
                    Ok(event) => Envelope::notification(event),
                    Err(e) => {
                        tracing::warn!(
                            connection_id = %connection_id,
                            channel = %subscription.channel(),
                            error = %e,
                            "Dropping undecodable bus payload"
                        );
                        continue;
                    }
                },
                None => break Some(CloseReason::BusClosed),
            },
            _ = heartbeat.tick() => {
                let ping = Message::Ping(Bytes::new());
                if let Some(reason) = write(&mut sink, ping, settings.write_timeout, connection_id).await {
                    break Some(reason);
                }
                continue;
            }
        };

        let text = match envelope.to_json() {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(connection_id = %connection_id, error = %e, "Failed to encode envelope");
                continue;
            }
        };
        let frame = Message::Text(text.into());
        if let Some(reason) = write(&mut sink, frame, settings.write_timeout, connection_id).await {
            break Some(reason);
        }
    };

    token.cancel();
    WriteHalf {
        sink,
        mailbox,
        subscription,
        reason,
    }
}

async fn write<W>(
    sink: &mut W,
    message: Message,
    limit: Duration,
    connection_id: ConnectionId,
) -> Option<CloseReason>
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    match timeout(limit, sink.send(message)).await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => {
            tracing::debug!(connection_id = %connection_id, error = %e, "WebSocket send failed");
            Some(CloseReason::WriteError)
        }
        Err(_) => {
            tracing::info!(connection_id = %connection_id, "Write deadline exceeded");
            Some(CloseReason::WriteTimeout)
        }
    }
}
