//! Connection registry ("hub").
//!
//! A single control loop owns the `user_id -> {connection}` map. Every
//! mutation and query arrives as a message on one of its inbound channels,
//! so the map is never shared and no lock guards it.

use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use relay_common::error::AppError;
use relay_common::types::{ConnectionId, Envelope, UserId};

#[derive(Debug, Error)]
pub enum HubError {
    #[error("registry control loop is not running")]
    Stopped,
}

impl From<HubError> for AppError {
    fn from(err: HubError) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Registry-side view of a connection actor: its identity plus the sending
/// half of its mailbox. The registry holds the only sender, so dropping the
/// handle closes the mailbox.
#[derive(Debug)]
pub struct ClientHandle {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    mailbox: mpsc::Sender<Envelope>,
}

impl ClientHandle {
    pub fn new(connection_id: ConnectionId, user_id: UserId, mailbox: mpsc::Sender<Envelope>) -> Self {
        Self {
            connection_id,
            user_id,
            mailbox,
        }
    }
}

/// Snapshot of registry occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub users: usize,
    pub connections: usize,
}

struct Unregister {
    user_id: UserId,
    connection_id: ConnectionId,
}

struct Delivery {
    user_id: UserId,
    envelope: Envelope,
}

enum Query {
    ConnectionCount {
        user_id: UserId,
        reply: oneshot::Sender<usize>,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
}

/// Owner of the registry map. Consumed by [`Hub::run`].
pub struct Hub {
    connections: HashMap<UserId, HashMap<ConnectionId, ClientHandle>>,
    register_rx: mpsc::Receiver<ClientHandle>,
    unregister_rx: mpsc::Receiver<Unregister>,
    send_rx: mpsc::Receiver<Delivery>,
    query_rx: mpsc::Receiver<Query>,
    shutdown: CancellationToken,
}

/// Cloneable front door to the registry loop.
#[derive(Debug, Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<ClientHandle>,
    unregister_tx: mpsc::Sender<Unregister>,
    send_tx: mpsc::Sender<Delivery>,
    query_tx: mpsc::Sender<Query>,
}

impl Hub {
    pub fn new(queue_capacity: usize, shutdown: CancellationToken) -> (Self, HubHandle) {
        let capacity = queue_capacity.max(1);
        let (register_tx, register_rx) = mpsc::channel(capacity);
        let (unregister_tx, unregister_rx) = mpsc::channel(capacity);
        let (send_tx, send_rx) = mpsc::channel(capacity);
        let (query_tx, query_rx) = mpsc::channel(capacity);

        let hub = Self {
            connections: HashMap::new(),
            register_rx,
            unregister_rx,
            send_rx,
            query_rx,
            shutdown,
        };
        let handle = HubHandle {
            register_tx,
            unregister_tx,
            send_tx,
            query_tx,
        };
        (hub, handle)
    }

    /// Build the registry and run its control loop on a new task.
    pub fn spawn(queue_capacity: usize, shutdown: CancellationToken) -> (HubHandle, JoinHandle<()>) {
        let (hub, handle) = Self::new(queue_capacity, shutdown);
        (handle, tokio::spawn(hub.run()))
    }

    /// Control loop. Exits on shutdown or once every [`HubHandle`] is dropped.
    pub async fn run(mut self) {
        tracing::info!("Connection registry started");

        loop {
            // Registration drains before unregistration so an actor's own
            // register/unregister pair can never be applied out of order.
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    let stats = self.stats();
                    self.connections.clear();
                    tracing::info!(
                        users = stats.users,
                        connections = stats.connections,
                        "Connection registry shutting down"
                    );
                    break;
                }
                Some(client) = self.register_rx.recv() => self.register(client),
                Some(req) = self.unregister_rx.recv() => {
                    self.unregister(req.user_id, req.connection_id);
                }
                Some(delivery) = self.send_rx.recv() => {
                    self.send_to_user(delivery.user_id, &delivery.envelope);
                }
                Some(query) = self.query_rx.recv() => self.answer(query),
                else => break,
            }
        }

        tracing::info!("Connection registry stopped");
    }

    fn register(&mut self, client: ClientHandle) {
        let user_id = client.user_id;
        let connection_id = client.connection_id;
        let clients = self.connections.entry(user_id).or_default();
        clients.insert(connection_id, client);

        tracing::debug!(
            user_id = %user_id,
            connection_id = %connection_id,
            connections = clients.len(),
            "Connection registered"
        );
    }

    /// Remove one connection. Unknown ids are ignored.
    fn unregister(&mut self, user_id: UserId, connection_id: ConnectionId) {
        let Some(clients) = self.connections.get_mut(&user_id) else {
            return;
        };
        if clients.remove(&connection_id).is_none() {
            return;
        }
        let remaining = clients.len();
        if remaining == 0 {
            self.connections.remove(&user_id);
        }

        tracing::debug!(
            user_id = %user_id,
            connection_id = %connection_id,
            remaining,
            "Connection unregistered"
        );
    }

    /// Offer `envelope` to every connection of `user_id` without waiting.
    ///
    /// A connection whose mailbox is full is treated as stuck: it is removed
    /// and its mailbox closed, which makes the actor shut itself down.
    fn send_to_user(&mut self, user_id: UserId, envelope: &Envelope) -> usize {
        let Some(clients) = self.connections.get_mut(&user_id) else {
            return 0;
        };

        let mut delivered = 0;
        clients.retain(|connection_id, client| {
            match client.mailbox.try_send(envelope.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        user_id = %user_id,
                        connection_id = %connection_id,
                        "Mailbox full, evicting connection"
                    );
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(
                        user_id = %user_id,
                        connection_id = %connection_id,
                        "Mailbox closed, dropping connection"
                    );
                    false
                }
            }
        });

        if clients.is_empty() {
            self.connections.remove(&user_id);
        }
        delivered
    }

    fn connection_count(&self, user_id: UserId) -> usize {
        self.connections.get(&user_id).map(|c| c.len()).unwrap_or(0)
    }

    fn stats(&self) -> HubStats {
        HubStats {
            users: self.connections.len(),
            connections: self.connections.values().map(|c| c.len()).sum(),
        }
    }

    fn answer(&self, query: Query) {
        // The asker may have given up; a dropped reply channel is fine.
        match query {
            Query::ConnectionCount { user_id, reply } => {
                let _ = reply.send(self.connection_count(user_id));
            }
            Query::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }
}

impl HubHandle {
    pub async fn register(&self, client: ClientHandle) -> Result<(), HubError> {
        self.register_tx
            .send(client)
            .await
            .map_err(|_| HubError::Stopped)
    }

    /// Ask the registry to forget a connection. Safe to call more than once.
    pub async fn unregister(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Result<(), HubError> {
        self.unregister_tx
            .send(Unregister {
                user_id,
                connection_id,
            })
            .await
            .map_err(|_| HubError::Stopped)
    }

    /// Queue `envelope` for every connection currently registered for `user_id`.
    pub async fn send_to_user(&self, user_id: UserId, envelope: Envelope) -> Result<(), HubError> {
        self.send_tx
            .send(Delivery { user_id, envelope })
            .await
            .map_err(|_| HubError::Stopped)
    }

    pub async fn connection_count(&self, user_id: UserId) -> Result<usize, HubError> {
        let (reply, rx) = oneshot::channel();
        self.query_tx
            .send(Query::ConnectionCount { user_id, reply })
            .await
            .map_err(|_| HubError::Stopped)?;
        rx.await.map_err(|_| HubError::Stopped)
    }

    pub async fn stats(&self) -> Result<HubStats, HubError> {
        let (reply, rx) = oneshot::channel();
        self.query_tx
            .send(Query::Stats { reply })
            .await
            .map_err(|_| HubError::Stopped)?;
        rx.await.map_err(|_| HubError::Stopped)
    }
}
