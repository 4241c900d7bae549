//! The set of authenticated connections.

use crate::broadcast::SendFailure;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

/// Identifies one accepted connection for the lifetime of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A frame queued for a connection, with a slot for the write outcome.
pub(crate) struct Outbound {
    pub message: Message,
    pub ack: oneshot::Sender<Result<(), SendFailure>>,
}

/// Handle on a registered connection.
///
/// The socket itself stays with the connection's handler task; the handle
/// only reaches it through the handler's outbound queue.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ConnectionId,
    remote_addr: SocketAddr,
    tx: mpsc::Sender<Outbound>,
}

impl ClientHandle {
    pub(crate) fn new(
        id: ConnectionId,
        remote_addr: SocketAddr,
        queue: usize,
    ) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(queue.max(1));
        (Self { id, remote_addr, tx }, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Queue `message` and wait until the owning handler has written it.
    pub async fn send(&self, message: Message) -> Result<(), SendFailure> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Outbound { message, ack })
            .await
            .map_err(|_| SendFailure::InvalidState)?;
        // A dropped ack means the handler quit before writing.
        done.await.unwrap_or(Err(SendFailure::InvalidState))
    }
}

/// Authenticated connections, shared between handlers and the broadcaster.
///
/// Cloning shares the same set.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    clients: RwLock<HashMap<ConnectionId, ClientHandle>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id for a freshly accepted connection.
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Insert `client`. Returns `false` if it was already present.
    pub async fn add(&self, client: ClientHandle) -> bool {
        let mut clients = self.inner.clients.write().await;
        let id = client.id;
        let addr = client.remote_addr;
        if clients.contains_key(&id) {
            return false;
        }
        clients.insert(id, client);
        tracing::info!(conn = %id, peer = %addr, total = clients.len(), "client registered");
        true
    }

    /// Discard `id`. Returns `false` if it was not present.
    pub async fn remove(&self, id: ConnectionId) -> bool {
        let mut clients = self.inner.clients.write().await;
        match clients.remove(&id) {
            Some(client) => {
                tracing::info!(
                    conn = %id,
                    peer = %client.remote_addr,
                    total = clients.len(),
                    "client unregistered"
                );
                true
            }
            None => false,
        }
    }

    /// Independent copy of the current members.
    pub async fn snapshot(&self) -> Vec<ClientHandle> {
        self.inner.clients.read().await.values().cloned().collect()
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.inner.clients.read().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.inner.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
