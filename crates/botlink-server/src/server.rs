//! Listener lifecycle: bind, accept, graceful stop.

use crate::broadcast::{BroadcastReport, Broadcaster};
use crate::config::ServerSettings;
use crate::connection::ConnectionHandler;
use crate::error::{ServerError, ServerResult};
use crate::registry::ConnectionRegistry;
use crate::source::ConfigSource;
use botlink_core::Credential;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

/// State every connection task reads.
pub(crate) struct Shared {
    pub credential: Credential,
    pub registry: ConnectionRegistry,
    pub source: Option<Arc<dyn ConfigSource>>,
    pub settings: ServerSettings,
}

/// A running server.
///
/// Dropping it without calling [`Server::stop`] also stops accepting, but
/// does not wait for open connections.
pub struct Server {
    local_addr: SocketAddr,
    registry: ConnectionRegistry,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl Server {
    /// Bind the listening endpoint and start accepting connections.
    pub async fn bind(
        settings: ServerSettings,
        credential: Credential,
        source: Option<Arc<dyn ConfigSource>>,
    ) -> ServerResult<Self> {
        let listener = TcpListener::bind(settings.bind)
            .await
            .map_err(|source| ServerError::Bind {
                addr: settings.bind,
                source,
            })?;
        let local_addr = listener.local_addr()?;
        tracing::info!("botlink server listening on ws://{}", local_addr);

        let registry = ConnectionRegistry::new();
        let shared = Arc::new(Shared {
            credential,
            registry: registry.clone(),
            source,
            settings,
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(listener, shared, shutdown_rx));

        Ok(Self {
            local_addr,
            registry,
            shutdown_tx,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn broadcaster(&self) -> Broadcaster {
        Broadcaster::new(self.registry.clone())
    }

    /// Send `message` to every authenticated connection.
    pub async fn broadcast<M>(&self, message: &M) -> ServerResult<BroadcastReport>
    where
        M: Serialize + ?Sized,
    {
        self.broadcaster().broadcast(message).await
    }

    /// Stop accepting, then wait up to the grace period for open
    /// connections to finish on their own.
    pub async fn stop(self) -> ServerResult<()> {
        let _ = self.shutdown_tx.send(true);
        self.accept_task.await?;
        tracing::info!("botlink server stopped");
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
                    }
                    let id = shared.registry.next_id();
                    tracing::debug!(peer = %peer, conn = %id, "connection accepted");
                    let handler = ConnectionHandler::new(shared.clone(), id, peer);
                    connections.spawn(handler.run(stream));
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            },

            Some(joined) = connections.join_next() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        tracing::error!(error = %e, "connection task panicked");
                    }
                }
            }

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    drop(listener);
    tracing::info!(open = connections.len(), "listener closed, waiting for connections");

    let drained = tokio::time::timeout(shared.settings.shutdown_grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            remaining = connections.len(),
            "timeout waiting for connections to close, leaving them running"
        );
        connections.detach_all();
    }
}
