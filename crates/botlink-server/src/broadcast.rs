//! Fan-out of server-originated messages to every registered connection.
//!
//! A broadcast serializes the message once, queues it for every member of a
//! registry snapshot at the same time and waits for all of the writes to
//! settle. Failed recipients are reported and logged but left in the
//! registry; their own handler notices the broken transport and unregisters.

use crate::error::ServerResult;
use crate::registry::{ConnectionId, ConnectionRegistry};
use futures_util::future::join_all;
use serde::Serialize;
use std::io;
use tokio_tungstenite::tungstenite::{self, Message, error::ProtocolError};

/// Why a single recipient did not get a broadcast.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendFailure {
    /// The peer closed or reset the connection.
    #[error("connection closed by peer")]
    PeerClosed,
    /// The connection is closing or its handler is gone.
    #[error("connection in invalid state")]
    InvalidState,
    #[error("{0}")]
    Other(String),
}

impl From<tungstenite::Error> for SendFailure {
    fn from(e: tungstenite::Error) -> Self {
        match e {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                SendFailure::PeerClosed
            }
            tungstenite::Error::Io(ref err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::BrokenPipe
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::UnexpectedEof
                ) =>
            {
                SendFailure::PeerClosed
            }
            tungstenite::Error::Protocol(ProtocolError::SendAfterClosing) => {
                SendFailure::InvalidState
            }
            other => SendFailure::Other(other.to_string()),
        }
    }
}

/// Outcome of one [`Broadcaster::broadcast`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Send attempts issued, one per registry member.
    pub attempted: usize,
    pub delivered: usize,
    pub failures: Vec<(ConnectionId, SendFailure)>,
}

/// Sends one message to every authenticated connection.
#[derive(Clone)]
pub struct Broadcaster {
    registry: ConnectionRegistry,
}

impl Broadcaster {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }

    /// Deliver `message` to all current members and wait for every send.
    ///
    /// Only serialization failure is an error; per-recipient failures land
    /// in the report.
    pub async fn broadcast<M>(&self, message: &M) -> ServerResult<BroadcastReport>
    where
        M: Serialize + ?Sized,
    {
        let payload = serde_json::to_string(message)?;
        let members = self.registry.snapshot().await;
        if members.is_empty() {
            return Ok(BroadcastReport::default());
        }

        let frame = Message::Text(payload.into());
        let sends = members.iter().map(|client| {
            let frame = frame.clone();
            async move { (client.id(), client.remote_addr(), client.send(frame).await) }
        });
        let outcomes = join_all(sends).await;

        let mut report = BroadcastReport {
            attempted: outcomes.len(),
            ..Default::default()
        };
        for (id, peer, outcome) in outcomes {
            match outcome {
                Ok(()) => report.delivered += 1,
                Err(failure) => {
                    match &failure {
                        SendFailure::PeerClosed => tracing::warn!(
                            conn = %id, peer = %peer,
                            "broadcast failed: connection closed during send"
                        ),
                        SendFailure::InvalidState => tracing::warn!(
                            conn = %id, peer = %peer,
                            "broadcast failed: invalid state, connection likely closing"
                        ),
                        SendFailure::Other(e) => tracing::error!(
                            conn = %id, peer = %peer, error = %e,
                            "broadcast failed with an unexpected error"
                        ),
                    }
                    report.failures.push((id, failure));
                }
            }
        }

        tracing::debug!(
            attempted = report.attempted,
            delivered = report.delivered,
            "broadcast finished"
        );
        Ok(report)
    }
}
