//! Server settings supplied by the hosting process.

use std::net::SocketAddr;
use std::time::Duration;

/// Fixed for the lifetime of one server run.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Listening address and port. Port 0 picks a free one.
    pub bind: SocketAddr,
    /// How long a new connection may take to upgrade and send `auth`.
    pub handshake_timeout: Duration,
    /// How long `stop` waits for open connections to end on their own.
    pub shutdown_grace: Duration,
    /// Per-connection queue depth for broadcast frames.
    pub outbound_queue: usize,
}

impl ServerSettings {
    pub const DEFAULT_PORT: u16 = 8765;

    pub fn new(bind: SocketAddr) -> Self {
        Self {
            bind,
            ..Self::default()
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: ([127, 0, 0, 1], Self::DEFAULT_PORT).into(),
            handshake_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
            outbound_queue: 64,
        }
    }
}
