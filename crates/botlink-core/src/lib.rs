//! Core types for botlink.
//!
//! This crate provides the protocol primitives shared by the server and the
//! client: the wire messages, the token derivation used by the handshake and
//! the credential a server checks it against.

mod credential;
mod message;
mod token;

pub use credential::{AuthError, Credential};
pub use message::{
    CONFIG_UNAVAILABLE, ClientMessage, Inbound, PROCESSING_ERROR, ProtocolError, ServerMessage,
    parse_inbound,
};
pub use token::{generate_token, is_valid_token};

use std::fmt;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport accepted, WebSocket upgrade in progress.
    Connecting,
    /// Waiting for the single `auth` message.
    AwaitingAuth,
    /// Handshake passed, serving requests and broadcasts.
    Authenticated,
    /// Terminal.
    Closed,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, AwaitingAuth)
                | (Connecting, Closed)
                | (AwaitingAuth, Authenticated)
                | (AwaitingAuth, Closed)
                | (Authenticated, Closed)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::AwaitingAuth => "awaiting_auth",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}
