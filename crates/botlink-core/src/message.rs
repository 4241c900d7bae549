//! Protocol messages.
//!
//! Every frame is one JSON object tagged by `type`. Dispatch happens on the
//! closed enums below; an unrecognized `type` is kept as
//! [`Inbound::Unknown`] so the server can reject it by name.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error text for a request whose handling failed inside the server.
pub const PROCESSING_ERROR: &str = "Error processing your request";
/// Error text when the configuration snapshot cannot be produced.
pub const CONFIG_UNAVAILABLE: &str = "Server error: cannot retrieve configuration";

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Handshake. Both fields must be present and non-empty to be accepted.
    Auth {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        public_key_part: Option<String>,
    },
    /// Ask for the host's configuration snapshot.
    GetConfig,
    /// Liveness check.
    Ping,
}

impl ClientMessage {
    const KINDS: [&'static str; 3] = ["auth", "get_config", "ping"];

    pub fn auth(token: impl Into<String>, public_key_part: impl Into<String>) -> Self {
        ClientMessage::Auth {
            token: Some(token.into()),
            public_key_part: Some(public_key_part.into()),
        }
    }

    /// The wire `type` of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Auth { .. } => "auth",
            ClientMessage::GetConfig => "get_config",
            ClientMessage::Ping => "ping",
        }
    }

    /// `type` of the server's successful reply to this request.
    pub fn reply_kind(&self) -> &'static str {
        match self {
            ClientMessage::Auth { .. } => "auth_result",
            ClientMessage::GetConfig => "config",
            ClientMessage::Ping => "pong",
        }
    }

    /// The `error` texts the server can answer this request with.
    ///
    /// The protocol carries no request ids, so this closed set is what tells
    /// an error reply apart from a pushed message that happens to be typed
    /// `error`.
    pub fn reply_errors(&self) -> &'static [&'static str] {
        match self {
            ClientMessage::Auth { .. } => &[],
            ClientMessage::GetConfig => &[CONFIG_UNAVAILABLE, PROCESSING_ERROR],
            ClientMessage::Ping => &[PROCESSING_ERROR],
        }
    }

    /// Token and identifier of a well-formed `auth`, if this is one.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match self {
            ClientMessage::Auth {
                token: Some(token),
                public_key_part: Some(pkp),
            } if !token.is_empty() && !pkp.is_empty() => Some((token, pkp)),
            _ => None,
        }
    }
}

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Outcome of the handshake.
    AuthResult {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Configuration snapshot supplied by the host.
    Config { data: Value },
    /// Reply to `ping`.
    Pong,
    /// Error or rejection of a single request.
    Error { message: String },
}

impl ServerMessage {
    pub fn auth_ok() -> Self {
        ServerMessage::AuthResult {
            success: true,
            message: None,
        }
    }

    pub fn auth_failed(reason: impl Into<String>) -> Self {
        ServerMessage::AuthResult {
            success: false,
            message: Some(reason.into()),
        }
    }

    pub fn config(data: Value) -> Self {
        ServerMessage::Config { data }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// A syntactically valid inbound object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Message(ClientMessage),
    /// Any other `type`. Holds the value as text (`null` when absent).
    Unknown(String),
}

/// Inbound payload that could not be turned into an [`Inbound`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid JSON format")]
    InvalidJson,
    #[error("Invalid message format: expected a JSON object")]
    NotAnObject,
    #[error("Invalid message format: malformed '{0}' message")]
    InvalidFields(String),
}

/// Parse one inbound text frame.
pub fn parse_inbound(text: &str) -> Result<Inbound, ProtocolError> {
    let value: Value = serde_json::from_str(text).map_err(|_| ProtocolError::InvalidJson)?;
    let Some(object) = value.as_object() else {
        return Err(ProtocolError::NotAnObject);
    };

    let kind = match object.get("type") {
        Some(Value::String(kind)) if ClientMessage::KINDS.contains(&kind.as_str()) => kind.clone(),
        Some(Value::String(kind)) => return Ok(Inbound::Unknown(kind.clone())),
        Some(other) => return Ok(Inbound::Unknown(other.to_string())),
        None => return Ok(Inbound::Unknown(Value::Null.to_string())),
    };

    serde_json::from_value(value)
        .map(Inbound::Message)
        .map_err(|_| ProtocolError::InvalidFields(kind))
}
