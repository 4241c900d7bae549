//! Per-connection handler.
//!
//! Each accepted stream gets one `ConnectionHandler` running in its own task.
//! The handler owns the WebSocket for the connection's whole life:
//!
//! ```text
//! Connecting -> AwaitingAuth -> Authenticated -> Closed
//!                    |                              ^
//!                    +------------------------------+
//! ```
//!
//! Only handshake failures and transport closure end a connection. Malformed
//! or unknown requests after authentication get an `error` reply and the
//! connection carries on.

use crate::registry::{ClientHandle, ConnectionId, Outbound};
use crate::server::Shared;
use botlink_core::{
    AuthError, CONFIG_UNAVAILABLE, ClientMessage, ConnectionState, Inbound, PROCESSING_ERROR,
    ServerMessage, parse_inbound,
};
use futures_util::{FutureExt, SinkExt, StreamExt};
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};

const PROCESSING_ERROR_JSON: &str = r#"{"type":"error","message":"Error processing your request"}"#;

/// How long to wait for the peer's half of the closing handshake.
const CLOSE_LINGER: Duration = Duration::from_secs(1);

/// One inbound data frame, or why there is none.
enum Incoming {
    Text(String),
    /// Binary frame that is not UTF-8.
    Undecodable,
    Closed,
    Failed(tungstenite::Error),
}

pub(crate) struct ConnectionHandler {
    shared: Arc<Shared>,
    id: ConnectionId,
    peer: SocketAddr,
    state: ConnectionState,
}

impl ConnectionHandler {
    pub(crate) fn new(shared: Arc<Shared>, id: ConnectionId, peer: SocketAddr) -> Self {
        Self {
            shared,
            id,
            peer,
            state: ConnectionState::Connecting,
        }
    }

    /// Drive the connection from upgrade to close.
    pub(crate) async fn run<S>(mut self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut path = String::new();
        let upgrade = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                path = req.uri().path().to_owned();
                Ok(resp)
            },
        );
        let mut ws = match time::timeout(self.shared.settings.handshake_timeout, upgrade).await {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                tracing::debug!(peer = %self.peer, error = %e, "WebSocket upgrade failed");
                self.transition(ConnectionState::Closed);
                return;
            }
            Err(_) => {
                tracing::debug!(peer = %self.peer, "WebSocket upgrade timed out");
                self.transition(ConnectionState::Closed);
                return;
            }
        };

        tracing::info!(peer = %self.peer, conn = %self.id, path = %path, "new connection");
        self.transition(ConnectionState::AwaitingAuth);

        let Some(mut outbound) = self.authenticate(&mut ws).await else {
            return;
        };

        self.serve(&mut ws, &mut outbound).await;

        self.shared.registry.remove(self.id).await;
        // Pending broadcast acks are dropped with the queue and report InvalidState.
        drop(outbound);
        close_transport(&mut ws, None).await;
        self.transition(ConnectionState::Closed);
        tracing::info!(peer = %self.peer, conn = %self.id, "finished handling connection");
    }

    /// Run the handshake. On success the connection is registered and its
    /// outbound queue is returned.
    async fn authenticate<S>(
        &mut self,
        ws: &mut WebSocketStream<S>,
    ) -> Option<mpsc::Receiver<Outbound>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let first =
            match time::timeout(self.shared.settings.handshake_timeout, next_payload(ws)).await {
                Ok(Incoming::Text(text)) => Some(text),
                Ok(Incoming::Undecodable) => None,
                Ok(Incoming::Closed) => {
                    tracing::info!(peer = %self.peer, "connection closed during authentication");
                    self.transition(ConnectionState::Closed);
                    return None;
                }
                Ok(Incoming::Failed(e)) => {
                    tracing::info!(peer = %self.peer, error = %e, "connection lost during authentication");
                    self.transition(ConnectionState::Closed);
                    return None;
                }
                Err(_) => {
                    tracing::warn!(peer = %self.peer, "authentication timed out");
                    self.reject(ws, AuthError::Timeout).await;
                    return None;
                }
            };

        let verdict = match first.as_deref().map(parse_inbound) {
            Some(Ok(Inbound::Message(msg))) => match msg.credentials() {
                Some((token, identifier)) => {
                    let verdict = self.shared.credential.verify(token, identifier);
                    if verdict == Err(AuthError::InvalidIdentifier) {
                        tracing::warn!(
                            peer = %self.peer,
                            expected = self.shared.credential.expected_identifier(),
                            got = identifier,
                            "mismatched public key part"
                        );
                    }
                    verdict
                }
                None => Err(AuthError::InvalidFormat),
            },
            _ => Err(AuthError::InvalidFormat),
        };

        if let Err(reason) = verdict {
            tracing::warn!(peer = %self.peer, reason = %reason, "authentication failed");
            self.reject(ws, reason).await;
            return None;
        }

        let (handle, outbound) =
            ClientHandle::new(self.id, self.peer, self.shared.settings.outbound_queue);
        // Registered before the reply goes out; broadcasts queue up behind it.
        self.shared.registry.add(handle).await;
        if let Err(e) = send_json(ws, &ServerMessage::auth_ok()).await {
            tracing::info!(peer = %self.peer, error = %e, "connection lost before auth result");
            self.shared.registry.remove(self.id).await;
            self.transition(ConnectionState::Closed);
            return None;
        }

        tracing::info!(peer = %self.peer, conn = %self.id, "authentication successful");
        self.transition(ConnectionState::Authenticated);
        Some(outbound)
    }

    /// Answer a failed handshake and close with a policy violation.
    async fn reject<S>(&mut self, ws: &mut WebSocketStream<S>, reason: AuthError)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if reason != AuthError::Timeout {
            let _ = send_json(ws, &ServerMessage::auth_failed(reason.reason())).await;
        }
        let frame = CloseFrame {
            code: CloseCode::Policy,
            reason: reason.reason().into(),
        };
        close_transport(ws, Some(frame)).await;
        self.transition(ConnectionState::Closed);
    }

    /// Request/response loop, interleaved with queued broadcasts.
    async fn serve<S>(&mut self, ws: &mut WebSocketStream<S>, outbound: &mut mpsc::Receiver<Outbound>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            tokio::select! {
                incoming = next_payload(ws) => {
                    let reply = match incoming {
                        Incoming::Text(text) => self.respond(&text).await,
                        Incoming::Undecodable => {
                            ServerMessage::error("Invalid message format: expected UTF-8 text")
                        }
                        Incoming::Closed => {
                            tracing::info!(peer = %self.peer, "client disconnected");
                            break;
                        }
                        Incoming::Failed(e) => {
                            tracing::info!(peer = %self.peer, error = %e, "connection lost");
                            break;
                        }
                    };
                    if let Err(e) = self.reply(ws, &reply).await {
                        tracing::info!(peer = %self.peer, error = %e, "failed to send reply");
                        break;
                    }
                }
                Some(out) = outbound.recv() => {
                    let result = ws.send(out.message).await;
                    let broken = result.is_err();
                    let _ = out.ack.send(result.map_err(Into::into));
                    if broken {
                        break;
                    }
                }
            }
        }
    }

    /// Build the reply for one request. Panics are contained here.
    async fn respond(&self, text: &str) -> ServerMessage {
        match AssertUnwindSafe(self.dispatch(text)).catch_unwind().await {
            Ok(reply) => reply,
            Err(_) => {
                tracing::error!(peer = %self.peer, "panic while processing message");
                ServerMessage::error(PROCESSING_ERROR)
            }
        }
    }

    async fn dispatch(&self, text: &str) -> ServerMessage {
        let request = match parse_inbound(text) {
            Ok(Inbound::Message(request)) => request,
            Ok(Inbound::Unknown(kind)) => {
                tracing::info!(peer = %self.peer, kind = %kind, "unknown message type");
                return ServerMessage::error(format!("Unknown message type: {kind}"));
            }
            Err(e) => {
                tracing::warn!(peer = %self.peer, error = %e, "malformed message");
                return ServerMessage::error(e.to_string());
            }
        };

        let kind = request.kind();
        tracing::debug!(peer = %self.peer, kind, "received message");
        match request {
            ClientMessage::GetConfig => self.config_snapshot().await,
            ClientMessage::Ping => ServerMessage::Pong,
            ClientMessage::Auth { .. } => {
                ServerMessage::error(format!("Unknown message type: {kind}"))
            }
        }
    }

    async fn config_snapshot(&self) -> ServerMessage {
        let Some(source) = &self.shared.source else {
            tracing::error!("no configuration source installed");
            return ServerMessage::error(CONFIG_UNAVAILABLE);
        };
        match source.snapshot().await {
            Ok(data) => ServerMessage::config(data),
            Err(e) => {
                tracing::error!(peer = %self.peer, error = %format!("{e:#}"), "configuration source failed");
                ServerMessage::error(CONFIG_UNAVAILABLE)
            }
        }
    }

    async fn reply<S>(
        &self,
        ws: &mut WebSocketStream<S>,
        message: &ServerMessage,
    ) -> Result<(), tungstenite::Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let text = message.to_json().unwrap_or_else(|e| {
            tracing::error!(peer = %self.peer, error = %e, "failed to encode reply");
            PROCESSING_ERROR_JSON.to_owned()
        });
        ws.send(Message::Text(text.into())).await
    }

    fn transition(&mut self, next: ConnectionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        tracing::debug!(peer = %self.peer, from = %self.state, to = %next, "state change");
        self.state = next;
    }
}

/// Next data frame, skipping control frames.
async fn next_payload<S>(ws: &mut WebSocketStream<S>) -> Incoming
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return Incoming::Text(text.as_str().to_owned()),
            Some(Ok(Message::Binary(data))) => {
                return match String::from_utf8(data.to_vec()) {
                    Ok(text) => Incoming::Text(text),
                    Err(_) => Incoming::Undecodable,
                };
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
            Some(Ok(Message::Close(_))) | None => return Incoming::Closed,
            Some(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed)) => {
                return Incoming::Closed;
            }
            Some(Err(e)) => return Incoming::Failed(e),
        }
    }
}

async fn send_json<S>(
    ws: &mut WebSocketStream<S>,
    message: &ServerMessage,
) -> Result<(), tungstenite::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let text = message.to_json().unwrap_or_else(|_| PROCESSING_ERROR_JSON.to_owned());
    ws.send(Message::Text(text.into())).await
}

/// Send our close frame, then give the peer a moment to answer it.
async fn close_transport<S>(ws: &mut WebSocketStream<S>, frame: Option<CloseFrame>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if ws.close(frame).await.is_err() {
        return;
    }
    let _ = time::timeout(CLOSE_LINGER, async {
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerSettings;
    use crate::registry::ConnectionRegistry;
    use crate::source::{ConfigSource, StaticSource};
    use botlink_core::{Credential, generate_token};
    use serde_json::{Value, json};
    use tokio::io::DuplexStream;

    fn shared(source: Option<Arc<dyn ConfigSource>>, handshake: Duration) -> Arc<Shared> {
        Arc::new(Shared {
            credential: Credential::new("secret", "pkp"),
            registry: ConnectionRegistry::new(),
            source,
            settings: ServerSettings {
                handshake_timeout: handshake,
                ..ServerSettings::default()
            },
        })
    }

    /// Spawn a handler on one end of an in-memory pipe and return a client
    /// WebSocket on the other.
    async fn connect(shared: Arc<Shared>) -> WebSocketStream<DuplexStream> {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let id = shared.registry.next_id();
        let handler = ConnectionHandler::new(shared, id, ([127, 0, 0, 1], 40000).into());
        tokio::spawn(handler.run(server_io));
        let (ws, _) = tokio_tungstenite::client_async("ws://localhost/bot", client_io)
            .await
            .unwrap();
        ws
    }

    async fn recv_json(ws: &mut WebSocketStream<DuplexStream>) -> Value {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    async fn send_text(ws: &mut WebSocketStream<DuplexStream>, text: &str) {
        ws.send(Message::Text(text.to_owned().into())).await.unwrap();
    }

    async fn login(ws: &mut WebSocketStream<DuplexStream>) {
        let auth = json!({
            "type": "auth",
            "token": generate_token("secret", "pkp"),
            "public_key_part": "pkp",
        });
        send_text(ws, &auth.to_string()).await;
        assert_eq!(recv_json(ws).await, json!({"type": "auth_result", "success": true}));
    }

    #[tokio::test]
    async fn silent_client_is_closed_with_policy_violation() {
        let shared = shared(None, Duration::from_millis(100));
        let mut ws = connect(shared.clone()).await;

        match ws.next().await.unwrap().unwrap() {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, CloseCode::Policy);
                assert_eq!(frame.reason.as_str(), "Authentication timed out");
            }
            other => panic!("expected close frame, got {other:?}"),
        }
        assert!(shared.registry.is_empty().await);
    }

    #[tokio::test]
    async fn first_message_must_be_auth() {
        let shared = shared(None, Duration::from_secs(5));
        let mut ws = connect(shared.clone()).await;

        send_text(&mut ws, r#"{"type":"ping"}"#).await;
        assert_eq!(
            recv_json(&mut ws).await,
            json!({"type": "auth_result", "success": false, "message": "Invalid message format"})
        );
        match ws.next().await.unwrap().unwrap() {
            Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Policy),
            other => panic!("expected close frame, got {other:?}"),
        }
        assert!(shared.registry.is_empty().await);
    }

    #[tokio::test]
    async fn second_auth_is_an_unknown_request() {
        let shared = shared(None, Duration::from_secs(5));
        let mut ws = connect(shared.clone()).await;
        login(&mut ws).await;

        send_text(&mut ws, r#"{"type":"auth","token":"x","public_key_part":"pkp"}"#).await;
        assert_eq!(
            recv_json(&mut ws).await,
            json!({"type": "error", "message": "Unknown message type: auth"})
        );
        assert_eq!(shared.registry.len().await, 1);
    }

    #[tokio::test]
    async fn binary_frames_are_read_as_text() {
        let shared = shared(None, Duration::from_secs(5));
        let mut ws = connect(shared).await;
        login(&mut ws).await;

        ws.send(Message::Binary(br#"{"type":"ping"}"#.to_vec().into())).await.unwrap();
        assert_eq!(recv_json(&mut ws).await, json!({"type": "pong"}));

        ws.send(Message::Binary(vec![0xff, 0xfe].into())).await.unwrap();
        let reply = recv_json(&mut ws).await;
        assert_eq!(reply["type"], "error");
        assert!(reply["message"].as_str().unwrap().starts_with("Invalid"));
    }

    #[tokio::test]
    async fn panicking_source_is_contained() {
        let source: Arc<dyn ConfigSource> = Arc::new(|| async {
            if true {
                panic!("collaborator bug");
            }
            Ok::<_, anyhow::Error>(Value::Null)
        });
        let shared = shared(Some(source), Duration::from_secs(5));
        let mut ws = connect(shared).await;
        login(&mut ws).await;

        send_text(&mut ws, r#"{"type":"get_config"}"#).await;
        assert_eq!(
            recv_json(&mut ws).await,
            json!({"type": "error", "message": "Error processing your request"})
        );

        send_text(&mut ws, r#"{"type":"ping"}"#).await;
        assert_eq!(recv_json(&mut ws).await, json!({"type": "pong"}));
    }

    #[tokio::test]
    async fn failing_source_reports_server_error() {
        let source: Arc<dyn ConfigSource> =
            Arc::new(|| async { Err::<Value, _>(anyhow::anyhow!("config file missing")) });
        let shared = shared(Some(source), Duration::from_secs(5));
        let mut ws = connect(shared).await;
        login(&mut ws).await;

        send_text(&mut ws, r#"{"type":"get_config"}"#).await;
        assert_eq!(
            recv_json(&mut ws).await,
            json!({"type": "error", "message": "Server error: cannot retrieve configuration"})
        );
    }

    #[tokio::test]
    async fn unregisters_when_peer_leaves() {
        let shared = shared(Some(Arc::new(StaticSource(json!({})))), Duration::from_secs(5));
        let mut ws = connect(shared.clone()).await;
        login(&mut ws).await;
        assert_eq!(shared.registry.len().await, 1);

        ws.close(None).await.unwrap();
        time::timeout(Duration::from_secs(5), async {
            while !shared.registry.is_empty().await {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("handler should unregister");
    }
}
