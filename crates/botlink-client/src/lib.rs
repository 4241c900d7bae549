//! Client for the botlink protocol.
//!
//! Connects, runs the shared-secret handshake and offers the two requests the
//! server understands. Anything else the server pushes (broadcasts) is
//! available through [`Client::recv_value`].

use botlink_core::{ClientMessage, ServerMessage, generate_token};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("invalid JSON from server: {0}")]
    Json(#[from] serde_json::Error),
    /// The handshake was refused.
    #[error("authentication rejected: {0}")]
    Rejected(String),
    /// The server answered a request with an `error` message.
    #[error("server error: {0}")]
    Server(String),
    #[error("unexpected reply: {0}")]
    Unexpected(String),
    #[error("connection closed")]
    Closed,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// An authenticated connection.
pub struct Client {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    /// Pushed messages that arrived while waiting for a reply.
    pending: VecDeque<Value>,
}

impl Client {
    /// Connect to `url` and authenticate with `secret` and `identifier`.
    pub async fn connect(url: &str, secret: &str, identifier: &str) -> ClientResult<Self> {
        let token = generate_token(secret, identifier);
        Self::connect_with_token(url, &token, identifier).await
    }

    /// Connect with a precomputed token.
    pub async fn connect_with_token(url: &str, token: &str, identifier: &str) -> ClientResult<Self> {
        let (ws, _) = tokio_tungstenite::connect_async(url).await?;
        let mut client = Self {
            ws,
            pending: VecDeque::new(),
        };

        client.send(&ClientMessage::auth(token, identifier)).await?;
        let reply = client.recv_value().await?.ok_or(ClientError::Closed)?;
        match serde_json::from_value::<ServerMessage>(reply)? {
            ServerMessage::AuthResult { success: true, .. } => {
                tracing::debug!(url, "authenticated");
                Ok(client)
            }
            ServerMessage::AuthResult { message, .. } => {
                Err(ClientError::Rejected(message.unwrap_or_default()))
            }
            other => Err(ClientError::Unexpected(format!("{other:?}"))),
        }
    }

    pub async fn send(&mut self, message: &ClientMessage) -> ClientResult<()> {
        self.send_text(&serde_json::to_string(message)?).await
    }

    /// Send a raw text frame.
    pub async fn send_text(&mut self, text: &str) -> ClientResult<()> {
        self.ws.send(Message::Text(text.to_owned().into())).await?;
        Ok(())
    }

    /// Next JSON message from the server, or `None` once it has closed.
    pub async fn recv_value(&mut self) -> ClientResult<Option<Value>> {
        if let Some(value) = self.pending.pop_front() {
            return Ok(Some(value));
        }
        self.read_frame().await
    }

    /// Next message from the server as a [`ServerMessage`].
    ///
    /// Broadcasts are free-form and usually do not decode; use
    /// [`Client::recv_value`] for those.
    pub async fn recv(&mut self) -> ClientResult<Option<ServerMessage>> {
        match self.recv_value().await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Fetch the host's configuration snapshot.
    ///
    /// Pushed messages that arrive while waiting are kept for
    /// [`Client::recv_value`]. The protocol has no request ids: a pushed
    /// `config`, or a pushed `error` carrying one of the texts the server
    /// answers `get_config` with, is taken as the reply.
    pub async fn get_config(&mut self) -> ClientResult<Value> {
        match self.request(&ClientMessage::GetConfig).await? {
            ServerMessage::Config { data } => Ok(data),
            other => Err(unexpected(other)),
        }
    }

    /// Ping the server. As with [`Client::get_config`], a pushed `pong` is
    /// indistinguishable from the reply.
    pub async fn ping(&mut self) -> ClientResult<()> {
        match self.request(&ClientMessage::Ping).await? {
            ServerMessage::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn close(mut self) -> ClientResult<()> {
        match self.ws.close(None).await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Send `request` and wait for its reply, queueing anything else.
    async fn request(&mut self, request: &ClientMessage) -> ClientResult<ServerMessage> {
        self.send(request).await?;
        loop {
            let value = self.read_frame().await?.ok_or(ClientError::Closed)?;
            if !is_reply_to(request, &value) {
                self.pending.push_back(value);
                continue;
            }
            return match serde_json::from_value(value)? {
                ServerMessage::Error { message } => Err(ClientError::Server(message)),
                reply => Ok(reply),
            };
        }
    }

    async fn read_frame(&mut self) -> ClientResult<Option<Value>> {
        loop {
            let text = match self.ws.next().await {
                Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                Some(Ok(Message::Binary(data))) => String::from_utf8_lossy(&data).into_owned(),
                Some(Ok(Message::Close(frame))) => {
                    if let Some(frame) = frame {
                        tracing::debug!(
                            code = u16::from(frame.code),
                            reason = frame.reason.as_str(),
                            "server closed connection"
                        );
                    }
                    return Ok(None);
                }
                Some(Ok(_)) => continue,
                Some(Err(tungstenite::Error::ConnectionClosed)) | None => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
            };
            return Ok(Some(serde_json::from_str(&text)?));
        }
    }
}

fn is_reply_to(request: &ClientMessage, value: &Value) -> bool {
    match value.get("type").and_then(Value::as_str) {
        Some("error") => value
            .get("message")
            .and_then(Value::as_str)
            .is_some_and(|message| request.reply_errors().contains(&message)),
        Some(kind) => kind == request.reply_kind(),
        None => false,
    }
}

fn unexpected(message: ServerMessage) -> ClientError {
    ClientError::Unexpected(format!("{message:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use botlink_core::{CONFIG_UNAVAILABLE, PROCESSING_ERROR};
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    type ServerSide = WebSocketStream<TcpStream>;

    /// Accept one connection, accept its `auth`, then run `script` on the
    /// server end. Returns the URL to connect to.
    async fn fake_server<F, Fut>(script: F) -> String
    where
        F: FnOnce(ServerSide) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            expect_request(&mut ws, "auth").await;
            push(&mut ws, json!({"type": "auth_result", "success": true})).await;
            script(ws).await;
        });
        url
    }

    async fn push(ws: &mut ServerSide, value: Value) {
        ws.send(Message::Text(value.to_string().into())).await.unwrap();
    }

    async fn expect_request(ws: &mut ServerSide, kind: &str) {
        let frame = ws.next().await.unwrap().unwrap();
        let value: Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
        assert_eq!(value["type"], kind);
    }

    #[tokio::test]
    async fn pushes_received_while_waiting_are_queued() {
        let url = fake_server(|mut ws| async move {
            expect_request(&mut ws, "ping").await;
            push(&mut ws, json!({"type": "status", "n": 1})).await;
            push(&mut ws, json!({"type": "pong"})).await;
            let _ = ws.next().await;
        })
        .await;

        let mut client = Client::connect(&url, "secret", "pkp").await.unwrap();
        client.ping().await.unwrap();
        assert_eq!(
            client.recv_value().await.unwrap(),
            Some(json!({"type": "status", "n": 1}))
        );
    }

    #[tokio::test]
    async fn pushed_error_is_not_taken_as_the_reply() {
        let url = fake_server(|mut ws| async move {
            expect_request(&mut ws, "ping").await;
            push(&mut ws, json!({"type": "error", "message": "maintenance"})).await;
            push(&mut ws, json!({"type": "pong"})).await;
            let _ = ws.next().await;
        })
        .await;

        let mut client = Client::connect(&url, "secret", "pkp").await.unwrap();
        client.ping().await.unwrap();
        assert_eq!(
            client.recv_value().await.unwrap(),
            Some(json!({"type": "error", "message": "maintenance"}))
        );
    }

    #[tokio::test]
    async fn error_reply_is_reported() {
        let url = fake_server(|mut ws| async move {
            expect_request(&mut ws, "get_config").await;
            push(&mut ws, json!({"type": "error", "message": CONFIG_UNAVAILABLE})).await;
            expect_request(&mut ws, "ping").await;
            push(&mut ws, json!({"type": "error", "message": PROCESSING_ERROR})).await;
            let _ = ws.next().await;
        })
        .await;

        let mut client = Client::connect(&url, "secret", "pkp").await.unwrap();
        let err = client.get_config().await.unwrap_err();
        assert!(matches!(err, ClientError::Server(ref m) if m == CONFIG_UNAVAILABLE), "got {err:?}");
        let err = client.ping().await.unwrap_err();
        assert!(matches!(err, ClientError::Server(ref m) if m == PROCESSING_ERROR), "got {err:?}");
    }

    #[tokio::test]
    async fn close_frame_ends_the_stream() {
        let url = fake_server(|mut ws| async move {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: "bye".into(),
            };
            ws.close(Some(frame)).await.unwrap();
            let _ = ws.next().await;
        })
        .await;

        let mut client = Client::connect(&url, "secret", "pkp").await.unwrap();
        assert_eq!(client.recv_value().await.unwrap(), None);
    }

    #[tokio::test]
    async fn closed_while_waiting_for_reply() {
        let url = fake_server(|mut ws| async move {
            expect_request(&mut ws, "ping").await;
            let _ = ws.close(None).await;
        })
        .await;

        let mut client = Client::connect(&url, "secret", "pkp").await.unwrap();
        assert!(matches!(client.ping().await, Err(ClientError::Closed)));
    }
}
