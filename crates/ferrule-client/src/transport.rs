//! Wire transport behind a trait so the runtime can be driven without a
//! socket in tests.

use std::pin::Pin;

use async_trait::async_trait;
use ferrule_core::Payload;
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, Request, header};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::debug;

use crate::errors::ClientError;
use crate::handshake::HandshakeRequest;

/// Unit of traffic between the runtime and a transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// Application message.
    Message(Payload),
    /// Close handshake.
    Close,
}

/// Outbound half of a connection.
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = ClientError> + Send>>;

/// Inbound half of a connection.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, ClientError>> + Send>>;

/// An established connection, split into its two directions.
pub struct Connection {
    /// Frames to the peer.
    pub sink: FrameSink,
    /// Frames from the peer. Ends when the peer hangs up.
    pub stream: FrameStream,
}

impl Connection {
    /// Pair a sink with a stream.
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Opens connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform the opening handshake for `request`.
    ///
    /// A peer that refuses the upgrade yields
    /// [`ClientError::HandshakeRejected`] carrying its HTTP status.
    async fn open(&self, request: &HandshakeRequest) -> Result<Connection, ClientError>;
}

/// WebSocket transport over `tokio-tungstenite`.
#[derive(Clone, Copy, Debug, Default)]
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, request: &HandshakeRequest) -> Result<Connection, ClientError> {
        let http_request = build_request(request)?;
        let (ws, response) = connect_async(http_request).await.map_err(map_connect_error)?;
        debug!(
            uri = request.target(),
            status = response.status().as_u16(),
            "websocket upgrade accepted"
        );

        let (ws_tx, ws_rx) = ws.split();
        let sink = ws_tx
            .sink_map_err(ClientError::transport)
            .with(|frame: Frame| future::ready(Ok::<_, ClientError>(to_message(frame))));
        let stream = ws_rx.filter_map(|msg| future::ready(from_message(msg)));
        Ok(Connection::new(Box::pin(sink), Box::pin(stream)))
    }
}

fn build_request(request: &HandshakeRequest) -> Result<Request<()>, ClientError> {
    let mut http_request = request
        .target()
        .into_client_request()
        .map_err(|e| ClientError::transport(format!("invalid target {}: {e}", request.target())))?;
    let headers = http_request.headers_mut();
    for (name, value) in request.headers() {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(ClientError::transport)?;
        let value = HeaderValue::from_str(value).map_err(ClientError::transport)?;
        let _ = headers.insert(name, value);
    }
    if let Some(origin) = request.origin() {
        let value = HeaderValue::from_str(origin).map_err(ClientError::transport)?;
        let _ = headers.insert(header::ORIGIN, value);
    }
    Ok(http_request)
}

fn map_connect_error(err: WsError) -> ClientError {
    match err {
        WsError::Http(response) => {
            let status = response.status();
            let reason = response
                .body()
                .as_deref()
                .and_then(|body| std::str::from_utf8(body).ok())
                .map(str::trim)
                .filter(|body| !body.is_empty())
                .map_or_else(
                    || status.canonical_reason().unwrap_or("upgrade refused").to_string(),
                    ToString::to_string,
                );
            ClientError::HandshakeRejected {
                status: status.as_u16(),
                reason,
            }
        }
        other => ClientError::transport(other),
    }
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Message(Payload::Text(text)) => Message::Text(text.into()),
        Frame::Message(Payload::Binary(data)) => Message::Binary(data),
        Frame::Close => Message::Close(None),
    }
}

fn from_message(msg: Result<Message, WsError>) -> Option<Result<Frame, ClientError>> {
    match msg {
        Ok(Message::Text(text)) => Some(Ok(Frame::Message(Payload::Text(text.to_string())))),
        Ok(Message::Binary(data)) => Some(Ok(Frame::Message(Payload::Binary(data)))),
        Ok(Message::Close(_)) => Some(Ok(Frame::Close)),
        Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
        Err(err) => Some(Err(ClientError::transport(err))),
    }
}
