//! Multiplexed session transport over WebSocket
//!
//! One WebSocket connection carries a [`Session`]: many independent
//! bidirectional byte streams plus a dedicated control stream used for
//! newline-delimited JSON control messages.
//!
//! # Stream Multiplexing
//!
//! WebSocket has no native stream multiplexing, so every binary message is
//! prefixed with:
//! - 4 bytes: stream ID (big-endian u32)
//! - 1 byte: frame kind (0=data, 1=open, 2=fin)
//! - Rest: payload
//!
//! The side that dials the WebSocket opens odd stream ids, the side that
//! accepted it opens even ones. Liveness is checked with WebSocket ping/pong.

pub mod bridge;
pub mod config;
pub mod connector;
pub mod session;
pub mod stream;

#[cfg(test)]
mod tests;

pub use bridge::{bridge, BridgeStats};
pub use config::{
    build_tls_acceptor, ensure_crypto_provider, load_certs, load_private_key, SessionConfig,
    TransportConfig,
};
pub use connector::{connect_websocket, dial_session, ClientWebSocket};
pub use session::{ConnectionStats, Role, Session};
pub use stream::{MuxStream, STREAM_WINDOW};

use bytes::Bytes;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use rtunnel_proto::CodecError;
use std::pin::Pin;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Session closed")]
    SessionClosed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Timeout: {0}")]
    Timeout(&'static str),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),
}

impl From<CodecError> for TransportError {
    fn from(err: CodecError) -> Self {
        TransportError::ProtocolError(err.to_string())
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

/// A WebSocket message as seen by the session, independent of the
/// WebSocket library that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close,
}

impl WireMessage {
    pub(crate) fn len(&self) -> usize {
        match self {
            WireMessage::Binary(data) | WireMessage::Ping(data) | WireMessage::Pong(data) => {
                data.len()
            }
            WireMessage::Close => 0,
        }
    }
}

pub type WireSink = Pin<Box<dyn Sink<WireMessage, Error = TransportError> + Send>>;
pub type WireSource = Pin<Box<dyn Stream<Item = TransportResult<WireMessage>> + Send>>;

/// An established WebSocket that a [`Session`] can run over.
///
/// Implemented for tokio-tungstenite streams here; server frameworks wrap
/// their own socket type.
pub trait WireSocket: Send + 'static {
    fn into_wire(self) -> (WireSink, WireSource);
}

impl<S> WireSocket for tokio_tungstenite::WebSocketStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn into_wire(self) -> (WireSink, WireSource) {
        let (sink, source) = StreamExt::split(self);

        let sink = sink
            .sink_map_err(|e| TransportError::WebSocket(e.to_string()))
            .with(|msg: WireMessage| {
                future::ready(Ok::<_, TransportError>(match msg {
                    WireMessage::Binary(data) => Message::Binary(data.to_vec()),
                    WireMessage::Ping(data) => Message::Ping(data.to_vec()),
                    WireMessage::Pong(data) => Message::Pong(data.to_vec()),
                    WireMessage::Close => Message::Close(None),
                }))
            });

        let source = source.filter_map(|result| {
            future::ready(match result {
                Ok(Message::Binary(data)) => Some(Ok(WireMessage::Binary(Bytes::from(data)))),
                Ok(Message::Ping(data)) => Some(Ok(WireMessage::Ping(Bytes::from(data)))),
                Ok(Message::Pong(data)) => Some(Ok(WireMessage::Pong(Bytes::from(data)))),
                Ok(Message::Close(_)) => Some(Ok(WireMessage::Close)),
                Ok(Message::Text(_)) | Ok(Message::Frame(_)) => None,
                Err(e) => Some(Err(TransportError::WebSocket(e.to_string()))),
            })
        });

        (Box::pin(sink), Box::pin(source))
    }
}
