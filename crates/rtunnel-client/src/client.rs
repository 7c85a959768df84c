//! Programmatic tunnel client
//!
//! One relay session, many concurrent dials. A control task routes
//! ACCEPT/REFUSE replies by `stream_id` and answers PING; an accept task
//! reads the tag on every stream the relay opens and hands it to the waiting
//! [`TunnelClient::request_stream`] call.

use rtunnel_proto::{read_stream_tag, ControlMessage, MessageType, CONTROL_STREAM_TIMEOUT, DIAL_TIMEOUT};
use rtunnel_transport::{dial_session, MuxStream, Session, TransportConfig, TransportError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Dial refused: {reason}")]
    Refused { stream_id: String, reason: String },

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Relay session closed")]
    SessionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for a tunnel client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Full relay WebSocket URL, e.g. `wss://relay.example.com:8443/ws/client`
    pub relay_url: String,

    /// Shared secret for the relay
    pub token: String,

    /// TLS and session settings for the relay connection
    pub transport: TransportConfig,

    /// Bound on waiting for ACCEPT/REFUSE and the data stream
    pub dial_timeout: Duration,
}

impl ClientConfig {
    pub fn new(relay_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            token: token.into(),
            transport: TransportConfig::default(),
            dial_timeout: DIAL_TIMEOUT,
        }
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }
}

enum DialReply {
    Accepted,
    Refused(String),
}

/// In-flight dials keyed by stream id
#[derive(Default)]
struct Routes {
    replies: Mutex<HashMap<String, oneshot::Sender<DialReply>>>,
    streams: Mutex<HashMap<String, oneshot::Sender<MuxStream>>>,
}

impl Routes {
    fn replies(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<DialReply>>> {
        self.replies.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn streams(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<MuxStream>>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(
        &self,
        stream_id: &str,
        reply: oneshot::Sender<DialReply>,
        stream: oneshot::Sender<MuxStream>,
    ) {
        self.replies().insert(stream_id.to_string(), reply);
        self.streams().insert(stream_id.to_string(), stream);
    }

    fn remove(&self, stream_id: &str) {
        self.replies().remove(stream_id);
        self.streams().remove(stream_id);
    }

    fn reply(&self, stream_id: Option<&str>, reply: DialReply) {
        let Some(stream_id) = stream_id else {
            warn!("Dial reply without stream_id");
            return;
        };
        match self.replies().remove(stream_id) {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => debug!(stream_id = %stream_id, "Reply for unknown dial"),
        }
    }

    fn deliver(&self, stream_id: &str, stream: MuxStream) {
        match self.streams().remove(stream_id) {
            Some(tx) => {
                let _ = tx.send(stream);
            }
            None => warn!(stream_id = %stream_id, "Dropping stream for unknown dial"),
        }
    }

    /// Drop every waiter; their receivers observe a closed session
    fn clear(&self) {
        self.replies().clear();
        self.streams().clear();
    }
}

/// Client side of a relay session
pub struct TunnelClient {
    config: ClientConfig,
    session: Arc<Session>,
    routes: Arc<Routes>,
    tasks: CancellationToken,
}

impl TunnelClient {
    /// Connect to the relay and start the control and accept tasks
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        if config.relay_url.is_empty() {
            return Err(ClientError::InvalidConfig(
                "Relay URL cannot be empty".to_string(),
            ));
        }

        info!(relay_url = %config.relay_url, "Connecting to relay");
        let session = Arc::new(
            dial_session(&config.relay_url, &config.token, &config.transport).await?,
        );
        info!(session = %session.id(), "Connected to relay");

        let routes = Arc::new(Routes::default());
        let tasks = CancellationToken::new();

        tokio::spawn(control_loop(session.clone(), routes.clone(), tasks.clone()));
        tokio::spawn(accept_loop(session.clone(), routes.clone(), tasks.clone()));

        Ok(Self {
            config,
            session,
            routes,
            tasks,
        })
    }

    /// Ask the relay for a stream to `target_addr` through `agent_id`.
    ///
    /// Returns once the relay has accepted the dial and the tagged data
    /// stream has arrived, or fails with the relay's refusal reason or a
    /// timeout.
    pub async fn request_stream(
        &self,
        agent_id: &str,
        target_addr: &str,
    ) -> Result<MuxStream, ClientError> {
        if self.session.is_closed() {
            return Err(ClientError::SessionClosed);
        }

        let stream_id = Uuid::new_v4().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        let (stream_tx, stream_rx) = oneshot::channel();
        self.routes.insert(&stream_id, reply_tx, stream_tx);

        let result = self
            .dial(agent_id, target_addr, &stream_id, reply_rx, stream_rx)
            .await;
        self.routes.remove(&stream_id);

        match &result {
            Ok(_) => debug!(stream_id = %stream_id, target_addr = %target_addr, "Stream established"),
            Err(e) => warn!(stream_id = %stream_id, target_addr = %target_addr, "Dial failed: {}", e),
        }
        result
    }

    async fn dial(
        &self,
        agent_id: &str,
        target_addr: &str,
        stream_id: &str,
        reply_rx: oneshot::Receiver<DialReply>,
        stream_rx: oneshot::Receiver<MuxStream>,
    ) -> Result<MuxStream, ClientError> {
        self.session
            .send_control(&ControlMessage::dial(agent_id, stream_id, target_addr))
            .await?;

        let deadline = Instant::now() + self.config.dial_timeout;

        let reply = timeout_at(deadline, reply_rx)
            .await
            .map_err(|_| ClientError::Timeout("waiting for dial reply".to_string()))?
            .map_err(|_| ClientError::SessionClosed)?;

        if let DialReply::Refused(reason) = reply {
            return Err(ClientError::Refused {
                stream_id: stream_id.to_string(),
                reason,
            });
        }

        timeout_at(deadline, stream_rx)
            .await
            .map_err(|_| ClientError::Timeout("waiting for data stream".to_string()))?
            .map_err(|_| ClientError::SessionClosed)
    }

    pub fn session_id(&self) -> &str {
        self.session.id()
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    /// Resolves once the relay session has ended
    pub async fn closed(&self) {
        self.session.closed().await
    }

    /// Stop the background tasks and close the relay session
    pub fn close(&self) {
        self.tasks.cancel();
        self.session.close();
    }
}

impl Drop for TunnelClient {
    fn drop(&mut self) {
        self.close();
    }
}

async fn control_loop(session: Arc<Session>, routes: Arc<Routes>, cancel: CancellationToken) {
    loop {
        let msg = tokio::select! {
            msg = session.receive_control() => msg,
            _ = cancel.cancelled() => break,
        };

        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Control stream ended: {}", e);
                break;
            }
        };

        match msg.kind() {
            MessageType::Accept => routes.reply(msg.stream_id(), DialReply::Accepted),
            MessageType::Refuse => {
                let reason = msg.error_message().unwrap_or("Dial refused").to_string();
                routes.reply(msg.stream_id(), DialReply::Refused(reason));
            }
            MessageType::Ping => {
                if session.send_control(&ControlMessage::pong()).await.is_err() {
                    break;
                }
            }
            MessageType::Pong => debug!("Pong from relay"),
            MessageType::Error => {
                warn!("Relay error: {}", msg.error_message().unwrap_or("unknown"));
            }
            other => debug!("Ignoring unexpected message: {}", other),
        }
    }

    session.close();
    routes.clear();
}

async fn accept_loop(session: Arc<Session>, routes: Arc<Routes>, cancel: CancellationToken) {
    loop {
        let stream = tokio::select! {
            stream = session.accept_stream() => stream,
            _ = cancel.cancelled() => break,
        };

        let mut stream = match stream {
            Ok(stream) => stream,
            Err(_) => break,
        };

        let routes = routes.clone();
        tokio::spawn(async move {
            match timeout(CONTROL_STREAM_TIMEOUT, read_stream_tag(&mut stream)).await {
                Ok(Ok(stream_id)) => routes.deliver(&stream_id, stream),
                Ok(Err(e)) => warn!("Failed to read stream tag: {}", e),
                Err(_) => warn!("Timed out reading stream tag"),
            }
        });
    }

    routes.clear();
}
