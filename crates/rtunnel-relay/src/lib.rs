//! Relay: rendezvous point between agents and clients
//!
//! Agents connect to `/ws/agent` and register under an id. Clients connect to
//! `/ws/client` and send DIAL requests naming an agent and a target address.
//! The relay forwards each dial to the agent, pairs the agent's tagged data
//! stream with a new stream toward the client, and bridges the two.

mod broker;
pub mod registry;
pub mod server;
pub mod tls;

pub use registry::{AgentRegistration, AgentRegistry, DialOutcome, PendingDial};
pub use server::AxumSocket;
pub use tls::{generate_self_signed_cert, load_or_generate_acceptor, SelfSignedCertificate};

use axum::Router;
use broker::Broker;
use rtunnel_proto::{MessageType, CONTROL_STREAM_TIMEOUT, DIAL_TIMEOUT};
use rtunnel_transport::{SessionConfig, TransportError};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Expected REGISTER, got {0}")]
    UnexpectedMessage(MessageType),

    #[error("Invalid token")]
    InvalidToken,

    #[error("Empty agent ID")]
    EmptyAgentId,

    #[error("Timed out waiting for REGISTER")]
    RegisterTimeout,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Registration failures the agent is told about with an ERROR message
    pub fn is_handshake_rejection(&self) -> bool {
        matches!(
            self,
            RelayError::UnexpectedMessage(_) | RelayError::InvalidToken | RelayError::EmptyAgentId
        )
    }
}

/// Certificate and key used for wss://
#[derive(Debug, Clone)]
pub struct TlsPaths {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address for the HTTP(S) server
    pub bind_addr: SocketAddr,

    /// Shared secret expected from agents and clients
    pub token: String,

    /// TLS certificate paths; `None` serves plain ws://
    pub tls: Option<TlsPaths>,

    /// Session tuning for accepted connections
    pub session: SessionConfig,

    /// How long an agent has to send REGISTER, and to tag a data stream
    pub register_timeout: Duration,

    /// How long a dial waits for the agent's data stream
    pub dial_timeout: Duration,
}

impl RelayConfig {
    pub fn new(bind_addr: SocketAddr, token: impl Into<String>) -> Self {
        Self {
            bind_addr,
            token: token.into(),
            tls: None,
            session: SessionConfig::default(),
            register_timeout: CONTROL_STREAM_TIMEOUT,
            dial_timeout: DIAL_TIMEOUT,
        }
    }

    pub fn with_tls(mut self, cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        self.tls = Some(TlsPaths {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        });
        self
    }

    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn with_register_timeout(mut self, timeout: Duration) -> Self {
        self.register_timeout = timeout;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }
}

/// Relay server
pub struct Relay {
    broker: Arc<Broker>,
    shutdown: CancellationToken,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        let shutdown = CancellationToken::new();
        Self {
            broker: Arc::new(Broker::new(config, shutdown.clone())),
            shutdown,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        self.broker.config()
    }

    /// The axum router serving `/health`, `/ws/agent` and `/ws/client`
    pub fn router(&self) -> Router {
        server::router(self.broker.clone())
    }

    /// Bind the configured address and serve until [`Relay::shutdown`]
    pub async fn run(&self) -> Result<(), RelayError> {
        let addr = self.config().bind_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| RelayError::Bind { addr, source })?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until [`Relay::shutdown`]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        let local_addr = listener.local_addr()?;

        match &self.config().tls {
            Some(paths) => {
                let acceptor = load_or_generate_acceptor(&paths.cert_path, &paths.key_path)?;
                info!("Relay listening on wss://{}", local_addr);
                server::serve_tls(listener, self.router(), acceptor, self.shutdown.clone()).await
            }
            None => {
                info!("Relay listening on ws://{} (no TLS)", local_addr);
                server::serve_plain(listener, self.router(), self.shutdown.clone()).await
            }
        }
    }

    /// Stop accepting connections and close every agent and client session
    pub fn shutdown(&self) {
        info!("Relay shutting down");
        self.broker.shutdown();
    }

    /// Ids of currently registered agents
    pub fn agent_ids(&self) -> Vec<String> {
        self.broker.registry().agent_ids()
    }

    pub fn registry(&self) -> &AgentRegistry {
        self.broker.registry()
    }
}
