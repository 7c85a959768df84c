use crate::allowlist::Allowlist;
use crate::forwarder::{ForwarderError, TcpForwarder};
use rtunnel_proto::{
    write_stream_tag, ControlMessage, MessageType, AGENT_RECONNECT_DELAY, TARGET_CONNECT_TIMEOUT,
};
use rtunnel_transport::{dial_session, Session, TransportConfig, TransportError};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Errors that can occur in the agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Forwarding error: {0}")]
    Forwarder(#[from] ForwarderError),

    #[error("Relay rejected registration: {0}")]
    RegistrationRejected(String),
}

/// Connection state of the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Disconnected,
    Connecting,
    Registering,
    Active,
}

/// Inputs to the agent state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentEvent {
    /// A connection attempt starts
    Connect,
    /// The relay session and its control stream are up
    SessionEstablished,
    /// REGISTER was sent
    Registered,
    /// Any failure, or the session ending
    Disconnected,
}

impl AgentState {
    /// Next state after `event`. Events that make no sense in the current
    /// state leave it unchanged.
    pub fn next(self, event: AgentEvent) -> AgentState {
        match (self, event) {
            (_, AgentEvent::Disconnected) => AgentState::Disconnected,
            (AgentState::Disconnected, AgentEvent::Connect) => AgentState::Connecting,
            (AgentState::Connecting, AgentEvent::SessionEstablished) => AgentState::Registering,
            (AgentState::Registering, AgentEvent::Registered) => AgentState::Active,
            (state, _) => state,
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentState::Disconnected => "disconnected",
            AgentState::Connecting => "connecting",
            AgentState::Registering => "registering",
            AgentState::Active => "active",
        };
        f.write_str(name)
    }
}

/// Configuration for the agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Identifier the agent registers under
    pub agent_id: String,

    /// Full relay WebSocket URL, e.g. `wss://relay.example.com:8443/ws/agent`
    pub relay_url: String,

    /// Shared secret for the relay
    pub token: String,

    /// Target address prefixes this agent may dial
    pub allowlist: Allowlist,

    /// TLS and session settings for the relay connection
    pub transport: TransportConfig,

    /// Fixed delay between reconnect attempts
    pub reconnect_delay: Duration,

    /// Limit on dialing a target
    pub connect_timeout: Duration,
}

impl AgentConfig {
    pub fn new(
        agent_id: impl Into<String>,
        relay_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            relay_url: relay_url.into(),
            token: token.into(),
            allowlist: Allowlist::default(),
            transport: TransportConfig::default(),
            reconnect_delay: AGENT_RECONNECT_DELAY,
            connect_timeout: TARGET_CONNECT_TIMEOUT,
        }
    }

    pub fn with_allowlist(mut self, allowlist: Allowlist) -> Self {
        self.allowlist = allowlist;
        self
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// The tunnel agent - keeps a registered session with the relay and dials
/// allowed targets on request
pub struct Agent {
    config: AgentConfig,
    forwarder: Arc<TcpForwarder>,
    state: watch::Sender<AgentState>,
    shutdown: CancellationToken,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        if config.agent_id.is_empty() {
            return Err(AgentError::InvalidConfig(
                "Agent ID cannot be empty".to_string(),
            ));
        }
        if config.relay_url.is_empty() {
            return Err(AgentError::InvalidConfig(
                "Relay URL cannot be empty".to_string(),
            ));
        }
        if config.allowlist.is_empty() {
            tracing::warn!("Allow-list is empty, every dial will be refused");
        }

        let forwarder = Arc::new(TcpForwarder::new(
            config.allowlist.clone(),
            config.connect_timeout,
        ));
        let (state, _) = watch::channel(AgentState::Disconnected);

        Ok(Self {
            config,
            forwarder,
            state,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.config.agent_id
    }

    pub fn state(&self) -> AgentState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<AgentState> {
        self.state.subscribe()
    }

    fn apply(&self, event: AgentEvent) {
        self.state.send_if_modified(|state| {
            let next = state.next(event);
            if next == *state {
                return false;
            }
            tracing::debug!(
                agent_id = %self.config.agent_id,
                from = %state,
                to = %next,
                "Agent state change"
            );
            *state = next;
            true
        });
    }

    /// Stop the reconnect loop and close the live session
    pub fn shutdown(&self) {
        tracing::info!(agent_id = %self.config.agent_id, "Agent shutting down");
        self.shutdown.cancel();
    }

    /// Keep a relay session alive until [`Agent::shutdown`], reconnecting
    /// after a fixed delay whenever it fails
    pub async fn run(&self) -> Result<(), AgentError> {
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            match self.run_once().await {
                Ok(()) => tracing::info!(agent_id = %self.config.agent_id, "Relay session ended"),
                Err(e) => tracing::warn!(agent_id = %self.config.agent_id, "Agent error: {}", e),
            }

            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            tracing::info!(
                "Reconnecting in {}s...",
                self.config.reconnect_delay.as_secs_f32()
            );
            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                _ = self.shutdown.cancelled() => return Ok(()),
            }
        }
    }

    /// One connection lifetime: connect, register, serve dials until the
    /// session ends
    pub async fn run_once(&self) -> Result<(), AgentError> {
        let result = self.serve_session().await;
        self.apply(AgentEvent::Disconnected);
        result
    }

    async fn serve_session(&self) -> Result<(), AgentError> {
        self.apply(AgentEvent::Connect);
        tracing::info!(relay_url = %self.config.relay_url, "Connecting to relay");

        let session = tokio::select! {
            session = dial_session(&self.config.relay_url, &self.config.token, &self.config.transport) => session?,
            _ = self.shutdown.cancelled() => return Ok(()),
        };
        let session = Arc::new(session);
        self.apply(AgentEvent::SessionEstablished);

        session
            .send_control(&ControlMessage::register(
                self.config.agent_id.as_str(),
                self.config.token.as_str(),
            ))
            .await?;
        self.apply(AgentEvent::Registered);
        tracing::info!(
            agent_id = %self.config.agent_id,
            session = %session.id(),
            "Registered with relay"
        );

        let result = self.control_loop(&session).await;
        session.close();
        result
    }

    async fn control_loop(&self, session: &Arc<Session>) -> Result<(), AgentError> {
        let mut rejection = None;

        loop {
            let msg = tokio::select! {
                msg = session.receive_control() => msg,
                _ = self.shutdown.cancelled() => return Ok(()),
            };

            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    return Err(match rejection {
                        Some(reason) => AgentError::RegistrationRejected(reason),
                        None => e.into(),
                    })
                }
            };

            match msg.kind() {
                MessageType::Dial => {
                    let session = session.clone();
                    let forwarder = self.forwarder.clone();
                    tokio::spawn(async move {
                        handle_dial(session, forwarder, msg).await;
                    });
                }
                MessageType::Ping => {
                    session.send_control(&ControlMessage::pong()).await?;
                }
                MessageType::Pong => {
                    tracing::debug!("Pong from relay");
                }
                MessageType::Error => {
                    let reason = msg.error_message().unwrap_or("unknown").to_string();
                    tracing::error!(agent_id = %self.config.agent_id, "Relay error: {}", reason);
                    rejection = Some(reason);
                }
                other => {
                    tracing::debug!("Ignoring unexpected message: {}", other);
                }
            }
        }
    }
}

/// Serve one forwarded DIAL: dial the target, then open and tag a relay
/// stream and bridge the two. Failures before the stream exists are
/// reported with REFUSE.
async fn handle_dial(session: Arc<Session>, forwarder: Arc<TcpForwarder>, msg: ControlMessage) {
    let Some(stream_id) = msg.stream_id().map(str::to_string) else {
        tracing::warn!("DIAL without stream_id, ignoring");
        return;
    };
    let target_addr = msg.target_addr().unwrap_or_default().to_string();

    tracing::info!(
        stream_id = %stream_id,
        target_addr = %target_addr,
        "Dial request"
    );

    let remote = match forwarder.connect(&target_addr).await {
        Ok(remote) => remote,
        Err(e) => {
            tracing::warn!(stream_id = %stream_id, target_addr = %target_addr, "{}", e);
            let reason = match e {
                ForwarderError::AddressNotAllowed(_) => "Target not allowed".to_string(),
                other => format!("Failed to dial target: {}", other),
            };
            let _ = session
                .send_control(&ControlMessage::refuse(stream_id.as_str(), reason))
                .await;
            return;
        }
    };

    let mut stream = match session.open_stream().await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(stream_id = %stream_id, "Failed to open relay stream: {}", e);
            return;
        }
    };
    if let Err(e) = write_stream_tag(&mut stream, &stream_id).await {
        tracing::warn!(stream_id = %stream_id, "Failed to tag relay stream: {}", e);
        return;
    }

    if let Err(e) = forwarder
        .forward(&stream_id, &target_addr, stream, remote)
        .await
    {
        tracing::debug!(stream_id = %stream_id, "Forward ended with error: {}", e);
    }
}
