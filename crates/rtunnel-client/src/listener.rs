//! Local TCP listener that forwards every accepted connection through the
//! relay to a fixed agent and target

use crate::client::{ClientConfig, ClientError, TunnelClient};
use crate::reconnect::{ReconnectConfig, ReconnectManager};
use rtunnel_transport::bridge;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for [`TunnelListener`]
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Local address to accept connections on
    pub local_addr: String,

    /// Agent every connection is routed through
    pub agent_id: String,

    /// Target address the agent dials
    pub target_addr: String,

    /// Relay connection settings
    pub client: ClientConfig,

    /// How long an accepted connection waits for a live relay session
    pub session_wait: Duration,

    /// Backoff between relay reconnect attempts
    pub reconnect: ReconnectConfig,
}

impl ListenerConfig {
    pub fn new(
        local_addr: impl Into<String>,
        agent_id: impl Into<String>,
        target_addr: impl Into<String>,
        client: ClientConfig,
    ) -> Self {
        Self {
            local_addr: local_addr.into(),
            agent_id: agent_id.into(),
            target_addr: target_addr.into(),
            client,
            session_wait: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn with_session_wait(mut self, wait: Duration) -> Self {
        self.session_wait = wait;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }
}

type CurrentClient = Option<Arc<TunnelClient>>;

/// Port-forwarding listener
pub struct TunnelListener {
    config: ListenerConfig,
    listener: TcpListener,
    current: watch::Sender<CurrentClient>,
    shutdown: CancellationToken,
}

impl TunnelListener {
    /// Bind the local address. Nothing is forwarded until [`TunnelListener::run`].
    pub async fn bind(config: ListenerConfig) -> Result<Self, ClientError> {
        if config.agent_id.is_empty() || config.target_addr.is_empty() {
            return Err(ClientError::InvalidConfig(
                "Agent ID and target address are required".to_string(),
            ));
        }

        let listener = TcpListener::bind(&config.local_addr).await?;
        let (current, _) = watch::channel(None);

        Ok(Self {
            config,
            listener,
            current,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ClientError> {
        Ok(self.listener.local_addr()?)
    }

    /// Whether a relay session is currently up
    pub fn has_session(&self) -> bool {
        self.current
            .borrow()
            .as_ref()
            .is_some_and(|client| !client.is_closed())
    }

    /// Accept and forward connections until [`TunnelListener::shutdown`]
    pub async fn run(&self) -> Result<(), ClientError> {
        info!(
            "Listening on {} → {} via agent {}",
            self.local_addr()?,
            self.config.target_addr,
            self.config.agent_id
        );

        tokio::join!(self.maintain_session(), self.accept_loop());

        info!("Listener stopped");
        Ok(())
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn maintain_session(&self) {
        let mut reconnect = ReconnectManager::new(self.config.reconnect.clone());

        loop {
            let connected = tokio::select! {
                result = TunnelClient::connect(self.config.client.clone()) => result,
                _ = self.shutdown.cancelled() => break,
            };

            match connected {
                Ok(client) => {
                    reconnect.reset();
                    let client = Arc::new(client);
                    self.current.send_replace(Some(client.clone()));

                    tokio::select! {
                        _ = client.closed() => warn!("Relay session lost"),
                        _ = self.shutdown.cancelled() => {
                            client.close();
                            self.current.send_replace(None);
                            break;
                        }
                    }
                    self.current.send_replace(None);
                }
                Err(e) => warn!("Failed to connect to relay: {}", e),
            }

            if !reconnect.wait(&self.shutdown).await {
                break;
            }
        }

        if let Some(client) = self.current.send_replace(None) {
            client.close();
        }
    }

    async fn accept_loop(&self) {
        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = self.shutdown.cancelled() => break,
            };

            let (socket, peer_addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept local connection: {}", e);
                    continue;
                }
            };
            debug!("Accepted local connection from {}", peer_addr);

            tokio::spawn(forward_connection(
                socket,
                peer_addr,
                self.current.subscribe(),
                self.config.agent_id.clone(),
                self.config.target_addr.clone(),
                self.config.session_wait,
            ));
        }
    }
}

impl Drop for TunnelListener {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn forward_connection(
    socket: TcpStream,
    peer_addr: SocketAddr,
    mut current: watch::Receiver<CurrentClient>,
    agent_id: String,
    target_addr: String,
    session_wait: Duration,
) {
    let waited = timeout(session_wait, async {
        current
            .wait_for(|client| client.as_ref().is_some_and(|c| !c.is_closed()))
            .await
            .map(|client| client.clone())
    })
    .await;

    let client = match waited {
        Ok(Ok(Some(client))) => client,
        _ => {
            warn!(
                "No relay session within {:?}, dropping connection from {}",
                session_wait, peer_addr
            );
            return;
        }
    };

    let stream = match client.request_stream(&agent_id, &target_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Connection from {} not forwarded: {}", peer_addr, e);
            return;
        }
    };

    match bridge(socket, stream).await {
        Ok(stats) => debug!(
            peer_addr = %peer_addr,
            bytes_to_relay = stats.a_to_b,
            bytes_from_relay = stats.b_to_a,
            "Connection closed"
        ),
        Err(e) => debug!(peer_addr = %peer_addr, "Connection ended with error: {}", e),
    }
}
