//! Relay broker: agent registration, client dials and stream pairing

use rtunnel_proto::{read_stream_tag, write_stream_tag, ControlMessage, MessageType};
use rtunnel_transport::{bridge, MuxStream, Session};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::registry::{AgentRegistration, AgentRegistry, DialOutcome, PendingDial};
use crate::{RelayConfig, RelayError};

pub(crate) struct Broker {
    config: RelayConfig,
    registry: AgentRegistry,
    shutdown: CancellationToken,
}

impl Broker {
    pub(crate) fn new(config: RelayConfig, shutdown: CancellationToken) -> Self {
        Self {
            config,
            registry: AgentRegistry::new(),
            shutdown,
        }
    }

    pub(crate) fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub(crate) fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub(crate) fn token_matches(&self, presented: Option<&str>) -> bool {
        // An unset relay token authorizes nobody
        !self.config.token.is_empty() && presented == Some(self.config.token.as_str())
    }

    /// Close every agent session and refuse every pending dial
    pub(crate) fn shutdown(&self) {
        self.shutdown.cancel();
        for agent in self.registry.drain("Relay shutting down") {
            agent.session.close();
        }
    }

    /// Serve one agent connection from REGISTER until the session ends
    pub(crate) async fn handle_agent(self: Arc<Self>, session: Session) {
        let session = Arc::new(session);
        let connection_id = session.id().to_string();

        let agent_id = match self.await_registration(&session).await {
            Ok(agent_id) => agent_id,
            Err(e) => {
                warn!(session = %connection_id, "Agent registration rejected: {}", e);
                if e.is_handshake_rejection() {
                    let _ = session
                        .send_control(&ControlMessage::error(e.to_string()))
                        .await;
                }
                session.close();
                return;
            }
        };

        let registration = AgentRegistration::new(agent_id.clone(), session.clone());
        if let Some(evicted) = self.registry.register_or_replace(registration) {
            evicted.session.close();
        }

        tokio::select! {
            _ = self.agent_control_loop(&agent_id, &session) => {}
            _ = self.agent_stream_loop(&agent_id, &session) => {}
            _ = self.shutdown.cancelled() => {}
        }

        session.close();
        self.registry.unregister(&agent_id, &connection_id);
        let failed = self
            .registry
            .fail_pending_for_agent(&connection_id, "Agent disconnected");
        info!(
            agent_id = %agent_id,
            session = %connection_id,
            failed_dials = failed,
            "Agent disconnected"
        );
    }

    async fn await_registration(&self, session: &Session) -> Result<String, RelayError> {
        let msg = timeout(self.config.register_timeout, session.receive_control())
            .await
            .map_err(|_| RelayError::RegisterTimeout)??;

        if msg.kind() != MessageType::Register {
            return Err(RelayError::UnexpectedMessage(msg.kind()));
        }
        if !self.token_matches(msg.token()) {
            return Err(RelayError::InvalidToken);
        }
        match msg.agent_id() {
            Some(agent_id) if !agent_id.trim().is_empty() => Ok(agent_id.to_string()),
            _ => Err(RelayError::EmptyAgentId),
        }
    }

    async fn agent_control_loop(&self, agent_id: &str, session: &Session) {
        loop {
            let msg = match session.receive_control().await {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(agent_id = %agent_id, "Agent control receive error: {}", e);
                    return;
                }
            };

            match msg.kind() {
                MessageType::Ping => {
                    if session.send_control(&ControlMessage::pong()).await.is_err() {
                        return;
                    }
                }
                MessageType::Pong => debug!(agent_id = %agent_id, "Pong from agent"),
                MessageType::Refuse => {
                    let stream_id = msg.stream_id().unwrap_or_default();
                    let reason = msg.error_message().unwrap_or("Agent refused").to_string();
                    warn!(agent_id = %agent_id, stream_id = %stream_id, "Agent refused dial: {}", reason);

                    if let Some(dial) = self.registry.claim_pending(stream_id, session.id()) {
                        let _ = dial.responder.send(DialOutcome::Refused(reason));
                    }
                }
                MessageType::Error => {
                    warn!(
                        agent_id = %agent_id,
                        "Agent reported error: {}",
                        msg.error_message().unwrap_or("unknown")
                    );
                }
                other => {
                    warn!(agent_id = %agent_id, "Unexpected message from agent: {}", other);
                }
            }
        }
    }

    async fn agent_stream_loop(&self, agent_id: &str, session: &Arc<Session>) {
        loop {
            let stream = match session.accept_stream().await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(agent_id = %agent_id, "Agent stream accept ended: {}", e);
                    return;
                }
            };

            let registry = self.registry.clone();
            let tag_timeout = self.config.register_timeout;
            let agent_id = agent_id.to_string();
            let connection_id = session.id().to_string();

            tokio::spawn(async move {
                let mut stream = stream;
                let stream_id = match timeout(tag_timeout, read_stream_tag(&mut stream)).await {
                    Ok(Ok(tag)) => tag,
                    Ok(Err(e)) => {
                        warn!(agent_id = %agent_id, "Invalid data stream tag: {}", e);
                        return;
                    }
                    Err(_) => {
                        warn!(agent_id = %agent_id, "Timed out reading data stream tag");
                        return;
                    }
                };

                match registry.claim_pending(&stream_id, &connection_id) {
                    Some(dial) => {
                        debug!(agent_id = %agent_id, stream_id = %stream_id, "Paired agent stream");
                        let _ = dial.responder.send(DialOutcome::Stream(stream));
                    }
                    None => {
                        warn!(
                            agent_id = %agent_id,
                            stream_id = %stream_id,
                            "Dropping data stream with no matching dial"
                        );
                    }
                }
            });
        }
    }

    /// Serve one client connection until it disconnects
    pub(crate) async fn handle_client(self: Arc<Self>, session: Session) {
        let session = Arc::new(session);
        let connection_id = session.id().to_string();
        info!(session = %connection_id, "Client connected");

        loop {
            let msg = tokio::select! {
                msg = session.receive_control() => msg,
                _ = self.shutdown.cancelled() => break,
            };

            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(session = %connection_id, "Client control receive error: {}", e);
                    break;
                }
            };

            match msg.kind() {
                MessageType::Dial => {
                    tokio::spawn(self.clone().handle_dial(session.clone(), msg));
                }
                MessageType::Ping => {
                    if let Err(e) = session.send_control(&ControlMessage::pong()).await {
                        debug!(session = %connection_id, "Failed to send pong to client: {}", e);
                        break;
                    }
                }
                MessageType::Pong => {}
                MessageType::Error => {
                    warn!(
                        session = %connection_id,
                        "Client reported error: {}",
                        msg.error_message().unwrap_or("unknown")
                    );
                }
                other => {
                    warn!(session = %connection_id, "Unexpected message from client: {}", other);
                }
            }
        }

        session.close();
        self.registry.cancel_pending_for_client(&connection_id);
        info!(session = %connection_id, "Client disconnected");
    }

    async fn handle_dial(self: Arc<Self>, client: Arc<Session>, msg: ControlMessage) {
        let stream_id = msg
            .stream_id()
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let agent_id = msg.agent_id().unwrap_or_default().to_string();
        let target_addr = msg.target_addr().unwrap_or_default().to_string();

        info!(
            agent_id = %agent_id,
            target_addr = %target_addr,
            stream_id = %stream_id,
            "Dial request"
        );

        let (client_stream, agent_stream) =
            match self.establish(&client, &agent_id, &stream_id, &target_addr).await {
                Ok(pair) => pair,
                Err(reason) => {
                    warn!(agent_id = %agent_id, stream_id = %stream_id, "Dial refused: {}", reason);
                    let _ = client
                        .send_control(&ControlMessage::refuse(stream_id.as_str(), reason))
                        .await;
                    return;
                }
            };

        if let Err(e) = client
            .send_control(&ControlMessage::accept(stream_id.as_str()))
            .await
        {
            debug!(stream_id = %stream_id, "Failed to send ACCEPT: {}", e);
            return;
        }

        match bridge(client_stream, agent_stream).await {
            Ok(stats) => info!(
                agent_id = %agent_id,
                stream_id = %stream_id,
                bytes_to_agent = stats.a_to_b,
                bytes_to_client = stats.b_to_a,
                "Bridge finished"
            ),
            Err(e) => debug!(stream_id = %stream_id, "Bridge ended with error: {}", e),
        }
    }

    /// Forward the dial to the agent and pair its stream with a new client
    /// stream. The error is the reason sent back in REFUSE.
    async fn establish(
        &self,
        client: &Session,
        agent_id: &str,
        stream_id: &str,
        target_addr: &str,
    ) -> Result<(MuxStream, MuxStream), String> {
        let agent = self
            .registry
            .get(agent_id)
            .ok_or_else(|| "Agent not found".to_string())?;

        let (responder, outcome) = oneshot::channel();
        self.registry
            .insert_pending(PendingDial {
                stream_id: stream_id.to_string(),
                agent_id: agent_id.to_string(),
                agent_connection_id: agent.connection_id.clone(),
                client_connection_id: client.id().to_string(),
                target_addr: target_addr.to_string(),
                responder,
            })
            .map_err(|_| "Duplicate stream id".to_string())?;

        if let Err(e) = agent
            .session
            .send_control(&ControlMessage::forward_dial(stream_id, target_addr))
            .await
        {
            error!(agent_id = %agent_id, "Failed to send dial to agent: {}", e);
            self.registry.cancel_pending(stream_id);
            return Err("Failed to contact agent".to_string());
        }

        let agent_stream = match timeout(self.config.dial_timeout, outcome).await {
            Ok(Ok(DialOutcome::Stream(stream))) => stream,
            Ok(Ok(DialOutcome::Refused(reason))) => return Err(reason),
            Ok(Err(_)) => return Err("Failed to establish agent stream".to_string()),
            Err(_) => {
                self.registry.cancel_pending(stream_id);
                return Err("Timed out waiting for agent stream".to_string());
            }
        };

        let mut client_stream = client.open_stream().await.map_err(|e| {
            debug!(stream_id = %stream_id, "Failed to open client stream: {}", e);
            "Failed to open client stream".to_string()
        })?;
        write_stream_tag(&mut client_stream, stream_id)
            .await
            .map_err(|_| "Failed to open client stream".to_string())?;

        Ok((client_stream, agent_stream))
    }
}
