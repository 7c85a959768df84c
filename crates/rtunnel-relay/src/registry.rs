//! Agent registry and pending-dial table
//!
//! Tracks which agents are connected and which client dials are waiting for
//! the agent's data stream. A dial is keyed by its `stream_id`; the agent's
//! tagged stream resolves it.

use chrono::{DateTime, Utc};
use rtunnel_transport::{MuxStream, Session};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// A registered agent and the session it is reachable on
#[derive(Debug, Clone)]
pub struct AgentRegistration {
    pub agent_id: String,
    /// Session id of the agent connection; distinguishes reconnects
    pub connection_id: String,
    pub session: Arc<Session>,
    pub registered_at: DateTime<Utc>,
}

impl AgentRegistration {
    pub fn new(agent_id: impl Into<String>, session: Arc<Session>) -> Self {
        Self {
            agent_id: agent_id.into(),
            connection_id: session.id().to_string(),
            session,
            registered_at: Utc::now(),
        }
    }
}

/// How a pending dial ended
#[derive(Debug)]
pub enum DialOutcome {
    /// The agent opened the tagged data stream
    Stream(MuxStream),
    /// The dial cannot complete; the reason is sent to the client
    Refused(String),
}

/// A client DIAL forwarded to an agent, waiting for the agent's stream
#[derive(Debug)]
pub struct PendingDial {
    pub stream_id: String,
    pub agent_id: String,
    pub agent_connection_id: String,
    pub client_connection_id: String,
    pub target_addr: String,
    pub responder: oneshot::Sender<DialOutcome>,
}

impl PendingDial {
    fn resolve(self, outcome: DialOutcome) {
        if self.responder.send(outcome).is_err() {
            debug!(stream_id = %self.stream_id, "Dial already abandoned");
        }
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    agents: HashMap<String, AgentRegistration>,
    pending: HashMap<String, PendingDial>,
}

/// Registry for connected agents and in-flight dials
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an agent, evicting any previous registration under the same
    /// id. The evicted registration is returned so its session can be closed.
    pub fn register_or_replace(&self, agent: AgentRegistration) -> Option<AgentRegistration> {
        let old = self.write().agents.insert(agent.agent_id.clone(), agent.clone());

        if let Some(ref replaced) = old {
            warn!(
                agent_id = %agent.agent_id,
                session = %agent.connection_id,
                old_session = %replaced.connection_id,
                old_registered_at = %replaced.registered_at,
                "Re-registered existing agent (evicting previous connection)"
            );
        } else {
            info!(
                agent_id = %agent.agent_id,
                session = %agent.connection_id,
                "Registered new agent"
            );
        }

        old
    }

    /// Remove the agent, but only while the entry still belongs to
    /// `connection_id`. A replaced connection leaving must not evict its
    /// successor.
    pub fn unregister(&self, agent_id: &str, connection_id: &str) -> bool {
        let mut inner = self.write();
        match inner.agents.get(agent_id) {
            Some(agent) if agent.connection_id == connection_id => {
                inner.agents.remove(agent_id);
                info!(agent_id = %agent_id, session = %connection_id, "Unregistered agent");
                true
            }
            Some(_) => {
                debug!(
                    agent_id = %agent_id,
                    session = %connection_id,
                    "Agent entry belongs to a newer connection, keeping it"
                );
                false
            }
            None => false,
        }
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentRegistration> {
        self.read().agents.get(agent_id).cloned()
    }

    /// Ids of all registered agents, sorted
    pub fn agent_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().agents.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn count(&self) -> usize {
        self.read().agents.len()
    }

    /// Track a dial. Fails, handing the dial back, if the stream id is
    /// already in flight.
    pub fn insert_pending(&self, dial: PendingDial) -> Result<(), PendingDial> {
        let mut inner = self.write();
        if inner.pending.contains_key(&dial.stream_id) {
            return Err(dial);
        }
        debug!(
            stream_id = %dial.stream_id,
            agent_id = %dial.agent_id,
            target_addr = %dial.target_addr,
            "Registered pending dial"
        );
        inner.pending.insert(dial.stream_id.clone(), dial);
        Ok(())
    }

    /// Remove a pending dial regardless of who owns it
    pub fn cancel_pending(&self, stream_id: &str) -> Option<PendingDial> {
        self.write().pending.remove(stream_id)
    }

    /// Remove a pending dial if it was forwarded on `agent_connection_id`
    pub fn claim_pending(&self, stream_id: &str, agent_connection_id: &str) -> Option<PendingDial> {
        let mut inner = self.write();
        match inner.pending.get(stream_id) {
            Some(dial) if dial.agent_connection_id == agent_connection_id => {
                inner.pending.remove(stream_id)
            }
            Some(dial) => {
                warn!(
                    stream_id = %stream_id,
                    agent_id = %dial.agent_id,
                    session = %agent_connection_id,
                    "Stream tag names a dial for a different agent connection"
                );
                None
            }
            None => None,
        }
    }

    /// Refuse every dial waiting on the given agent connection
    pub fn fail_pending_for_agent(&self, agent_connection_id: &str, reason: &str) -> usize {
        let failed = self.drain_pending(|dial| dial.agent_connection_id == agent_connection_id);
        let count = failed.len();
        for dial in failed {
            dial.resolve(DialOutcome::Refused(reason.to_string()));
        }
        count
    }

    /// Drop every dial requested by the given client connection
    pub fn cancel_pending_for_client(&self, client_connection_id: &str) -> usize {
        self.drain_pending(|dial| dial.client_connection_id == client_connection_id)
            .len()
    }

    /// Remove every agent and refuse every pending dial
    pub fn drain(&self, reason: &str) -> Vec<AgentRegistration> {
        let (agents, pending) = {
            let mut inner = self.write();
            (
                inner.agents.drain().map(|(_, agent)| agent).collect::<Vec<_>>(),
                inner.pending.drain().map(|(_, dial)| dial).collect::<Vec<_>>(),
            )
        };
        for dial in pending {
            dial.resolve(DialOutcome::Refused(reason.to_string()));
        }
        agents
    }

    pub fn pending_count(&self) -> usize {
        self.read().pending.len()
    }

    fn drain_pending(&self, matches: impl Fn(&PendingDial) -> bool) -> Vec<PendingDial> {
        let mut inner = self.write();
        let ids: Vec<String> = inner
            .pending
            .values()
            .filter(|dial| matches(dial))
            .map(|dial| dial.stream_id.clone())
            .collect();
        ids.iter()
            .filter_map(|id| inner.pending.remove(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(stream_id: &str, agent_conn: &str, client_conn: &str) -> (PendingDial, oneshot::Receiver<DialOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            PendingDial {
                stream_id: stream_id.to_string(),
                agent_id: "agent-1".to_string(),
                agent_connection_id: agent_conn.to_string(),
                client_connection_id: client_conn.to_string(),
                target_addr: "127.0.0.1:22".to_string(),
                responder: tx,
            },
            rx,
        )
    }

    #[test]
    fn test_duplicate_stream_id_is_rejected() {
        let registry = AgentRegistry::new();
        let (first, _rx1) = pending("s-1", "agent-conn", "client-conn");
        let (second, _rx2) = pending("s-1", "agent-conn", "client-conn");

        assert!(registry.insert_pending(first).is_ok());
        assert!(registry.insert_pending(second).is_err());
        assert_eq!(registry.pending_count(), 1);
    }

    #[test]
    fn test_claim_requires_matching_agent_connection() {
        let registry = AgentRegistry::new();
        let (dial, _rx) = pending("s-1", "agent-conn", "client-conn");
        registry.insert_pending(dial).unwrap();

        assert!(registry.claim_pending("s-1", "other-conn").is_none());
        assert_eq!(registry.pending_count(), 1);

        let claimed = registry.claim_pending("s-1", "agent-conn").unwrap();
        assert_eq!(claimed.target_addr, "127.0.0.1:22");
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_fail_pending_for_agent_refuses_waiters() {
        let registry = AgentRegistry::new();
        let (a, rx_a) = pending("s-a", "agent-conn", "client-conn");
        let (b, rx_b) = pending("s-b", "other-agent", "client-conn");
        registry.insert_pending(a).unwrap();
        registry.insert_pending(b).unwrap();

        assert_eq!(registry.fail_pending_for_agent("agent-conn", "Agent disconnected"), 1);

        match rx_a.await.unwrap() {
            DialOutcome::Refused(reason) => assert_eq!(reason, "Agent disconnected"),
            DialOutcome::Stream(_) => panic!("expected refusal"),
        }
        assert_eq!(registry.pending_count(), 1);

        assert_eq!(registry.cancel_pending_for_client("client-conn"), 1);
        assert!(rx_b.await.is_err());
    }

    #[tokio::test]
    async fn test_drain_refuses_everything() {
        let registry = AgentRegistry::new();
        let (dial, rx) = pending("s-1", "agent-conn", "client-conn");
        registry.insert_pending(dial).unwrap();

        assert!(registry.drain("Relay shutting down").is_empty());
        assert!(matches!(rx.await.unwrap(), DialOutcome::Refused(_)));
        assert_eq!(registry.pending_count(), 0);
    }
}
