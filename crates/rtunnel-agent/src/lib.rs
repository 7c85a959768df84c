//! Tunnel agent
//!
//! Runs next to the private services. Keeps an outbound session to the relay,
//! registers under an id, and on each DIAL connects to an allowed target and
//! bridges it to a fresh tagged stream.

pub mod agent;
pub mod allowlist;
pub mod forwarder;

pub use agent::{Agent, AgentConfig, AgentError, AgentEvent, AgentState};
pub use allowlist::{Allowlist, DEFAULT_ALLOW_PREFIX};
pub use forwarder::{ForwarderError, TcpForwarder};
