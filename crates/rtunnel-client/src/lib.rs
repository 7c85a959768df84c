//! Tunnel client library
//!
//! [`TunnelClient`] asks the relay for streams to targets behind an agent.
//! [`TunnelListener`] exposes one such target on a local TCP port.

pub mod client;
pub mod listener;
pub mod reconnect;

pub use client::{ClientConfig, ClientError, TunnelClient};
pub use listener::{ListenerConfig, TunnelListener};
pub use reconnect::{ReconnectConfig, ReconnectManager};
