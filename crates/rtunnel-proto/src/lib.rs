//! Reverse tunnel protocol definitions
//!
//! This crate defines the control-plane messages exchanged between relay,
//! agent and client, the newline-delimited JSON codec used on the control
//! stream, and the tag written at the head of every bridged data stream.

pub mod codec;
pub mod messages;

pub use codec::{read_stream_tag, write_stream_tag, CodecError, ControlCodec};
pub use messages::{ControlMessage, MessageType};

use std::time::Duration;

/// Maximum size of one encoded control message, newline excluded (8 KiB)
pub const MAX_CONTROL_MESSAGE_SIZE: usize = 8 * 1024;

/// Maximum length of a data-stream tag line
pub const MAX_STREAM_TAG_SIZE: usize = 128;

/// HTTP upgrade path for agents
pub const AGENT_PATH: &str = "/ws/agent";

/// HTTP upgrade path for clients
pub const CLIENT_PATH: &str = "/ws/client";

/// Unauthenticated liveness endpoint on the relay
pub const HEALTH_PATH: &str = "/health";

/// Header carrying the shared bearer token on the upgrade request
pub const TOKEN_HEADER: &str = "X-Tunnel-Token";

/// Environment variable consulted for the shared token
pub const TOKEN_ENV: &str = "TUNNEL_TOKEN";

/// Bound on opening/accepting the control stream after the handshake
pub const CONTROL_STREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on waiting for ACCEPT/REFUSE (client) or the agent stream (relay)
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on the agent's TCP connect to a target
pub const TARGET_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport keepalive ping interval
pub const PING_INTERVAL: Duration = Duration::from_secs(15);

/// Transport keepalive pong deadline
pub const PONG_TIMEOUT: Duration = Duration::from_secs(30);

/// Fixed delay between agent reconnect attempts
pub const AGENT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
