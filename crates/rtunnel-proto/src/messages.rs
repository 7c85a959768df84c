//! Control protocol message types

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Discriminant of a control message, serialized in upper case (`"DIAL"`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Register,
    Dial,
    Accept,
    Refuse,
    Ping,
    Pong,
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Register => "REGISTER",
            MessageType::Dial => "DIAL",
            MessageType::Accept => "ACCEPT",
            MessageType::Refuse => "REFUSE",
            MessageType::Ping => "PING",
            MessageType::Pong => "PONG",
            MessageType::Error => "ERROR",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line on the control stream.
///
/// Optional fields are omitted from the JSON when unset. Values are fixed at
/// construction; use the named constructors rather than building one by hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(rename = "type")]
    kind: MessageType,

    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    agent_id: Option<String>,

    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    stream_id: Option<String>,

    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    target_addr: Option<String>,

    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    token: Option<String>,

    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    error: Option<String>,
}

/// Incoming empty strings read as absent, same as the constructors
fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.filter(|value| !value.is_empty()))
}

/// Empty strings are treated as absent so they never reach the wire.
fn non_empty(value: impl Into<String>) -> Option<String> {
    let value = value.into();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

impl ControlMessage {
    fn bare(kind: MessageType) -> Self {
        Self {
            kind,
            agent_id: None,
            stream_id: None,
            target_addr: None,
            token: None,
            error: None,
        }
    }

    /// Agent → relay registration
    pub fn register(agent_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            agent_id: non_empty(agent_id),
            token: non_empty(token),
            ..Self::bare(MessageType::Register)
        }
    }

    /// Client → relay dial request. `stream_id` may be empty, in which case
    /// the relay assigns one.
    pub fn dial(
        agent_id: impl Into<String>,
        stream_id: impl Into<String>,
        target_addr: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: non_empty(agent_id),
            stream_id: non_empty(stream_id),
            target_addr: non_empty(target_addr),
            ..Self::bare(MessageType::Dial)
        }
    }

    /// Relay → agent dial forward; carries no agent id
    pub fn forward_dial(stream_id: impl Into<String>, target_addr: impl Into<String>) -> Self {
        Self {
            stream_id: non_empty(stream_id),
            target_addr: non_empty(target_addr),
            ..Self::bare(MessageType::Dial)
        }
    }

    pub fn accept(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: non_empty(stream_id),
            ..Self::bare(MessageType::Accept)
        }
    }

    pub fn refuse(stream_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            stream_id: non_empty(stream_id),
            error: non_empty(error),
            ..Self::bare(MessageType::Refuse)
        }
    }

    pub fn ping() -> Self {
        Self::bare(MessageType::Ping)
    }

    pub fn pong() -> Self {
        Self::bare(MessageType::Pong)
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            error: non_empty(error),
            ..Self::bare(MessageType::Error)
        }
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn agent_id(&self) -> Option<&str> {
        self.agent_id.as_deref()
    }

    pub fn stream_id(&self) -> Option<&str> {
        self.stream_id.as_deref()
    }

    pub fn target_addr(&self) -> Option<&str> {
        self.target_addr.as_deref()
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: &ControlMessage) -> (String, ControlMessage) {
        let json = serde_json::to_string(msg).unwrap();
        let parsed: ControlMessage = serde_json::from_str(&json).unwrap();
        (json, parsed)
    }

    #[test]
    fn test_register_roundtrip() {
        let msg = ControlMessage::register("test-agent", "test-token");
        let (json, parsed) = roundtrip(&msg);

        assert_eq!(parsed, msg);
        assert_eq!(parsed.kind(), MessageType::Register);
        assert_eq!(parsed.agent_id(), Some("test-agent"));
        assert_eq!(parsed.token(), Some("test-token"));
        assert!(!json.contains("stream_id"));
        assert!(!json.contains("target_addr"));
        assert!(!json.contains("error"));
    }

    #[test]
    fn test_dial_roundtrip() {
        let msg = ControlMessage::dial("test-agent", "stream-123", "127.0.0.1:22");
        let (json, parsed) = roundtrip(&msg);

        assert_eq!(parsed, msg);
        assert_eq!(parsed.stream_id(), Some("stream-123"));
        assert_eq!(parsed.target_addr(), Some("127.0.0.1:22"));
        assert!(!json.contains("token"));
    }

    #[test]
    fn test_dial_without_stream_id_omits_field() {
        let msg = ControlMessage::dial("test-agent", "", "127.0.0.1:22");
        let (json, parsed) = roundtrip(&msg);

        assert!(!json.contains("stream_id"));
        assert_eq!(parsed.stream_id(), None);
    }

    #[test]
    fn test_accept_roundtrip() {
        let msg = ControlMessage::accept("stream-123");
        let (json, parsed) = roundtrip(&msg);

        assert_eq!(parsed, msg);
        assert_eq!(json, r#"{"type":"ACCEPT","stream_id":"stream-123"}"#);
    }

    #[test]
    fn test_refuse_roundtrip() {
        let msg = ControlMessage::refuse("stream-9", "Agent not found");
        let (_, parsed) = roundtrip(&msg);

        assert_eq!(parsed, msg);
        assert_eq!(parsed.error_message(), Some("Agent not found"));
        assert_eq!(parsed.agent_id(), None);
    }

    #[test]
    fn test_error_roundtrip() {
        let msg = ControlMessage::error("Connection failed");
        let (json, parsed) = roundtrip(&msg);

        assert_eq!(parsed, msg);
        assert_eq!(json, r#"{"type":"ERROR","error":"Connection failed"}"#);
    }

    #[test]
    fn test_ping_pong_are_bare() {
        assert_eq!(
            serde_json::to_string(&ControlMessage::ping()).unwrap(),
            r#"{"type":"PING"}"#
        );
        assert_eq!(
            serde_json::to_string(&ControlMessage::pong()).unwrap(),
            r#"{"type":"PONG"}"#
        );
    }

    #[test]
    fn test_parses_foreign_json_with_missing_fields() {
        let parsed: ControlMessage =
            serde_json::from_str(r#"{"type":"DIAL","agent_id":"a","target_addr":"h:1"}"#)
                .unwrap();
        assert_eq!(parsed.kind(), MessageType::Dial);
        assert_eq!(parsed.stream_id(), None);
    }

    #[test]
    fn test_empty_fields_parse_as_absent() {
        let parsed: ControlMessage = serde_json::from_str(
            r#"{"type":"REGISTER","agent_id":"","token":"t","error":null}"#,
        )
        .unwrap();
        assert_eq!(parsed.kind(), MessageType::Register);
        assert_eq!(parsed.agent_id(), None);
        assert_eq!(parsed.token(), Some("t"));
        assert_eq!(parsed.error_message(), None);
        assert_eq!(parsed, ControlMessage::register("", "t"));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let result = serde_json::from_str::<ControlMessage>(r#"{"type":"HELLO"}"#);
        assert!(result.is_err());
    }
}
