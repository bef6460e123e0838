//! JSON protocol messages.
//!
//! The tag field `msg_type` selects the variant. Decoding is lenient about the
//! names older servers use (`version`, `class_session_id`,
//! `join_class_session`), while encoding always emits the current names.
//!
//! # Invariants
//!
//! - Outbound messages (auth, join, event) always carry a correlation id.
//! - An unknown `msg_type` decodes to [`ProtocolMessage::Unrecognized`] rather
//!   than failing, so one odd push from the server never tears down a session.
//!   The received line is kept verbatim and re-encodes to itself.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{correlation::CorrelationId, error::ProtocolError};

/// Protocol version sent on every outbound message.
pub const DEFAULT_PROTOCOL_VERSION: &str = "2.0";

/// Maximum encoded length of one message line, in bytes.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Tag field selecting the message kind.
const TAG_FIELD: &str = "msg_type";

/// Tags that decode to a typed variant, aliases included.
const KNOWN_TAGS: [&str; 6] =
    ["auth", "join_session", "join_class_session", "event", "ack", "class_session_aggregate"];

/// Authenticate the connection with an opaque signed token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Auth {
    /// Protocol version
    #[serde(default, alias = "version")]
    pub protocol_version: String,
    /// Session correlation id
    pub correlation_id: CorrelationId,
    /// Signed credential, opaque to the harness
    pub token: String,
}

/// Join the shared logical session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinSession {
    /// Protocol version
    #[serde(default, alias = "version")]
    pub protocol_version: String,
    /// Session correlation id
    pub correlation_id: CorrelationId,
    /// Shared session to join
    #[serde(alias = "class_session_id")]
    pub session_id: String,
}

/// Kind of domain event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// Participant entered the joined session
    #[serde(rename = "class_enter", alias = "enter")]
    Enter,
    /// Any event kind this harness does not emit itself
    #[serde(other, rename = "other")]
    Other,
}

impl EventType {
    /// Wire name of the event kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enter => "class_enter",
            Self::Other => "other",
        }
    }
}

/// Domain event tied to a joined session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Protocol version
    #[serde(default, alias = "version")]
    pub protocol_version: String,
    /// Session correlation id
    pub correlation_id: CorrelationId,
    /// Event kind
    pub event_type: EventType,
    /// Session the event belongs to
    #[serde(alias = "class_session_id")]
    pub session_id: String,
}

/// Step acknowledged by an [`Ack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckType {
    /// Acknowledges `auth`
    Auth,
    /// Acknowledges `join_session`
    #[serde(alias = "join_class_session")]
    JoinSession,
    /// Acknowledges `event`
    Event,
    /// Ack for a step this harness never sends
    #[serde(other)]
    Other,
}

impl AckType {
    /// Wire name of the acknowledged step.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::JoinSession => "join_session",
            Self::Event => "event",
            Self::Other => "other",
        }
    }
}

/// Server acknowledgement of one client step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Protocol version
    #[serde(default, alias = "version")]
    pub protocol_version: String,
    /// Echoed correlation id, if the server sent one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    /// Step being acknowledged
    pub ack_type: AckType,
    /// Whether the step succeeded
    pub ok: bool,
    /// Session the step concerned, if any
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "class_session_id")]
    pub session_id: Option<String>,
    /// Rejection reason when `ok` is false
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Live aggregate counters pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatePush {
    /// Protocol version
    #[serde(default, alias = "version")]
    pub protocol_version: String,
    /// Correlation id of the event that triggered the push, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    /// Session the counters describe
    #[serde(alias = "class_session_id")]
    pub session_id: String,
    /// Live joined connections
    pub joined_count: u64,
    /// Live connections that emitted the enter event
    pub enter_event_count: u64,
}

/// Literal copy of an aggregate push as the client received it.
///
/// Snapshots are never recomputed by the harness; they are the only view it
/// has of the server's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    /// Session the counters describe
    pub session_id: String,
    /// Live joined connections
    pub joined_count: u64,
    /// Live connections that emitted the enter event
    pub enter_event_count: u64,
}

impl From<&AggregatePush> for AggregateSnapshot {
    fn from(push: &AggregatePush) -> Self {
        Self {
            session_id: push.session_id.clone(),
            joined_count: push.joined_count,
            enter_event_count: push.enter_event_count,
        }
    }
}

/// All protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msg_type", rename_all = "snake_case")]
pub enum ProtocolMessage {
    /// Client authentication
    Auth(Auth),
    /// Client joins a session
    #[serde(alias = "join_class_session")]
    JoinSession(JoinSession),
    /// Client domain event
    Event(DomainEvent),
    /// Server acknowledgement
    Ack(Ack),
    /// Server aggregate push
    #[serde(rename = "class_session_aggregate")]
    Aggregate(AggregatePush),
    /// Message with a `msg_type` this harness does not know
    #[serde(skip)]
    Unrecognized(UnknownMessage),
}

/// A received line that is not one of the typed messages.
///
/// Keeps the raw text plus whatever ids could be read from it, so the line
/// still reaches the timeline and its ids still count as evidence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMessage {
    /// `msg_type` as sent, `None` when the line had no string tag
    pub msg_type: Option<String>,
    /// `correlation_id` field, if present
    pub correlation_id: Option<CorrelationId>,
    /// `session_id` (or `class_session_id`) field, if present
    pub session_id: Option<String>,
    /// The line exactly as received
    pub raw: String,
}

impl UnknownMessage {
    /// Salvage what can be read from `line`. Never fails; a line that is not
    /// a JSON object keeps only its raw text.
    pub fn from_line(line: impl Into<String>) -> Self {
        let raw = line.into();
        match serde_json::from_str::<Value>(&raw) {
            Ok(value) => Self::from_value(raw, &value),
            Err(_) => Self { msg_type: None, correlation_id: None, session_id: None, raw },
        }
    }

    fn from_value(raw: String, value: &Value) -> Self {
        let field = |name: &str| value.get(name).and_then(Value::as_str).map(str::to_string);
        Self {
            msg_type: field(TAG_FIELD),
            correlation_id: field("correlation_id").map(CorrelationId::from),
            session_id: field("session_id").or_else(|| field("class_session_id")),
            raw,
        }
    }
}

impl ProtocolMessage {
    /// Wire name of the message kind.
    pub fn msg_type(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth",
            Self::JoinSession(_) => "join_session",
            Self::Event(_) => "event",
            Self::Ack(_) => "ack",
            Self::Aggregate(_) => "class_session_aggregate",
            Self::Unrecognized(_) => "unrecognized",
        }
    }

    /// Correlation id carried by the message, if any.
    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        match self {
            Self::Auth(m) => Some(&m.correlation_id),
            Self::JoinSession(m) => Some(&m.correlation_id),
            Self::Event(m) => Some(&m.correlation_id),
            Self::Ack(m) => m.correlation_id.as_ref(),
            Self::Aggregate(m) => m.correlation_id.as_ref(),
            Self::Unrecognized(m) => m.correlation_id.as_ref(),
        }
    }

    /// Business session identifier carried by the message, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::JoinSession(m) => Some(&m.session_id),
            Self::Event(m) => Some(&m.session_id),
            Self::Ack(m) => m.session_id.as_deref(),
            Self::Aggregate(m) => Some(&m.session_id),
            Self::Unrecognized(m) => m.session_id.as_deref(),
            Self::Auth(_) => None,
        }
    }

    /// The ack payload, if this is a successful or failed ack.
    pub fn as_ack(&self) -> Option<&Ack> {
        match self {
            Self::Ack(ack) => Some(ack),
            _ => None,
        }
    }

    /// The aggregate payload, if this is an aggregate push.
    pub fn as_aggregate(&self) -> Option<&AggregatePush> {
        match self {
            Self::Aggregate(push) => Some(push),
            _ => None,
        }
    }

    /// Whether this is a successful ack of the given step.
    pub fn is_ok_ack(&self, ack_type: AckType) -> bool {
        self.as_ack().is_some_and(|ack| ack.ack_type == ack_type && ack.ok)
    }

    /// Encode as a single JSON line (without the trailing newline).
    ///
    /// An unrecognized message encodes to the line it was decoded from.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let line = match self {
            Self::Unrecognized(m) => m.raw.clone(),
            _ => serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))?,
        };
        if line.len() > MAX_LINE_LENGTH {
            return Err(ProtocolError::TooLong { len: line.len(), max: MAX_LINE_LENGTH });
        }
        Ok(line)
    }

    /// Decode one JSON line.
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        if line.len() > MAX_LINE_LENGTH {
            return Err(ProtocolError::TooLong { len: line.len(), max: MAX_LINE_LENGTH });
        }
        let value: Value =
            serde_json::from_str(line).map_err(|e| ProtocolError::Decode(e.to_string()))?;
        match value.get(TAG_FIELD).and_then(Value::as_str) {
            Some(tag) if !KNOWN_TAGS.contains(&tag) => {
                Ok(Self::Unrecognized(UnknownMessage::from_value(line.to_string(), &value)))
            },
            _ => serde_json::from_value(value).map_err(|e| ProtocolError::Decode(e.to_string())),
        }
    }
}

/// Builds outbound messages for one client session.
///
/// Holds the protocol version and correlation id so every message the session
/// emits carries the same pair.
#[derive(Debug, Clone)]
pub struct Envelope {
    protocol_version: String,
    correlation_id: CorrelationId,
}

impl Envelope {
    /// Create an envelope for a session.
    pub fn new(protocol_version: impl Into<String>, correlation_id: CorrelationId) -> Self {
        Self { protocol_version: protocol_version.into(), correlation_id }
    }

    /// Correlation id stamped on every message.
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Build an `auth` message.
    pub fn auth(&self, token: impl Into<String>) -> ProtocolMessage {
        ProtocolMessage::Auth(Auth {
            protocol_version: self.protocol_version.clone(),
            correlation_id: self.correlation_id.clone(),
            token: token.into(),
        })
    }

    /// Build a `join_session` message.
    pub fn join(&self, session_id: impl Into<String>) -> ProtocolMessage {
        ProtocolMessage::JoinSession(JoinSession {
            protocol_version: self.protocol_version.clone(),
            correlation_id: self.correlation_id.clone(),
            session_id: session_id.into(),
        })
    }

    /// Build an `event` message.
    pub fn event(&self, event_type: EventType, session_id: impl Into<String>) -> ProtocolMessage {
        ProtocolMessage::Event(DomainEvent {
            protocol_version: self.protocol_version.clone(),
            correlation_id: self.correlation_id.clone(),
            event_type,
            session_id: session_id.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn envelope() -> Envelope {
        Envelope::new(DEFAULT_PROTOCOL_VERSION, CorrelationId::from("c-1"))
    }

    #[test]
    fn auth_encodes_with_tag_first() {
        let line = envelope().auth("tok").encode().unwrap();
        insta::assert_snapshot!(
            line,
            @r#"{"msg_type":"auth","protocol_version":"2.0","correlation_id":"c-1","token":"tok"}"#
        );
    }

    #[test]
    fn event_encodes_enter_as_class_enter() {
        let line = envelope().event(EventType::Enter, "s-1").encode().unwrap();
        insta::assert_snapshot!(
            line,
            @r#"{"msg_type":"event","protocol_version":"2.0","correlation_id":"c-1","event_type":"class_enter","session_id":"s-1"}"#
        );
    }

    #[test]
    fn decodes_legacy_field_names() {
        let line = r#"{"msg_type":"ack","version":"pr-2.0.0","correlation_id":"c-9",
            "ack_type":"join_class_session","ok":true,"class_session_id":"s-7"}"#;
        let msg = ProtocolMessage::decode(line).unwrap();

        assert!(msg.is_ok_ack(AckType::JoinSession));
        assert_eq!(msg.session_id(), Some("s-7"));
        assert_eq!(msg.correlation_id().map(CorrelationId::as_str), Some("c-9"));
    }

    #[test]
    fn decodes_aggregate_push() {
        let line = r#"{"msg_type":"class_session_aggregate","protocol_version":"2.0",
            "session_id":"s-1","joined_count":2,"enter_event_count":1}"#;
        let msg = ProtocolMessage::decode(line).unwrap();
        let push = msg.as_aggregate().unwrap();

        assert_eq!(push.joined_count, 2);
        assert_eq!(push.enter_event_count, 1);
        assert!(push.correlation_id.is_none());
        assert_eq!(
            AggregateSnapshot::from(push),
            AggregateSnapshot {
                session_id: "s-1".to_string(),
                joined_count: 2,
                enter_event_count: 1
            }
        );
    }

    #[test]
    fn unknown_msg_type_is_unrecognized() {
        let line = r#"{"msg_type":"presence","who":"u9"}"#;
        let msg = ProtocolMessage::decode(line).unwrap();
        assert_eq!(msg.msg_type(), "unrecognized");
        assert!(msg.correlation_id().is_none());
        assert_eq!(msg.encode().unwrap(), line);
    }

    #[test]
    fn unknown_msg_type_keeps_its_ids() {
        let line = r#"{"msg_type":"error","correlation_id":"c-9","class_session_id":"s-9","reason":"busy"}"#;
        let msg = ProtocolMessage::decode(line).unwrap();

        assert!(matches!(&msg, ProtocolMessage::Unrecognized(u) if u.msg_type.as_deref() == Some("error")));
        assert_eq!(msg.correlation_id().map(CorrelationId::as_str), Some("c-9"));
        assert_eq!(msg.session_id(), Some("s-9"));
    }

    #[test]
    fn salvaged_line_keeps_raw_text() {
        let unknown = UnknownMessage::from_line("{not json");
        assert_eq!(unknown.raw, "{not json");
        assert!(unknown.msg_type.is_none() && unknown.correlation_id.is_none());

        let partial = UnknownMessage::from_line(r#"{"msg_type":"ack","ok":"yes","correlation_id":"c-1"}"#);
        assert_eq!(partial.msg_type.as_deref(), Some("ack"));
        assert_eq!(partial.correlation_id, Some(CorrelationId::from("c-1")));
    }

    #[test]
    fn unknown_ack_type_never_satisfies_known_steps() {
        let msg = ProtocolMessage::decode(r#"{"msg_type":"ack","ack_type":"leave","ok":true}"#)
            .unwrap();
        assert!(!msg.is_ok_ack(AckType::Auth));
        assert!(!msg.is_ok_ack(AckType::Event));
        assert_eq!(msg.as_ack().map(|a| a.ack_type), Some(AckType::Other));
    }

    #[test]
    fn failed_ack_is_not_ok() {
        let msg =
            ProtocolMessage::decode(r#"{"msg_type":"ack","ack_type":"auth","ok":false,"error":"bad token"}"#)
                .unwrap();
        assert!(!msg.is_ok_ack(AckType::Auth));
        assert_eq!(msg.as_ack().and_then(|a| a.error.as_deref()), Some("bad token"));
    }

    #[test]
    fn malformed_line_is_decode_error() {
        assert!(matches!(ProtocolMessage::decode("{not json"), Err(ProtocolError::Decode(_))));
        assert!(matches!(
            ProtocolMessage::decode(r#"{"msg_type":"ack","ok":"yes"}"#),
            Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn oversized_line_is_rejected() {
        let line = "x".repeat(MAX_LINE_LENGTH + 1);
        assert!(matches!(ProtocolMessage::decode(&line), Err(ProtocolError::TooLong { .. })));
    }

    proptest! {
        #[test]
        fn decode_never_panics(line in ".{0,256}") {
            let _ = ProtocolMessage::decode(&line);
        }

        #[test]
        fn outbound_messages_keep_correlation_and_session(
            cid in "[a-f0-9-]{1,36}",
            session in "[a-z0-9-]{1,24}",
        ) {
            let env = Envelope::new(DEFAULT_PROTOCOL_VERSION, CorrelationId::from(cid.as_str()));
            let decoded = ProtocolMessage::decode(&env.join(session.clone()).encode().unwrap()).unwrap();

            prop_assert_eq!(decoded.correlation_id().map(CorrelationId::as_str), Some(cid.as_str()));
            prop_assert_eq!(decoded.session_id(), Some(session.as_str()));
        }
    }
}
