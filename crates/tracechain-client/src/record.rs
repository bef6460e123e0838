//! Per-session timeline and evidence lines.

use chrono::{SecondsFormat, Utc};
use tracechain_proto::{BUSINESS_ID_FIELD, CORRELATION_FIELD, ProtocolMessage};

/// Timestamped timeline plus extracted log-evidence lines for one session.
///
/// Owned by a single driver; the orchestrator only ever sees a frozen clone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionRecord {
    timeline: Vec<String>,
    evidence: Vec<String>,
}

impl SessionRecord {
    /// Create an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a timestamped timeline line.
    pub fn note(&mut self, line: impl AsRef<str>) {
        let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        self.timeline.push(format!("{ts} {}", line.as_ref()));
    }

    /// Append a log-evidence line.
    pub fn evidence(&mut self, line: impl Into<String>) {
        self.evidence.push(line.into());
    }

    /// Record an inbound message: timeline entry plus evidence for the
    /// correlation id and business identifier it carries.
    pub fn observe(&mut self, message: &ProtocolMessage) {
        match message.encode() {
            Ok(line) => self.note(format!("recv {line}")),
            Err(e) => self.note(format!("recv {} (unencodable: {e})", message.msg_type())),
        }
        if let Some(correlation_id) = message.correlation_id() {
            self.evidence(format!("{CORRELATION_FIELD} {correlation_id}"));
        }
        if let Some(session_id) = message.session_id() {
            self.evidence(format!("{BUSINESS_ID_FIELD} {session_id}"));
        }
    }

    /// Timeline lines in append order.
    pub fn timeline(&self) -> &[String] {
        &self.timeline
    }

    /// Evidence lines in append order.
    pub fn evidence_lines(&self) -> &[String] {
        &self.evidence
    }
}

#[cfg(test)]
mod tests {
    use tracechain_proto::{ProtocolMessage, UnknownMessage};

    use super::*;

    #[test]
    fn observe_extracts_correlation_and_session() {
        let mut record = SessionRecord::new();
        let msg = ProtocolMessage::decode(
            r#"{"msg_type":"class_session_aggregate","correlation_id":"c-1","session_id":"s-1","joined_count":1,"enter_event_count":1}"#,
        )
        .unwrap();

        record.observe(&msg);

        assert_eq!(record.evidence_lines(), ["correlation_id c-1", "session_id s-1"]);
        assert_eq!(record.timeline().len(), 1);
        assert!(record.timeline()[0].contains("recv {\"msg_type\":\"class_session_aggregate\""));
    }

    #[test]
    fn observe_without_ids_only_touches_timeline() {
        let mut record = SessionRecord::new();
        record.observe(&ProtocolMessage::Unrecognized(UnknownMessage::from_line("{garbage")));

        assert!(record.evidence_lines().is_empty());
        assert_eq!(record.timeline().len(), 1);
        assert!(record.timeline()[0].ends_with(" recv {garbage"));
    }

    #[test]
    fn unknown_message_is_logged_verbatim_with_its_ids() {
        let line = r#"{"msg_type":"error","correlation_id":"c-9","session_id":"s-9","reason":"busy"}"#;
        let mut record = SessionRecord::new();
        record.observe(&ProtocolMessage::decode(line).unwrap());

        assert_eq!(record.evidence_lines(), ["correlation_id c-9", "session_id s-9"]);
        assert!(record.timeline()[0].ends_with(&format!(" recv {line}")));
    }
}
