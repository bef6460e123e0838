//! Session hub: the sans-IO core of the simulation server.
//!
//! The hub owns per-connection protocol state and the live counters for every
//! session. It consumes [`HubEvent`]s and returns [`HubAction`]s; the async
//! serving loop in [`crate::sim_server`] performs the actual I/O.
//!
//! # Counting
//!
//! `joined_count` is the number of live connections joined to the session and
//! `enter_event_count` the number of those that have emitted the enter event.
//! Both are derived from connection state, so a repeated join or enter on one
//! connection never counts twice and a disconnect removes the connection
//! from both.

use std::collections::HashMap;

use tracechain_proto::{
    Ack, AckType, AggregatePush, BUSINESS_ID_FIELD, CORRELATION_FIELD, CorrelationId,
    DEFAULT_PROTOCOL_VERSION, EventType, ProtocolMessage,
};
use tracechain_verify::Span;

/// Connection identifier assigned by the serving loop.
pub type ConnId = u64;

/// Span names emitted along the event path.
pub mod span_names {
    /// Inbound message accepted on the socket
    pub const INGRESS: &str = "ws.message";
    /// Enter row persisted
    pub const DURABLE_WRITE: &str = "pg.write";
    /// Cached aggregate updated
    pub const CACHE_UPDATE: &str = "redis.update";
    /// Aggregate fanned out to joined connections
    pub const FAN_OUT: &str = "ws.push";
}

/// Faults injected into the hub to exercise harness failure paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimFaults {
    /// Ack types that are silently never sent
    pub drop_acks: Vec<AckType>,
    /// Never push aggregates
    pub suppress_aggregates: bool,
    /// Span names that are never recorded
    pub drop_spans: Vec<String>,
}

/// Hub configuration.
#[derive(Debug, Clone, Default)]
pub struct HubConfig {
    /// When set, `auth` must carry exactly this token
    pub expected_token: Option<String>,
    /// Injected faults
    pub faults: SimFaults,
}

/// Inputs to the hub.
#[derive(Debug, Clone)]
pub enum HubEvent {
    /// A connection was accepted
    Opened {
        /// Connection id
        conn: ConnId,
    },
    /// A message arrived on a connection
    Received {
        /// Connection id
        conn: ConnId,
        /// Decoded message
        message: ProtocolMessage,
    },
    /// A connection closed
    Closed {
        /// Connection id
        conn: ConnId,
    },
}

/// Outputs of the hub.
#[derive(Debug, Clone, PartialEq)]
pub enum HubAction {
    /// Send a message to one connection
    Send {
        /// Target connection
        conn: ConnId,
        /// Message to send
        message: ProtocolMessage,
    },
    /// Record an exported span
    Span(Span),
}

#[derive(Debug, Default)]
struct ConnState {
    authed: bool,
    joined: Option<String>,
    entered: bool,
}

/// Sans-IO protocol state for every connection.
#[derive(Debug, Default)]
pub struct SessionHub {
    config: HubConfig,
    connections: HashMap<ConnId, ConnState>,
}

impl SessionHub {
    /// Create an empty hub.
    pub fn new(config: HubConfig) -> Self {
        Self { config, connections: HashMap::new() }
    }

    /// Live joined connections in `session_id`.
    pub fn joined_count(&self, session_id: &str) -> u64 {
        self.members(session_id).count() as u64
    }

    /// Live joined connections in `session_id` that emitted the enter event.
    pub fn enter_event_count(&self, session_id: &str) -> u64 {
        self.members(session_id).filter(|(_, state)| state.entered).count() as u64
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Process one event.
    pub fn process_event(&mut self, event: HubEvent) -> Vec<HubAction> {
        match event {
            HubEvent::Opened { conn } => {
                self.connections.insert(conn, ConnState::default());
                Vec::new()
            },
            HubEvent::Received { conn, message } => self.handle_message(conn, message),
            HubEvent::Closed { conn } => self.handle_close(conn),
        }
    }

    fn handle_message(&mut self, conn: ConnId, message: ProtocolMessage) -> Vec<HubAction> {
        if !self.connections.contains_key(&conn) {
            tracing::warn!(conn, "message on unknown connection");
            return Vec::new();
        }

        let mut actions = Vec::new();
        if let Some(cid) = message.correlation_id() {
            let mut span = Span::new(span_names::INGRESS)
                .with_attr(CORRELATION_FIELD, cid.as_str())
                .with_attr("msg_type", message.msg_type());
            if let Some(session_id) = message.session_id() {
                span = span.with_attr(BUSINESS_ID_FIELD, session_id);
            }
            self.push_span(&mut actions, span);
        }

        match message {
            ProtocolMessage::Auth(auth) => {
                let accepted = !auth.token.trim().is_empty()
                    && self.config.expected_token.as_ref().is_none_or(|t| *t == auth.token);
                if let Some(state) = self.connections.get_mut(&conn) {
                    state.authed |= accepted;
                }
                let error = (!accepted).then(|| "invalid token".to_string());
                self.push_ack(&mut actions, conn, AckType::Auth, &auth.correlation_id, None, error);
            },
            ProtocolMessage::JoinSession(join) => {
                let error = match self.connections.get_mut(&conn) {
                    Some(state) if state.authed => {
                        if state.joined.as_deref() != Some(join.session_id.as_str()) {
                            state.joined = Some(join.session_id.clone());
                            state.entered = false;
                        }
                        None
                    },
                    _ => Some("not authenticated".to_string()),
                };
                self.push_ack(
                    &mut actions,
                    conn,
                    AckType::JoinSession,
                    &join.correlation_id,
                    Some(join.session_id),
                    error,
                );
            },
            ProtocolMessage::Event(event) => {
                let joined = self
                    .connections
                    .get(&conn)
                    .is_some_and(|s| s.joined.as_deref() == Some(event.session_id.as_str()));
                if !joined {
                    self.push_ack(
                        &mut actions,
                        conn,
                        AckType::Event,
                        &event.correlation_id,
                        Some(event.session_id),
                        Some("not joined".to_string()),
                    );
                    return actions;
                }

                if event.event_type == EventType::Enter
                    && let Some(state) = self.connections.get_mut(&conn)
                {
                    state.entered = true;
                }
                let chain = |name: &str| {
                    Span::new(name)
                        .with_attr(CORRELATION_FIELD, event.correlation_id.as_str())
                        .with_attr(BUSINESS_ID_FIELD, event.session_id.as_str())
                };
                self.push_span(&mut actions, chain(span_names::DURABLE_WRITE));
                self.push_span(&mut actions, chain(span_names::CACHE_UPDATE));
                self.push_ack(
                    &mut actions,
                    conn,
                    AckType::Event,
                    &event.correlation_id,
                    Some(event.session_id.clone()),
                    None,
                );
                if self.broadcast(&mut actions, &event.session_id, Some(&event.correlation_id)) {
                    self.push_span(&mut actions, chain(span_names::FAN_OUT));
                }
            },
            ProtocolMessage::Ack(_) | ProtocolMessage::Aggregate(_) | ProtocolMessage::Unrecognized(_) => {
                tracing::debug!(conn, "ignoring server-bound message of unexpected kind");
            },
        }
        actions
    }

    fn handle_close(&mut self, conn: ConnId) -> Vec<HubAction> {
        let mut actions = Vec::new();
        if let Some(ConnState { joined: Some(session_id), .. }) = self.connections.remove(&conn) {
            tracing::debug!(conn, session_id = %session_id, "joined connection closed");
            self.broadcast(&mut actions, &session_id, None);
        }
        actions
    }

    /// Push the session's counters to every joined connection. Returns
    /// whether anything was pushed.
    fn broadcast(
        &self,
        actions: &mut Vec<HubAction>,
        session_id: &str,
        correlation_id: Option<&CorrelationId>,
    ) -> bool {
        if self.config.faults.suppress_aggregates {
            return false;
        }
        let push = AggregatePush {
            protocol_version: DEFAULT_PROTOCOL_VERSION.to_string(),
            correlation_id: correlation_id.cloned(),
            session_id: session_id.to_string(),
            joined_count: self.joined_count(session_id),
            enter_event_count: self.enter_event_count(session_id),
        };
        let mut targets: Vec<ConnId> = self.members(session_id).map(|(conn, _)| *conn).collect();
        targets.sort_unstable();
        for conn in &targets {
            actions.push(HubAction::Send {
                conn: *conn,
                message: ProtocolMessage::Aggregate(push.clone()),
            });
        }
        !targets.is_empty()
    }

    fn push_ack(
        &self,
        actions: &mut Vec<HubAction>,
        conn: ConnId,
        ack_type: AckType,
        correlation_id: &CorrelationId,
        session_id: Option<String>,
        error: Option<String>,
    ) {
        if self.config.faults.drop_acks.contains(&ack_type) {
            tracing::debug!(conn, ack_type = ack_type.as_str(), "dropping ack");
            return;
        }
        actions.push(HubAction::Send {
            conn,
            message: ProtocolMessage::Ack(Ack {
                protocol_version: DEFAULT_PROTOCOL_VERSION.to_string(),
                correlation_id: Some(correlation_id.clone()),
                ack_type,
                ok: error.is_none(),
                session_id,
                error,
            }),
        });
    }

    fn push_span(&self, actions: &mut Vec<HubAction>, span: Span) {
        if !self.config.faults.drop_spans.iter().any(|name| *name == span.name) {
            actions.push(HubAction::Span(span));
        }
    }

    fn members<'a>(&'a self, session_id: &'a str) -> impl Iterator<Item = (&'a ConnId, &'a ConnState)> {
        self.connections.iter().filter(move |(_, state)| state.joined.as_deref() == Some(session_id))
    }
}

#[cfg(test)]
mod tests {
    use tracechain_proto::{DEFAULT_PROTOCOL_VERSION, Envelope};

    use super::*;

    fn env(cid: &str) -> Envelope {
        Envelope::new(DEFAULT_PROTOCOL_VERSION, CorrelationId::from(cid))
    }

    fn sends(actions: &[HubAction]) -> Vec<(ConnId, &ProtocolMessage)> {
        actions
            .iter()
            .filter_map(|a| match a {
                HubAction::Send { conn, message } => Some((*conn, message)),
                HubAction::Span(_) => None,
            })
            .collect()
    }

    fn spans(actions: &[HubAction]) -> Vec<&str> {
        actions
            .iter()
            .filter_map(|a| match a {
                HubAction::Span(span) => Some(span.name.as_str()),
                HubAction::Send { .. } => None,
            })
            .collect()
    }

    fn join(hub: &mut SessionHub, conn: ConnId, cid: &str) {
        hub.process_event(HubEvent::Opened { conn });
        let e = env(cid);
        hub.process_event(HubEvent::Received { conn, message: e.auth("tok") });
        hub.process_event(HubEvent::Received { conn, message: e.join("s-1") });
    }

    fn enter(hub: &mut SessionHub, conn: ConnId, cid: &str) -> Vec<HubAction> {
        hub.process_event(HubEvent::Received { conn, message: env(cid).event(EventType::Enter, "s-1") })
    }

    #[test]
    fn event_acks_pushes_and_emits_chain() {
        let mut hub = SessionHub::default();
        join(&mut hub, 1, "c-1");

        let actions = enter(&mut hub, 1, "c-1");

        let sent = sends(&actions);
        assert!(sent[0].1.is_ok_ack(AckType::Event));
        let push = sent[1].1.as_aggregate().unwrap();
        assert_eq!((push.joined_count, push.enter_event_count), (1, 1));
        assert_eq!(spans(&actions), ["ws.message", "pg.write", "redis.update", "ws.push"]);
    }

    #[test]
    fn rejoin_and_reenter_do_not_double_count() {
        let mut hub = SessionHub::default();
        join(&mut hub, 1, "c-1");
        let rejoin = hub.process_event(HubEvent::Received { conn: 1, message: env("c-1").join("s-1") });
        assert!(sends(&rejoin)[0].1.is_ok_ack(AckType::JoinSession));

        enter(&mut hub, 1, "c-1");
        enter(&mut hub, 1, "c-1");

        assert_eq!(hub.joined_count("s-1"), 1);
        assert_eq!(hub.enter_event_count("s-1"), 1);
    }

    #[test]
    fn disconnect_decrements_and_notifies_remaining() {
        let mut hub = SessionHub::default();
        join(&mut hub, 1, "c-1");
        join(&mut hub, 2, "c-2");
        enter(&mut hub, 1, "c-1");
        enter(&mut hub, 2, "c-2");

        let actions = hub.process_event(HubEvent::Closed { conn: 1 });

        let sent = sends(&actions);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 2);
        let push = sent[0].1.as_aggregate().unwrap();
        assert_eq!((push.joined_count, push.enter_event_count), (1, 1));

        join(&mut hub, 3, "c-3");
        assert_eq!(hub.joined_count("s-1"), 2);
    }

    #[test]
    fn join_requires_auth_and_event_requires_join() {
        let mut hub = SessionHub::default();
        hub.process_event(HubEvent::Opened { conn: 1 });

        let join = hub.process_event(HubEvent::Received { conn: 1, message: env("c-1").join("s-1") });
        let event = enter(&mut hub, 1, "c-1");

        let join_ack = sends(&join)[0].1.as_ack().unwrap().clone();
        assert!(!join_ack.ok);
        assert_eq!(join_ack.error.as_deref(), Some("not authenticated"));
        assert!(!sends(&event)[0].1.as_ack().unwrap().ok);
        assert_eq!(hub.joined_count("s-1"), 0);
    }

    #[test]
    fn expected_token_is_enforced() {
        let mut hub =
            SessionHub::new(HubConfig { expected_token: Some("right".to_string()), ..HubConfig::default() });
        hub.process_event(HubEvent::Opened { conn: 1 });

        let actions = hub.process_event(HubEvent::Received { conn: 1, message: env("c-1").auth("wrong") });
        assert!(!sends(&actions)[0].1.as_ack().unwrap().ok);
    }

    #[test]
    fn faults_drop_acks_spans_and_pushes() {
        let faults = SimFaults {
            drop_acks: vec![AckType::Event],
            suppress_aggregates: true,
            drop_spans: vec!["redis.update".to_string()],
        };
        let mut hub = SessionHub::new(HubConfig { faults, ..HubConfig::default() });
        join(&mut hub, 1, "c-1");

        let actions = enter(&mut hub, 1, "c-1");

        assert!(sends(&actions).is_empty());
        assert_eq!(spans(&actions), ["ws.message", "pg.write"]);
        assert_eq!(hub.enter_event_count("s-1"), 1);
    }
}
