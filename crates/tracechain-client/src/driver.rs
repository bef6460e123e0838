//! Per-session protocol driver.
//!
//! [`SessionDriver`] walks one connection through authenticate, join, and the
//! domain event, waiting on acks and the aggregate push with a deadline per
//! step. Failures are recorded on the result rather than returned: a driver
//! always hands back everything it learned.
//!
//! # State machine
//!
//! ```text
//! Idle → Connecting → Authenticating → Joining → EventSent → Settled
//!          │               │              │           │
//!          └───────────────┴──────────────┴───────────┴──→ Failed
//! ```
//!
//! Connect, auth, and join failures end the run. Once the event is sent the
//! event ack and the aggregate push are awaited independently, both against
//! a deadline measured from the send, so either may succeed without the other.

use std::{fmt, ops::Range, time::Duration};

use thiserror::Error;
use tokio::time::Instant;
use tracechain_proto::{
    AckType, AggregateSnapshot, CORRELATION_HEADER, CorrelationId, DEFAULT_PROTOCOL_VERSION,
    Envelope, EventType, ProtocolMessage,
};

use crate::{
    message_log::MessageLog,
    record::SessionRecord,
    token::{ClientIdentity, TokenSource},
    transport::{ConnectedClient, Connector},
};

/// Default per-step deadline.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(1);

/// Driver tunables shared by every session in a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Deadline for each ack or push wait
    pub step_timeout: Duration,
    /// Version stamped on outbound messages
    pub protocol_version: String,
    /// Domain event emitted after joining
    pub event_type: EventType,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            step_timeout: DEFAULT_STEP_TIMEOUT,
            protocol_version: DEFAULT_PROTOCOL_VERSION.to_string(),
            event_type: EventType::Enter,
        }
    }
}

/// What one driver does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    /// Label used in reports, e.g. `client1`
    pub label: String,
    /// Identity the token is requested for
    pub identity: ClientIdentity,
    /// Shared session to join
    pub session_id: String,
    /// Resend `join_session` once and require a second ok ack
    pub idempotent_rejoin: bool,
}

/// Driver lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverState {
    /// Not started
    Idle,
    /// Acquiring a token and opening the connection
    Connecting,
    /// `auth` sent, waiting for its ack
    Authenticating,
    /// `join_session` sent, waiting for its ack
    Joining,
    /// Domain event sent, waiting for its ack and an aggregate push
    EventSent,
    /// Every step succeeded
    Settled,
    /// Some step failed
    Failed,
}

impl DriverState {
    /// Whether the driver has finished.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Settled | Self::Failed)
    }

    /// Lowercase name for logs and timelines.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Joining => "joining",
            Self::EventSent => "event_sent",
            Self::Settled => "settled",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol step a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    /// Token acquisition and connect
    Connect,
    /// Auth ack
    Auth,
    /// First join ack
    Join,
    /// Second join ack on the same connection
    Rejoin,
    /// Event ack
    EventAck,
    /// Aggregate push after the event
    Aggregate,
}

impl Step {
    /// Lowercase name for logs and reports.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Auth => "auth",
            Self::Join => "join",
            Self::Rejoin => "rejoin",
            Self::EventAck => "event_ack",
            Self::Aggregate => "aggregate",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a step did not succeed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverFailure {
    /// The transport could not be established.
    #[error("connection failed: {0}")]
    Connection(String),

    /// No credential could be obtained.
    #[error("token unavailable: {0}")]
    Token(String),

    /// The step's deadline passed without the awaited message.
    #[error("{step} timed out after {after:?}")]
    ProtocolTimeout {
        /// Step that timed out
        step: Step,
        /// Deadline that elapsed
        after: Duration,
    },

    /// The server answered with `ok=false`.
    #[error("{step} rejected: {reason}")]
    Rejected {
        /// Step that was rejected
        step: Step,
        /// Server-supplied reason
        reason: String,
    },

    /// The connection closed while the step was pending.
    #[error("connection closed during {step}")]
    Closed {
        /// Step that was pending
        step: Step,
    },

    /// The task running the driver ended without a result.
    #[error("driver task aborted: {0}")]
    Aborted(String),
}

impl DriverFailure {
    /// Step this failure belongs to.
    pub fn step(&self) -> Step {
        match self {
            Self::Connection(_) | Self::Token(_) | Self::Aborted(_) => Step::Connect,
            Self::ProtocolTimeout { step, .. }
            | Self::Rejected { step, .. }
            | Self::Closed { step } => *step,
        }
    }
}

/// Frozen outcome of one driver run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDriverResult {
    /// Label from [`SessionParams`]
    pub label: String,
    /// Correlation id stamped on every outbound message
    pub correlation_id: CorrelationId,
    /// Session that was joined
    pub session_id: String,
    /// Auth was acked ok
    pub auth_ok: bool,
    /// First join was acked ok
    pub join_ok: bool,
    /// Rejoin outcome, `None` when no rejoin was requested or reached
    pub rejoin_ok: Option<bool>,
    /// Event was acked ok within its deadline
    pub event_ack_ok: bool,
    /// An aggregate push arrived after the event within its deadline
    pub got_aggregate: bool,
    /// Latest aggregate received after the event
    pub last_aggregate: Option<AggregateSnapshot>,
    /// Every aggregate for the session received during the run, in order
    pub aggregates: Vec<AggregateSnapshot>,
    /// Aggregates received between the first join ack and the event send
    pub rejoin_aggregates: Vec<AggregateSnapshot>,
    /// Timestamped timeline lines
    pub timeline: Vec<String>,
    /// Log-evidence lines
    pub evidence: Vec<String>,
    /// State the driver ended in
    pub final_state: DriverState,
    /// Every failure, in the order it happened
    pub failures: Vec<DriverFailure>,
}

impl SessionDriverResult {
    /// Outcome for a driver whose task died before it could freeze one.
    pub fn aborted(
        params: &SessionParams,
        correlation_id: CorrelationId,
        reason: impl Into<String>,
    ) -> Self {
        let failure = DriverFailure::Aborted(reason.into());
        let mut record = SessionRecord::new();
        record.note(format!("{} {failure}", params.label));
        Self {
            label: params.label.clone(),
            correlation_id,
            session_id: params.session_id.clone(),
            auth_ok: false,
            join_ok: false,
            rejoin_ok: None,
            event_ack_ok: false,
            got_aggregate: false,
            last_aggregate: None,
            aggregates: Vec::new(),
            rejoin_aggregates: Vec::new(),
            timeline: record.timeline().to_vec(),
            evidence: Vec::new(),
            final_state: DriverState::Failed,
            failures: vec![failure],
        }
    }

    /// Whether every step succeeded.
    pub fn is_settled(&self) -> bool {
        self.final_state == DriverState::Settled
    }

    /// Failure recorded for `step`, if any.
    pub fn failure_for(&self, step: Step) -> Option<&DriverFailure> {
        self.failures.iter().find(|f| f.step() == step)
    }
}

/// Step flags accumulated while driving.
#[derive(Debug, Default)]
struct Progress {
    auth_ok: bool,
    join_ok: bool,
    rejoin_ok: Option<bool>,
    event_ack_ok: bool,
    got_aggregate: bool,
    rejoin_window: Option<Range<usize>>,
    event_index: Option<usize>,
    failures: Vec<DriverFailure>,
}

/// Drives one client session through the protocol.
///
/// The connection stays open after [`SessionDriver::run`] returns so the
/// session keeps counting as joined until [`SessionDriver::disconnect`].
pub struct SessionDriver {
    params: SessionParams,
    config: DriverConfig,
    envelope: Envelope,
    state: DriverState,
    record: SessionRecord,
    client: Option<ConnectedClient>,
    log: Option<MessageLog>,
}

impl SessionDriver {
    /// Create a driver with a freshly generated correlation id.
    pub fn new(params: SessionParams, config: DriverConfig) -> Self {
        Self::with_correlation_id(params, config, CorrelationId::generate())
    }

    /// Create a driver with a caller-chosen correlation id.
    pub fn with_correlation_id(
        params: SessionParams,
        config: DriverConfig,
        correlation_id: CorrelationId,
    ) -> Self {
        let envelope = Envelope::new(config.protocol_version.clone(), correlation_id);
        Self {
            params,
            config,
            envelope,
            state: DriverState::Idle,
            record: SessionRecord::new(),
            client: None,
            log: None,
        }
    }

    /// Correlation id of this session.
    pub fn correlation_id(&self) -> &CorrelationId {
        self.envelope.correlation_id()
    }

    /// Report label.
    pub fn label(&self) -> &str {
        &self.params.label
    }

    /// Current state.
    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Run the protocol once and freeze the outcome.
    ///
    /// Never panics on protocol errors and never waits past the configured
    /// per-step deadlines.
    pub async fn run(
        &mut self,
        connector: &dyn Connector,
        tokens: &dyn TokenSource,
    ) -> SessionDriverResult {
        let mut progress = Progress::default();

        if let Err(failure) = self.drive(connector, tokens, &mut progress).await {
            self.fail(&mut progress, failure);
        }

        let settled = progress.failures.is_empty() && progress.got_aggregate;
        self.transition(if settled { DriverState::Settled } else { DriverState::Failed });
        self.freeze(progress)
    }

    /// Close the connection. Safe before `run`, after failures, and repeatedly.
    pub fn disconnect(&mut self) {
        match self.client.as_mut() {
            Some(client) if client.is_connected() => {
                client.disconnect();
                self.record_mut().note("ws disconnect");
                tracing::debug!(label = %self.params.label, correlation_id = %self.correlation_id(), "disconnected");
            },
            _ => tracing::debug!(label = %self.params.label, "disconnect on idle driver"),
        }
    }

    async fn drive(
        &mut self,
        connector: &dyn Connector,
        tokens: &dyn TokenSource,
        progress: &mut Progress,
    ) -> Result<(), DriverFailure> {
        self.transition(DriverState::Connecting);
        let correlation_id = self.correlation_id().clone();
        self.record.note(format!("ws connect correlation_id={correlation_id}"));
        self.record.evidence(format!("{CORRELATION_HEADER} {correlation_id}"));

        let token = tokens
            .token_for(&self.params.identity, &self.params.session_id)
            .await
            .map_err(|e| DriverFailure::Token(e.to_string()))?;
        let mut client =
            connector.connect().await.map_err(|e| DriverFailure::Connection(e.to_string()))?;
        let inbound = client.take_inbound().map_err(|e| DriverFailure::Connection(e.to_string()))?;
        self.log = Some(MessageLog::new(inbound, std::mem::take(&mut self.record)));
        self.client = Some(client);
        tracing::info!(
            label = %self.params.label,
            correlation_id = %correlation_id,
            target = %connector.target(),
            "connected"
        );

        self.transition(DriverState::Authenticating);
        let from = self.received();
        let auth = self.envelope.auth(token);
        self.send(Step::Auth, auth).await?;
        self.await_ack(from, self.deadline(), Step::Auth, AckType::Auth).await?;
        progress.auth_ok = true;

        self.transition(DriverState::Joining);
        let join = self.envelope.join(self.params.session_id.clone());
        let from = self.received();
        self.send(Step::Join, join.clone()).await?;
        self.await_ack(from, self.deadline(), Step::Join, AckType::JoinSession).await?;
        progress.join_ok = true;
        let joined_at = self.received();

        if self.params.idempotent_rejoin {
            let from = self.received();
            self.send(Step::Rejoin, join).await?;
            // A join that cannot be repeated is a failed join; the event is never sent.
            if let Err(failure) =
                self.await_ack(from, self.deadline(), Step::Rejoin, AckType::JoinSession).await
            {
                progress.rejoin_ok = Some(false);
                progress.join_ok = false;
                return Err(failure);
            }
            progress.rejoin_ok = Some(true);
        }

        self.transition(DriverState::EventSent);
        let event_index = self.received();
        progress.rejoin_window = Some(joined_at..event_index);
        progress.event_index = Some(event_index);
        let event = self.envelope.event(self.config.event_type, self.params.session_id.clone());
        self.send(Step::EventAck, event).await?;

        // Both waits share the deadline taken at send time.
        let deadline = self.deadline();
        match self.await_ack(event_index, deadline, Step::EventAck, AckType::Event).await {
            Ok(()) => progress.event_ack_ok = true,
            Err(failure) => self.fail(progress, failure),
        }
        match self.await_aggregate(event_index, deadline).await {
            Ok(()) => progress.got_aggregate = true,
            Err(failure) => self.fail(progress, failure),
        }
        Ok(())
    }

    async fn send(&mut self, step: Step, message: ProtocolMessage) -> Result<(), DriverFailure> {
        match message.encode() {
            Ok(line) => self.record_mut().note(format!("send {line}")),
            Err(e) => self.record_mut().note(format!("send {} ({e})", message.msg_type())),
        }
        let client = self.client.as_ref().ok_or(DriverFailure::Closed { step })?;
        client.send(message).await.map_err(|_| DriverFailure::Closed { step })
    }

    async fn await_ack(
        &mut self,
        from: usize,
        deadline: Instant,
        step: Step,
        ack_type: AckType,
    ) -> Result<(), DriverFailure> {
        let log = self.log.as_mut().ok_or(DriverFailure::Closed { step })?;
        let found = log
            .await_next(from, deadline, |m| m.as_ack().is_some_and(|a| a.ack_type == ack_type))
            .await
            .and_then(ProtocolMessage::as_ack)
            .cloned();

        match found {
            Some(ack) if ack.ok => Ok(()),
            Some(ack) => Err(DriverFailure::Rejected {
                step,
                reason: ack.error.unwrap_or_else(|| "ok=false".to_string()),
            }),
            None if log.is_closed() => Err(DriverFailure::Closed { step }),
            None => Err(DriverFailure::ProtocolTimeout { step, after: self.config.step_timeout }),
        }
    }

    async fn await_aggregate(&mut self, from: usize, deadline: Instant) -> Result<(), DriverFailure> {
        let step = Step::Aggregate;
        let session_id = self.params.session_id.as_str();
        let own = self.envelope.correlation_id().clone();
        let log = self.log.as_mut().ok_or(DriverFailure::Closed { step })?;
        // A push tagged with another session's correlation id answers that
        // session's event, not ours.
        let found = log
            .await_next(from, deadline, |m| {
                m.as_aggregate().is_some_and(|push| {
                    push.session_id == session_id
                        && push.correlation_id.as_ref().is_none_or(|cid| *cid == own)
                })
            })
            .await
            .is_some();

        if found {
            Ok(())
        } else if log.is_closed() {
            Err(DriverFailure::Closed { step })
        } else {
            Err(DriverFailure::ProtocolTimeout { step, after: self.config.step_timeout })
        }
    }

    fn fail(&mut self, progress: &mut Progress, failure: DriverFailure) {
        tracing::warn!(
            label = %self.params.label,
            correlation_id = %self.correlation_id(),
            step = failure.step().as_str(),
            error = %failure,
            "step failed"
        );
        self.record_mut().note(format!("FAIL {}: {failure}", failure.step()));
        progress.failures.push(failure);
    }

    fn transition(&mut self, next: DriverState) {
        if self.state == next {
            return;
        }
        tracing::debug!(label = %self.params.label, from = %self.state, to = %next, "transition");
        let line = format!("state {} -> {next}", self.state);
        self.record_mut().note(line);
        self.state = next;
    }

    fn freeze(&self, progress: Progress) -> SessionDriverResult {
        let session_id = self.params.session_id.as_str();
        let (record, messages) = match &self.log {
            Some(log) => (log.record().clone(), log.messages()),
            None => (self.record.clone(), &[][..]),
        };
        let aggregates_in = |range: Range<usize>| -> Vec<AggregateSnapshot> {
            messages
                .get(range)
                .unwrap_or_default()
                .iter()
                .filter_map(ProtocolMessage::as_aggregate)
                .filter(|push| push.session_id == session_id)
                .map(AggregateSnapshot::from)
                .collect()
        };

        let last_aggregate = progress
            .event_index
            .and_then(|from| aggregates_in(from..messages.len()).pop());

        SessionDriverResult {
            label: self.params.label.clone(),
            correlation_id: self.correlation_id().clone(),
            session_id: self.params.session_id.clone(),
            auth_ok: progress.auth_ok,
            join_ok: progress.join_ok,
            rejoin_ok: progress.rejoin_ok,
            event_ack_ok: progress.event_ack_ok,
            got_aggregate: progress.got_aggregate,
            last_aggregate,
            aggregates: aggregates_in(0..messages.len()),
            rejoin_aggregates: progress.rejoin_window.map(aggregates_in).unwrap_or_default(),
            timeline: record.timeline().to_vec(),
            evidence: record.evidence_lines().to_vec(),
            final_state: self.state,
            failures: progress.failures,
        }
    }

    fn record_mut(&mut self) -> &mut SessionRecord {
        match self.log.as_mut() {
            Some(log) => log.record_mut(),
            None => &mut self.record,
        }
    }

    fn received(&self) -> usize {
        self.log.as_ref().map_or(0, MessageLog::len)
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.config.step_timeout
    }
}
