//! Multi-client orchestrator.
//!
//! Runs every configured [`SessionDriver`] on its own tokio task against one
//! shared session, then disconnects the first client and starts the probe.
//! Driver results are only read after each task has completed; the
//! orchestrator is the only writer of the aggregated result list.
//!
//! # Flow
//!
//! ```text
//! client1 ──run──▶ settled (stays connected)
//! client2 ──run──▶ settled (stays connected)       sequenced: one at a time
//! disconnect client1 ─▶ settle delay ─▶ probe ──run──▶ settled
//! disconnect all ─▶ snapshot ─▶ step lines + invariant lines
//! ```

use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tracechain_client::{
    Connector, SessionDriver, SessionDriverResult, SessionParams, SessionRecord, Step, TokenSource,
};
use tracechain_proto::CorrelationId;

use crate::{
    invariants::{ClientSnapshot, InvariantRegistry, ScenarioSnapshot},
    report::{Assertion, Report},
    scenario::{ClientSpec, ScenarioConfig, StartPolicy},
};

/// Everything one scenario run learned.
#[derive(Debug, Clone)]
pub struct ScenarioOutcome {
    /// Shared session id
    pub session_id: String,
    /// Client results in start order
    pub clients: Vec<SessionDriverResult>,
    /// Probe result, when the probe ran
    pub probe: Option<SessionDriverResult>,
    /// Frozen observations the invariants were checked against
    pub snapshot: ScenarioSnapshot,
    /// Rendered pass/fail report
    pub report: Report,
    /// Merged, time-ordered timeline of every driver plus the orchestrator
    pub timeline: Vec<String>,
}

impl ScenarioOutcome {
    /// Every result, probe last.
    pub fn results(&self) -> impl Iterator<Item = &SessionDriverResult> {
        self.clients.iter().chain(self.probe.iter())
    }

    /// Correlation ids in start order.
    pub fn correlation_ids(&self) -> Vec<String> {
        self.results().map(|r| r.correlation_id.to_string()).collect()
    }

    /// Correlation ids to try when proving a trace chain, most recent first.
    pub fn candidates(&self) -> Vec<String> {
        let mut ids = self.correlation_ids();
        ids.reverse();
        ids
    }

    /// Whether no assertion failed.
    pub fn passed(&self) -> bool {
        !self.report.has_failures()
    }
}

/// Sequences session drivers against one shared session.
pub struct Orchestrator {
    config: ScenarioConfig,
    connector: Arc<dyn Connector>,
    tokens: Arc<dyn TokenSource>,
}

impl Orchestrator {
    /// Create an orchestrator.
    pub fn new(
        config: ScenarioConfig,
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenSource>,
    ) -> Self {
        Self { config, connector, tokens }
    }

    /// Scenario being run.
    pub fn config(&self) -> &ScenarioConfig {
        &self.config
    }

    /// Run the scenario once.
    ///
    /// Protocol failures end up as `FAIL` lines in the report. A driver task
    /// that panicked is reported as a failed client and the run carries on.
    pub async fn run(&self) -> ScenarioOutcome {
        let config = &self.config;
        let mut record = SessionRecord::new();
        tracing::info!(
            session_id = %config.session_id,
            clients = config.clients.len(),
            policy = config.start_policy.as_str(),
            target = %self.connector.target(),
            "scenario starting"
        );

        let mut drivers = Vec::with_capacity(config.clients.len() + 1);
        let mut clients = Vec::with_capacity(config.clients.len());
        match config.start_policy {
            StartPolicy::Sequenced => {
                for spec in &config.clients {
                    let (driver, result) = self.launch(spec).join().await;
                    drivers.push(driver);
                    clients.push(result);
                }
            },
            StartPolicy::Concurrent => {
                let tasks: Vec<_> = config.clients.iter().map(|spec| self.launch(spec)).collect();
                for task in tasks {
                    let (driver, result) = task.join().await;
                    drivers.push(driver);
                    clients.push(result);
                }
            },
        }

        let mut disconnected = None;
        let mut probe = None;
        if let Some(spec) = &config.probe
            && let Some(first) = config.clients.first()
        {
            // An aborted task dropped its connection along with the driver.
            if let Some(driver) = drivers.first_mut().and_then(Option::as_mut) {
                driver.disconnect();
            }
            record.note(format!("ws disconnect {}", first.label));
            disconnected = Some(first.label.clone());

            tokio::time::sleep(config.settle_delay).await;
            let (driver, result) = self.launch(spec).join().await;
            drivers.push(driver);
            probe = Some(result);
        }

        for driver in drivers.iter_mut().flatten() {
            driver.disconnect();
        }
        record.note("ws disconnects issued");

        let snapshot = self.snapshot(&clients, probe.as_ref(), disconnected);
        let report = self.report(&clients, probe.as_ref(), &snapshot);

        let mut timeline: Vec<String> = clients
            .iter()
            .chain(probe.iter())
            .flat_map(|r| r.timeline.iter().cloned())
            .chain(record.timeline().iter().cloned())
            .collect();
        // Stable on equal timestamps, so per-driver order survives the merge.
        timeline.sort_by(|a, b| timestamp(a).cmp(timestamp(b)));

        tracing::info!(
            session_id = %config.session_id,
            failures = report.count(crate::report::Verdict::Fail),
            "scenario finished"
        );

        ScenarioOutcome {
            session_id: config.session_id.clone(),
            clients,
            probe,
            snapshot,
            report,
            timeline,
        }
    }

    fn launch(&self, spec: &ClientSpec) -> DriverTask {
        let params = spec.params(&self.config.session_id);
        let correlation_id = CorrelationId::generate();
        let mut driver = SessionDriver::with_correlation_id(
            params.clone(),
            self.config.driver.clone(),
            correlation_id.clone(),
        );
        let connector = Arc::clone(&self.connector);
        let tokens = Arc::clone(&self.tokens);
        let handle = tokio::spawn(async move {
            let result = driver.run(connector.as_ref(), tokens.as_ref()).await;
            (driver, result)
        });
        DriverTask { params, correlation_id, handle }
    }

    fn snapshot(
        &self,
        clients: &[SessionDriverResult],
        probe: Option<&SessionDriverResult>,
        disconnected: Option<String>,
    ) -> ScenarioSnapshot {
        let specs = &self.config.clients;
        let clients = clients
            .iter()
            .zip(specs)
            .zip(1u64..)
            .map(|((result, spec), position)| {
                ClientSnapshot::from_result(position, result, spec.idempotent_rejoin)
            })
            .collect();
        let probe = probe.zip(self.config.probe.as_ref()).map(|(result, spec)| {
            ClientSnapshot::from_result(specs.len() as u64 + 1, result, spec.idempotent_rejoin)
        });

        ScenarioSnapshot { policy: self.config.start_policy, clients, disconnected, probe }
    }

    fn report(
        &self,
        clients: &[SessionDriverResult],
        probe: Option<&SessionDriverResult>,
        snapshot: &ScenarioSnapshot,
    ) -> Report {
        let mut report = Report::new();
        report.header("session_id", &self.config.session_id);
        for result in clients.iter().chain(probe) {
            report.header(format!("{}_correlation_id", result.label), &result.correlation_id);
        }

        for result in clients.iter().chain(probe) {
            report.extend(self.step_assertions(result));
        }
        report.extend(InvariantRegistry::for_config(&self.config).evaluate(snapshot));
        report
    }

    fn step_assertions(&self, result: &SessionDriverResult) -> [Assertion; 3] {
        let event = self.config.driver.event_type.as_str();
        let within = format_timeout(self.config.driver.step_timeout);
        let label = &result.label;

        [
            Assertion::check(
                result.event_ack_ok,
                format!("send {event} -> ack(event) within {within} ({label})"),
            )
            .with_detail(failure_detail(result, Step::EventAck)),
            Assertion::check(
                result.got_aggregate,
                format!("send {event} -> class_session_aggregate within {within} ({label})"),
            )
            .with_detail(failure_detail(result, Step::Aggregate)),
            Assertion::check(result.last_aggregate.is_some(), format!("{label} received aggregate"))
                .with_detail(failure_detail(result, Step::Aggregate)),
        ]
    }
}

/// A spawned driver plus what is needed to report on it if the task dies.
struct DriverTask {
    params: SessionParams,
    correlation_id: CorrelationId,
    handle: JoinHandle<(SessionDriver, SessionDriverResult)>,
}

impl DriverTask {
    async fn join(self) -> (Option<SessionDriver>, SessionDriverResult) {
        match self.handle.await {
            Ok((driver, result)) => (Some(driver), result),
            Err(e) => {
                tracing::error!(
                    label = %self.params.label,
                    correlation_id = %self.correlation_id,
                    error = %e,
                    "driver task aborted"
                );
                (None, SessionDriverResult::aborted(&self.params, self.correlation_id, e.to_string()))
            },
        }
    }
}

/// The failure for `step`, or the earlier failure that prevented it.
fn failure_detail(result: &SessionDriverResult, step: Step) -> Option<String> {
    result.failure_for(step).or_else(|| result.failures.first()).map(ToString::to_string)
}

/// Leading RFC 3339 timestamp of a timeline line.
fn timestamp(line: &str) -> &str {
    line.split_once(' ').map_or(line, |(ts, _)| ts)
}

/// `1s`, `1500ms`, `250ms`.
fn format_timeout(timeout: Duration) -> String {
    if timeout.subsec_millis() == 0 && timeout.as_secs() > 0 {
        format!("{}s", timeout.as_secs())
    } else {
        format!("{}ms", timeout.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tracechain_client::{ClientIdentity, DriverFailure, DriverState, StaticToken, TokenError};

    use super::*;
    use crate::{
        hub::SimFaults,
        report::Verdict,
        sim_server::{SimServer, SimServerConfig},
        sim_transport::MemoryConnector,
    };
    use tracechain_proto::AckType;

    fn orchestrator(config: ScenarioConfig, faults: SimFaults) -> (Orchestrator, SimServer) {
        let server = SimServer::new(SimServerConfig { faults, ..SimServerConfig::default() });
        let orchestrator = Orchestrator::new(
            config,
            Arc::new(MemoryConnector::new(server.clone())),
            Arc::new(StaticToken::new("token")),
        );
        (orchestrator, server)
    }

    /// Panics when asked for `user_id`'s token.
    struct PanicsFor(&'static str);

    #[async_trait]
    impl TokenSource for PanicsFor {
        async fn token_for(
            &self,
            identity: &ClientIdentity,
            _session_id: &str,
        ) -> Result<String, TokenError> {
            assert_ne!(identity.user_id, self.0, "token source blew up");
            Ok("token".to_string())
        }
    }

    #[test]
    fn timeouts_render_compactly() {
        assert_eq!(format_timeout(Duration::from_secs(1)), "1s");
        assert_eq!(format_timeout(Duration::from_millis(1500)), "1500ms");
        assert_eq!(format_timeout(Duration::from_millis(250)), "250ms");
    }

    #[tokio::test]
    async fn reference_scenario_passes_against_sim_server() {
        let (orchestrator, server) = orchestrator(ScenarioConfig::reference("s-1"), SimFaults::default());
        let outcome = orchestrator.run().await;

        assert!(outcome.passed(), "{}", outcome.report.render());
        assert_eq!(outcome.report.count(Verdict::Warn), 0);
        assert_eq!(outcome.snapshot.disconnected.as_deref(), Some("client1"));
        assert_eq!(
            outcome.probe.as_ref().and_then(|p| p.last_aggregate.as_ref()).map(|a| a.joined_count),
            Some(2)
        );
        assert_eq!(outcome.report.header_value("session_id"), Some("s-1"));
        assert_eq!(outcome.correlation_ids().len(), 3);
        assert_eq!(outcome.candidates()[0], outcome.correlation_ids()[2]);
        assert!(outcome.timeline.last().is_some_and(|l| l.ends_with("ws disconnects issued")));

        let rendered = outcome.report.render();
        assert!(rendered.contains("PASS send class_enter -> ack(event) within 1s (client1)"));
        assert!(rendered.contains("PASS client3 received aggregate"));

        // Disconnects are asynchronous on the server side.
        for _ in 0..100 {
            if server.connection_count() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_event_acks_fail_without_hanging() {
        let faults = SimFaults { drop_acks: vec![AckType::Event], ..SimFaults::default() };
        let (orchestrator, _server) = orchestrator(ScenarioConfig::reference("s-1"), faults);
        let outcome = orchestrator.run().await;

        assert!(!outcome.passed());
        let rendered = outcome.report.render();
        assert!(
            rendered.contains("FAIL send class_enter -> ack(event) within 1s (client1) (event_ack timed out after 1s)"),
            "{rendered}"
        );
        // Aggregates still arrive, so the cross-client counts hold.
        assert!(rendered.contains("PASS client2 received aggregate"));
        assert!(rendered.contains("PASS client1 observes joined_count == 1\n"), "{rendered}");
        assert!(rendered.contains("PASS client2 observes joined_count == 2\n"), "{rendered}");
    }

    #[tokio::test]
    async fn concurrent_policy_converges() {
        let config = ScenarioConfig::with_clients("s-2", 4).with_policy(StartPolicy::Concurrent);
        let (orchestrator, _server) = orchestrator(config, SimFaults::default());
        let outcome = orchestrator.run().await;

        assert!(outcome.passed(), "{}", outcome.report.render());
        assert_eq!(outcome.clients.len(), 4);
    }

    #[tokio::test]
    async fn panicked_driver_is_a_failed_client_not_a_lost_run() {
        let server = SimServer::new(SimServerConfig::default());
        let orchestrator = Orchestrator::new(
            ScenarioConfig::reference("s-3"),
            Arc::new(MemoryConnector::new(server.clone())),
            Arc::new(PanicsFor("u2")),
        );
        let outcome = orchestrator.run().await;

        assert!(!outcome.passed());
        assert_eq!(outcome.clients.len(), 2);
        assert!(outcome.clients[0].is_settled());

        let aborted = &outcome.clients[1];
        assert_eq!(aborted.label, "client2");
        assert_eq!(aborted.session_id, "s-3");
        assert_eq!(aborted.final_state, DriverState::Failed);
        assert!(matches!(aborted.failures[..], [DriverFailure::Aborted(_)]));
        assert_eq!(outcome.correlation_ids().len(), 3);
        assert_eq!(
            outcome.report.header_value("client2_correlation_id"),
            Some(aborted.correlation_id.as_str())
        );

        // The rest of the scenario still ran.
        assert!(outcome.probe.as_ref().is_some_and(SessionDriverResult::is_settled));
        assert_eq!(outcome.snapshot.disconnected.as_deref(), Some("client1"));
        let rendered = outcome.report.render();
        assert!(rendered.contains("FAIL client2 received aggregate (driver task aborted"), "{rendered}");
        assert!(outcome.timeline.iter().any(|l| l.contains(" client2 driver task aborted: ")));
    }
}
