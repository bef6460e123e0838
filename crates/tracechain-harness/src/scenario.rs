//! Scenario configuration.

use std::time::Duration;

use tracechain_client::{ClientIdentity, DriverConfig, SessionParams};

/// Wait between disconnecting the first client and starting the probe.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(200);

/// How drivers are started relative to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartPolicy {
    /// Driver k+1 starts once driver k has settled; earlier connections stay
    /// open. Counts are exact: the k-th client observes k.
    #[default]
    Sequenced,
    /// All drivers start at once. Counts are range-checked and must converge.
    Concurrent,
}

impl StartPolicy {
    /// Lowercase name for report headers.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sequenced => "sequenced",
            Self::Concurrent => "concurrent",
        }
    }
}

/// One client in the scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSpec {
    /// Report label
    pub label: String,
    /// Token identity
    pub identity: ClientIdentity,
    /// Resend join once on the same connection
    pub idempotent_rejoin: bool,
}

impl ClientSpec {
    /// Create a client spec.
    pub fn new(label: impl Into<String>, user_id: &str, role: &str) -> Self {
        Self {
            label: label.into(),
            identity: ClientIdentity::new(user_id, role),
            idempotent_rejoin: false,
        }
    }

    /// Enable idempotent rejoin.
    #[must_use]
    pub fn with_rejoin(mut self) -> Self {
        self.idempotent_rejoin = true;
        self
    }

    /// Driver parameters for `session_id`.
    pub fn params(&self, session_id: &str) -> SessionParams {
        SessionParams {
            label: self.label.clone(),
            identity: self.identity.clone(),
            session_id: session_id.to_string(),
            idempotent_rejoin: self.idempotent_rejoin,
        }
    }
}

/// Full scenario configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioConfig {
    /// Shared session every client joins
    pub session_id: String,
    /// Clients in start order
    pub clients: Vec<ClientSpec>,
    /// Fresh client started after the first client disconnects
    pub probe: Option<ClientSpec>,
    /// Start policy
    pub start_policy: StartPolicy,
    /// Wait after the disconnect before the probe starts
    pub settle_delay: Duration,
    /// Per-driver tunables
    pub driver: DriverConfig,
}

impl ScenarioConfig {
    /// Two clients (the first rejoining idempotently), then a disconnect of
    /// the first and a probe by a third.
    pub fn reference(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            clients: vec![
                ClientSpec::new("client1", "u1", "teacher").with_rejoin(),
                ClientSpec::new("client2", "u2", "student"),
            ],
            probe: Some(ClientSpec::new("client3", "u3", "teacher")),
            start_policy: StartPolicy::Sequenced,
            settle_delay: DEFAULT_SETTLE_DELAY,
            driver: DriverConfig::default(),
        }
    }

    /// `n` clients with the reference shape: first rejoins, probe follows.
    ///
    /// `n` below 2 is raised to 2 so the disconnect leaves a client behind.
    pub fn with_clients(session_id: impl Into<String>, n: usize) -> Self {
        let n = n.max(2);
        let clients = (1..=n)
            .map(|k| {
                let role = if k == 1 { "teacher" } else { "student" };
                let spec = ClientSpec::new(format!("client{k}"), &format!("u{k}"), role);
                if k == 1 { spec.with_rejoin() } else { spec }
            })
            .collect();
        Self {
            clients,
            probe: Some(ClientSpec::new(format!("client{}", n + 1), &format!("u{}", n + 1), "teacher")),
            ..Self::reference(session_id)
        }
    }

    /// Use `policy`.
    #[must_use]
    pub fn with_policy(mut self, policy: StartPolicy) -> Self {
        self.start_policy = policy;
        self
    }

    /// Use `driver` tunables.
    #[must_use]
    pub fn with_driver(mut self, driver: DriverConfig) -> Self {
        self.driver = driver;
        self
    }

    /// Skip the disconnect and probe phase.
    #[must_use]
    pub fn without_probe(mut self) -> Self {
        self.probe = None;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_matches_three_client_flow() {
        let config = ScenarioConfig::reference("s-1");

        let labels: Vec<_> = config.clients.iter().map(|c| c.label.as_str()).collect();
        assert_eq!(labels, ["client1", "client2"]);
        assert!(config.clients[0].idempotent_rejoin);
        assert!(!config.clients[1].idempotent_rejoin);
        assert_eq!(config.probe.as_ref().map(|p| p.identity.user_id.as_str()), Some("u3"));
        assert_eq!(config.settle_delay, Duration::from_millis(200));
    }

    #[test]
    fn with_clients_numbers_probe_after_clients() {
        let config = ScenarioConfig::with_clients("s-1", 4);

        assert_eq!(config.clients.len(), 4);
        assert_eq!(config.probe.unwrap().label, "client5");
        assert_eq!(ScenarioConfig::with_clients("s-1", 0).clients.len(), 2);
    }
}
