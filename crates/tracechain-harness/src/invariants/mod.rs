//! Cross-client invariants.
//!
//! Invariants are checked against a [`ScenarioSnapshot`] built from frozen
//! driver results after every driver has completed. A check whose input is
//! missing (no aggregate, failed join) is a violation, never a skip.
//!
//! # Usage
//!
//! ```ignore
//! let registry = InvariantRegistry::for_config(&config);
//! let lines = registry.evaluate(&snapshot);
//! ```

mod checks;
mod snapshot;

pub use checks::{
    AggregateMonotonicity, CountsConverge, CountsWithinBounds, DisconnectAccounting,
    IdempotentRejoin, RejoinEventCountStable, SequentialEnterCounts, SequentialJoinCounts,
};
pub use snapshot::{ClientSnapshot, ScenarioSnapshot};

use crate::{
    report::Assertion,
    scenario::{ScenarioConfig, StartPolicy},
};

/// Invariant check result.
pub type InvariantResult = Result<(), Violation>;

/// Whether a violation fails the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Violations fail the run
    Required,
    /// Violations are reported as warnings only
    Advisory,
}

/// Every invariant the harness knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvariantKind {
    /// k-th client observes `joined_count == k`
    SequentialJoinCounts,
    /// k-th client observes `enter_event_count == k`
    SequentialEnterCounts,
    /// Rejoin acks ok and never double-counts membership
    IdempotentRejoin,
    /// Counts never decrease within one client's run
    AggregateMonotonicity,
    /// Probe after disconnect observes the net membership
    DisconnectAccounting,
    /// Counts stay within the number of live clients
    CountsWithinBounds,
    /// Some client observes every client joined and entered
    CountsConverge,
    /// Rejoin leaves the enter count alone
    RejoinEventCountStable,
}

impl InvariantKind {
    /// Stable name.
    pub fn name(self) -> &'static str {
        match self {
            Self::SequentialJoinCounts => "SequentialJoinCounts",
            Self::SequentialEnterCounts => "SequentialEnterCounts",
            Self::IdempotentRejoin => "IdempotentRejoin",
            Self::AggregateMonotonicity => "AggregateMonotonicity",
            Self::DisconnectAccounting => "DisconnectAccounting",
            Self::CountsWithinBounds => "CountsWithinBounds",
            Self::CountsConverge => "CountsConverge",
            Self::RejoinEventCountStable => "RejoinEventCountStable",
        }
    }

    /// Report line text.
    pub fn description(self) -> &'static str {
        match self {
            Self::SequentialJoinCounts => "k-th client observes joined_count == k (after k joins)",
            Self::SequentialEnterCounts => {
                "k-th client observes enter_event_count == k (after k enters)"
            },
            Self::IdempotentRejoin => {
                "repeated join_session acks ok without double-counting membership"
            },
            Self::AggregateMonotonicity => "aggregate counts never decrease within a client run",
            Self::DisconnectAccounting => {
                "after disconnect + new join: joined_count reflects decrement then increment"
            },
            Self::CountsWithinBounds => "every observed count is within 1..=N live clients",
            Self::CountsConverge => "some client observes joined_count == enter_event_count == N",
            Self::RejoinEventCountStable => "idempotent rejoin leaves enter_event_count untouched",
        }
    }

    /// Whether a violation fails the run.
    pub fn severity(self) -> Severity {
        match self {
            Self::RejoinEventCountStable => Severity::Advisory,
            _ => Severity::Required,
        }
    }
}

/// Invariant violation with context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Violated invariant
    pub invariant: InvariantKind,
    /// What went wrong
    pub message: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.invariant.name(), self.message)
    }
}

impl std::error::Error for Violation {}

/// A property checked against the scenario snapshot.
pub trait Invariant: Send + Sync {
    /// Which invariant this is.
    fn kind(&self) -> InvariantKind;

    /// Check against the snapshot.
    fn check(&self, state: &ScenarioSnapshot) -> InvariantResult;

    /// Report lines for this invariant. One line unless the check is
    /// naturally per client.
    fn assertions(&self, state: &ScenarioSnapshot) -> Vec<Assertion> {
        let kind = self.kind();
        vec![assertion(kind, kind.description(), self.check(state))]
    }
}

/// Report line for one check outcome, graded by the invariant's severity.
pub(crate) fn assertion(
    kind: InvariantKind,
    description: impl Into<String>,
    result: InvariantResult,
) -> Assertion {
    match (result, kind.severity()) {
        (Ok(()), _) => Assertion::pass(description),
        (Err(v), Severity::Required) => Assertion::fail(description, v.message),
        (Err(v), Severity::Advisory) => Assertion::warn(description, v.message),
    }
}

/// Registry of invariants to check.
pub struct InvariantRegistry {
    invariants: Vec<Box<dyn Invariant>>,
}

impl Default for InvariantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InvariantRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self { invariants: Vec::new() }
    }

    /// Invariants that apply to `config`.
    ///
    /// Sequenced runs get exact per-position counts; concurrent runs get the
    /// range and convergence checks instead. Rejoin and disconnect checks
    /// are only added when the scenario exercises them.
    pub fn for_config(config: &ScenarioConfig) -> Self {
        let mut registry = Self::new();
        match config.start_policy {
            StartPolicy::Sequenced => {
                registry.add(SequentialJoinCounts);
                registry.add(SequentialEnterCounts);
            },
            StartPolicy::Concurrent => {
                registry.add(CountsWithinBounds);
                registry.add(CountsConverge);
            },
        }
        registry.add(AggregateMonotonicity);
        if config.clients.iter().any(|c| c.idempotent_rejoin) {
            registry.add(IdempotentRejoin);
            if config.start_policy == StartPolicy::Sequenced {
                registry.add(RejoinEventCountStable);
            }
        }
        if config.probe.is_some() {
            registry.add(DisconnectAccounting);
        }
        registry
    }

    /// Add an invariant.
    pub fn add<I: Invariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    /// Report lines in registration order.
    pub fn evaluate(&self, state: &ScenarioSnapshot) -> Vec<Assertion> {
        self.invariants.iter().flat_map(|inv| inv.assertions(state)).collect()
    }

    /// Names of registered invariants.
    pub fn kinds(&self) -> Vec<InvariantKind> {
        self.invariants.iter().map(|inv| inv.kind()).collect()
    }
}
