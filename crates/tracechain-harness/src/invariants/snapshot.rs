//! Frozen per-client observations for invariant checking.
//!
//! Snapshots are literal copies of what each driver received. Nothing here
//! recomputes counters; invariants compare what the server reported.

use tracechain_client::SessionDriverResult;
use tracechain_proto::AggregateSnapshot;

use crate::scenario::StartPolicy;

/// Observations of the whole run.
#[derive(Debug, Clone, Default)]
pub struct ScenarioSnapshot {
    /// Start policy the run used
    pub policy: StartPolicy,
    /// Clients in start order
    pub clients: Vec<ClientSnapshot>,
    /// Label of the client disconnected before the probe
    pub disconnected: Option<String>,
    /// Probe client started after the disconnect
    pub probe: Option<ClientSnapshot>,
}

impl ScenarioSnapshot {
    /// Snapshot for `policy` with no clients.
    pub fn new(policy: StartPolicy) -> Self {
        Self { policy, ..Self::default() }
    }

    /// Number of clients connected before the disconnect.
    pub fn live_clients(&self) -> u64 {
        self.clients.len() as u64
    }

    /// Clients and probe, in start order.
    pub fn all(&self) -> impl Iterator<Item = &ClientSnapshot> {
        self.clients.iter().chain(self.probe.iter())
    }
}

/// What one client observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientSnapshot {
    /// Report label
    pub label: String,
    /// 1-based start position
    pub position: u64,
    /// First join acked ok
    pub join_ok: bool,
    /// Event acked ok
    pub event_ack_ok: bool,
    /// Rejoin was configured for this client
    pub rejoin_requested: bool,
    /// Rejoin outcome, if attempted
    pub rejoin_ok: Option<bool>,
    /// Latest aggregate after the event
    pub aggregate: Option<AggregateSnapshot>,
    /// Every aggregate received during the run
    pub history: Vec<AggregateSnapshot>,
    /// Aggregates between the first join ack and the event send
    pub rejoin_aggregates: Vec<AggregateSnapshot>,
}

impl ClientSnapshot {
    /// Freeze a driver result.
    pub fn from_result(position: u64, result: &SessionDriverResult, rejoin_requested: bool) -> Self {
        Self {
            label: result.label.clone(),
            position,
            join_ok: result.join_ok,
            event_ack_ok: result.event_ack_ok,
            rejoin_requested,
            rejoin_ok: result.rejoin_ok,
            aggregate: result.last_aggregate.clone(),
            history: result.aggregates.clone(),
            rejoin_aggregates: result.rejoin_aggregates.clone(),
        }
    }
}
