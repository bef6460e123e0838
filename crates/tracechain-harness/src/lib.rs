//! Harness
//!
//! Multi-client real-time session E2E harness: runs several protocol drivers
//! against one shared session, checks cross-client aggregate invariants,
//! writes evidence artifacts, and gates a run on a complete trace chain.
//!
//! # Architecture
//!
//! The [`Orchestrator`] owns the run. Each client is a
//! [`tracechain_client::SessionDriver`] on its own tokio task; results are
//! frozen into a [`ScenarioSnapshot`] only after every task has finished, and
//! the [`InvariantRegistry`] turns the snapshot into report lines. The
//! [`EvidenceWriter`] persists everything atomically, and the
//! [`TraceChainGate`] re-reads those artifacts to prove the chain.
//!
//! [`SessionHub`] is a sans-IO reference implementation of the system under
//! test: it consumes [`HubEvent`]s and returns [`HubAction`]s. [`SimServer`]
//! executes those actions over line-delimited JSON streams so the whole
//! harness can run in-process or under turmoil.
//!
//! # Components
//!
//! - [`Orchestrator`], [`ScenarioConfig`]: scenario sequencing
//! - [`InvariantRegistry`], [`ScenarioSnapshot`]: cross-client checks
//! - [`Report`], [`Assertion`]: `PASS`/`FAIL`/`WARN` lines
//! - [`EvidenceWriter`], [`ArtifactLayout`]: artifact files
//! - [`TraceChainGate`]: trace export and log token gate
//! - [`SessionHub`], [`SimServer`]: reference system under test

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod evidence;
mod gate;
mod hub;
pub mod invariants;
mod orchestrator;
mod report;
mod scenario;
mod sim_server;
mod sim_transport;

pub use error::{EvidenceError, HarnessError};
pub use evidence::{
    ArtifactLayout, EvidenceWriter, MISSING_EXPORT_NOTE, render_service_logs, write_atomic,
};
pub use gate::{GateInput, TraceChainGate};
pub use hub::{ConnId, HubAction, HubConfig, HubEvent, SessionHub, SimFaults, span_names};
pub use invariants::{InvariantKind, InvariantRegistry, ScenarioSnapshot};
pub use orchestrator::{Orchestrator, ScenarioOutcome};
pub use report::{Assertion, Report, Verdict};
pub use scenario::{ClientSpec, DEFAULT_SETTLE_DELAY, ScenarioConfig, StartPolicy};
pub use sim_server::{Acceptor, SimServer, SimServerConfig};
pub use sim_transport::{MemoryConnector, TurmoilConnector};

/// Process exit code when every assertion passed.
pub const EXIT_PASS: u8 = 0;

/// Process exit code when any assertion failed.
pub const EXIT_FAIL: u8 = 2;

/// Process exit code when the harness itself could not run or write evidence.
pub const EXIT_INFRA: u8 = 3;

/// Exit code for a finished run.
pub fn exit_code(report: &Report) -> u8 {
    if report.has_failures() { EXIT_FAIL } else { EXIT_PASS }
}
