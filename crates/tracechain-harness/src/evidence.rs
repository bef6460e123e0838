//! Evidence emitter.
//!
//! Writes the run's artifacts under a fixed layout. Every file is written
//! whole to a temporary file in its target directory and renamed into place,
//! so a reader never sees a partial artifact. The trace export belongs to the
//! system under test and is never overwritten; when it is absent a
//! `MISSING_FROM_API` marker takes its place.

use std::{
    collections::HashSet,
    io::Write,
    path::{Path, PathBuf},
};

use tempfile::NamedTempFile;
use tracechain_proto::{BUSINESS_ID_FIELD, CORRELATION_FIELD, CORRELATION_HEADER};
use tracechain_verify::TraceExport;

use crate::{error::EvidenceError, orchestrator::ScenarioOutcome, report::Report};

/// Note carried by the marker written in place of an absent trace export.
pub const MISSING_EXPORT_NOTE: &str = "trace export was not produced by the system under test";

/// Artifact paths under one root directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl Default for ArtifactLayout {
    fn default() -> Self {
        Self::new("artifacts")
    }
}

impl ArtifactLayout {
    /// Layout rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Pass/fail report of the scenario run.
    pub fn report(&self) -> PathBuf {
        self.root.join("tests").join("e2e-ws-report.txt")
    }

    /// Token-bearing service log blob.
    pub fn service_logs(&self) -> PathBuf {
        self.observability("service-logs.txt")
    }

    /// One correlation id per line.
    pub fn correlation_ids(&self) -> PathBuf {
        self.observability("correlation-ids.txt")
    }

    /// Timestamped timeline.
    pub fn timeline(&self) -> PathBuf {
        self.observability("e2e-timeline.txt")
    }

    /// Span export, or its missing marker.
    pub fn trace_export(&self) -> PathBuf {
        self.observability("trace-export.json")
    }

    /// Pass/fail report of the trace chain gate.
    pub fn trace_chain_report(&self) -> PathBuf {
        self.observability("trace-chain-report.txt")
    }

    fn observability(&self, file: &str) -> PathBuf {
        self.root.join("observability").join(file)
    }
}

/// Writes run artifacts into an [`ArtifactLayout`].
#[derive(Debug, Clone, Default)]
pub struct EvidenceWriter {
    layout: ArtifactLayout,
}

impl EvidenceWriter {
    /// Writer for `layout`.
    pub fn new(layout: ArtifactLayout) -> Self {
        Self { layout }
    }

    /// Target layout.
    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    /// Write every scenario artifact and make sure a trace export exists.
    pub fn write_run(&self, outcome: &ScenarioOutcome) -> Result<(), EvidenceError> {
        write_atomic(&self.layout.report(), outcome.report.render().as_bytes())?;
        write_atomic(&self.layout.service_logs(), render_service_logs(outcome).as_bytes())?;
        write_atomic(&self.layout.correlation_ids(), render_lines(outcome.correlation_ids()).as_bytes())?;
        write_atomic(&self.layout.timeline(), render_lines(outcome.timeline.iter()).as_bytes())?;
        self.ensure_trace_export()?;

        tracing::info!(root = %self.layout.root().display(), "evidence written");
        Ok(())
    }

    /// Write the missing marker unless an export already exists.
    ///
    /// Returns whether the marker was written.
    pub fn ensure_trace_export(&self) -> Result<bool, EvidenceError> {
        let path = self.layout.trace_export();
        if path.exists() {
            return Ok(false);
        }
        let marker = serde_json::to_string_pretty(&TraceExport::missing_marker(MISSING_EXPORT_NOTE))
            .map_err(|e| EvidenceError::Serialize(e.to_string()))?;
        write_atomic(&path, marker.as_bytes())?;
        tracing::warn!(path = %path.display(), "trace export absent, wrote marker");
        Ok(true)
    }

    /// Write the trace chain gate report.
    pub fn write_trace_chain_report(&self, report: &Report) -> Result<(), EvidenceError> {
        write_atomic(&self.layout.trace_chain_report(), report.render().as_bytes())
    }
}

/// Required tokens, then per-client evidence, then the ids themselves.
///
/// Duplicate lines are dropped, keeping the first occurrence.
pub fn render_service_logs(outcome: &ScenarioOutcome) -> String {
    let tokens = [CORRELATION_HEADER, CORRELATION_FIELD, BUSINESS_ID_FIELD].map(str::to_string);
    let evidence = outcome.results().flat_map(|r| r.evidence.iter().cloned());
    let ids = outcome
        .correlation_ids()
        .into_iter()
        .map(|cid| format!("{CORRELATION_FIELD} {cid}"))
        .chain([format!("{BUSINESS_ID_FIELD} {}", outcome.session_id)]);

    let mut seen = HashSet::new();
    let lines: Vec<String> =
        tokens.into_iter().chain(evidence).chain(ids).filter(|l| seen.insert(l.clone())).collect();
    render_lines(lines)
}

fn render_lines<I>(lines: I) -> String
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut out = String::new();
    for line in lines {
        out.push_str(line.as_ref());
        out.push('\n');
    }
    out
}

/// Replace `path` with `bytes` in one rename.
///
/// Parent directories are created as needed.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), EvidenceError> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(|e| EvidenceError::io(dir, e))?;

    let mut file = NamedTempFile::new_in(dir).map_err(|e| EvidenceError::io(dir, e))?;
    file.write_all(bytes).map_err(|e| EvidenceError::io(file.path(), e))?;
    file.as_file().sync_all().map_err(|e| EvidenceError::io(file.path(), e))?;
    file.persist(path).map_err(|e| EvidenceError::io(path, e.error))?;
    Ok(())
}
