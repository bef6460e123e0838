//! Trace chain gate.
//!
//! Reads the artifacts of a finished run and checks that the exported spans
//! prove one client's correlation id through every required operation kind,
//! and that the service logs carry the required literal tokens. Each verifier
//! failure kind is named in its report line so a missing exporter, a broken
//! export and a real gap read differently.

use std::path::Path;

use tracechain_verify::{TraceVerifier, VerifyError, check_evidence_tokens};

use crate::{
    error::EvidenceError,
    evidence::ArtifactLayout,
    report::{Assertion, Report},
};

/// Inputs the gate checks, already read from disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GateInput {
    /// Trace export text, `None` when the file does not exist
    pub trace_export: Option<String>,
    /// Service log blob
    pub service_logs: String,
    /// Candidate correlation ids, most recent first
    pub candidates: Vec<String>,
}

impl GateInput {
    /// Read the gate inputs from `layout`.
    ///
    /// Missing files read as empty; only other I/O errors are returned.
    pub fn load(layout: &ArtifactLayout) -> Result<Self, EvidenceError> {
        let ids = read_optional(&layout.correlation_ids())?.unwrap_or_default();
        let mut candidates: Vec<String> =
            ids.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_string).collect();
        candidates.reverse();

        Ok(Self {
            trace_export: read_optional(&layout.trace_export())?,
            service_logs: read_optional(&layout.service_logs())?.unwrap_or_default(),
            candidates,
        })
    }
}

fn read_optional(path: &Path) -> Result<Option<String>, EvidenceError> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(EvidenceError::Io { path: path.to_path_buf(), source: e }),
    }
}

/// Checks a run's trace export and log evidence.
#[derive(Debug, Clone, Default)]
pub struct TraceChainGate {
    verifier: TraceVerifier,
}

impl TraceChainGate {
    /// Gate using `verifier`.
    pub fn new(verifier: TraceVerifier) -> Self {
        Self { verifier }
    }

    /// Evaluate `input` into a report.
    pub fn evaluate(&self, input: &GateInput) -> Report {
        let requirement = self.verifier.requirement();
        let mut report = Report::new();
        report.header("candidates", input.candidates.len());
        report.header("required_kinds", requirement.kinds.join(","));

        report.push(Assertion::check(
            !input.candidates.is_empty(),
            "client correlation ids recorded",
        ));

        let chain = format!(
            "trace chain complete for one client correlation_id ({} + business id)",
            requirement.kinds.join(", ")
        );
        match input.trace_export.as_deref() {
            None => report.push(Assertion::fail(
                chain,
                "TraceExportMissing: trace export file does not exist",
            )),
            Some(text) => match self.verifier.verify_export(&input.candidates, text) {
                Ok(proof) => {
                    tracing::info!(correlation_id = %proof.correlation_id, "trace chain proven");
                    report.header("proven_correlation_id", &proof.correlation_id);
                    report.header("business_id", &proof.business_id);
                    report.push(Assertion::pass(chain));
                },
                Err(e) => {
                    tracing::warn!(kind = e.kind(), error = %e, "trace chain not proven");
                    report.push(Assertion::fail(chain, describe(&e)));
                },
            },
        }

        let tokens = check_evidence_tokens(&input.service_logs, &requirement.business_id_fields);
        report.push(
            Assertion::check(
                tokens.is_complete(),
                "service logs contain x-correlation-id, correlation_id and a business id field",
            )
            .with_detail(Some(format!("missing: {}", tokens.missing.join(", ")))),
        );

        report
    }

    /// Load inputs from `layout` and evaluate them.
    pub fn run(&self, layout: &ArtifactLayout) -> Result<Report, EvidenceError> {
        Ok(self.evaluate(&GateInput::load(layout)?))
    }
}

fn describe(error: &VerifyError) -> String {
    match error {
        VerifyError::TraceExportMissing(why) | VerifyError::TraceExportMalformed(why) => {
            format!("{}: {why}", error.kind())
        },
        VerifyError::ChainIncomplete { best: Some(gap) } => format!("{}: {gap}", error.kind()),
        VerifyError::ChainIncomplete { best: None } => {
            format!("{}: no candidate correlation ids", error.kind())
        },
    }
}

#[cfg(test)]
mod tests {
    use tracechain_verify::{Span, SpanBatch};

    use super::*;
    use crate::report::Verdict;

    fn export(cid: &str, kinds: &[&str]) -> String {
        let spans = kinds
            .iter()
            .map(|k| Span::new(*k).with_attr("correlation_id", cid).with_attr("session_id", "s-1"))
            .collect();
        SpanBatch::new(spans).to_json().unwrap()
    }

    fn input(trace_export: Option<String>) -> GateInput {
        GateInput {
            trace_export,
            service_logs: "x-correlation-id c-2\ncorrelation_id c-2\nsession_id s-1\n".to_string(),
            candidates: vec!["c-2".to_string(), "c-1".to_string()],
        }
    }

    fn chain_line(report: &Report) -> &Assertion {
        &report.assertions()[1]
    }

    #[test]
    fn complete_chain_passes() {
        let text = export("c-1", &["ws.message", "pg.write", "redis.update", "ws.push"]);
        let report = TraceChainGate::default().evaluate(&input(Some(text)));

        assert!(!report.has_failures(), "{}", report.render());
        assert_eq!(report.header_value("proven_correlation_id"), Some("c-1"));
        assert_eq!(report.count(Verdict::Pass), 3);
    }

    #[test]
    fn failure_kinds_stay_distinct() {
        let cases = [
            (None, "TraceExportMissing: trace export file does not exist"),
            (Some(r#"{"status":"MISSING_FROM_API"}"#.to_string()), "TraceExportMissing: status MISSING_FROM_API"),
            (Some("{oops".to_string()), "TraceExportMalformed: "),
            (
                Some(export("c-1", &["ws.message", "pg.write", "ws.push"])),
                "ChainIncomplete: correlation_id c-1 (3 spans) missing kinds [redis.update]",
            ),
        ];
        for (text, expected) in cases {
            let report = TraceChainGate::default().evaluate(&input(text));
            let detail = chain_line(&report).detail.clone().unwrap_or_default();
            assert_eq!(chain_line(&report).verdict, Verdict::Fail);
            assert!(detail.starts_with(expected), "{detail}");
        }
    }

    #[test]
    fn missing_tokens_are_named() {
        let mut input = input(None);
        input.service_logs = "correlation_id c-2\n".to_string();
        let report = TraceChainGate::default().evaluate(&input);

        assert_eq!(
            report.assertions()[2].to_string(),
            "FAIL service logs contain x-correlation-id, correlation_id and a business id field \
             (missing: x-correlation-id, session_id|class_session_id)"
        );
    }

    #[test]
    fn loads_candidates_most_recent_first() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ArtifactLayout::new(dir.path());
        crate::evidence::write_atomic(&layout.correlation_ids(), b"c-1\nc-2\n\nc-3\n").unwrap();

        let input = GateInput::load(&layout).unwrap();
        assert_eq!(input.candidates, ["c-3", "c-2", "c-1"]);
        assert_eq!(input.trace_export, None);
        assert!(input.service_logs.is_empty());
    }

    #[test]
    fn repeated_evaluation_is_identical() {
        let gate = TraceChainGate::default();
        let input = input(Some(export("c-2", &["ws.message", "pg.write", "redis.update", "ws.push"])));
        assert_eq!(gate.evaluate(&input).render(), gate.evaluate(&input).render());
    }
}
