//! Verifier failure kinds.

use thiserror::Error;

use crate::requirement::ChainGap;

/// Why a chain could not be proven.
///
/// The three kinds are distinct so a missing exporter is never mistaken for
/// a broken one, and neither is mistaken for a real gap in the chain.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VerifyError {
    /// No export, a placeholder marker, or an export with zero spans.
    #[error("trace export missing: {0}")]
    TraceExportMissing(String),

    /// The export is not valid JSON of the expected shape.
    #[error("trace export malformed: {0}")]
    TraceExportMalformed(String),

    /// Spans exist but no candidate id has a complete chain.
    #[error("chain incomplete: {}", describe_gap(.best.as_ref()))]
    ChainIncomplete {
        /// Closest candidate, `None` when no candidates were given
        best: Option<ChainGap>,
    },
}

impl VerifyError {
    /// Short stable label for reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TraceExportMissing(_) => "TraceExportMissing",
            Self::TraceExportMalformed(_) => "TraceExportMalformed",
            Self::ChainIncomplete { .. } => "ChainIncomplete",
        }
    }
}

fn describe_gap(best: Option<&ChainGap>) -> String {
    best.map_or_else(|| "no candidate correlation ids".to_string(), ToString::to_string)
}
