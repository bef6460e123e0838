//! First-satisfying candidate search.

use crate::{
    error::VerifyError,
    requirement::{ChainGap, ChainProof, ChainRequirement},
    span::{SpanStore, TraceExport},
};

/// Checks candidate correlation ids against a [`ChainRequirement`].
///
/// Several sessions may share one export window, so proving the chain for
/// any one real client run is enough. Candidates are tried in the caller's
/// preference order and the first complete one wins.
#[derive(Debug, Clone, Default)]
pub struct TraceVerifier {
    requirement: ChainRequirement,
}

impl TraceVerifier {
    /// Create a verifier for `requirement`.
    pub fn new(requirement: ChainRequirement) -> Self {
        Self { requirement }
    }

    /// Requirement being checked.
    pub fn requirement(&self) -> &ChainRequirement {
        &self.requirement
    }

    /// Find the first candidate with a complete chain.
    ///
    /// An empty store is [`VerifyError::TraceExportMissing`]. Otherwise the
    /// error carries the closest candidate: fewest unmet requirements,
    /// earlier candidates winning ties.
    pub fn verify<S: AsRef<str>>(
        &self,
        candidates: &[S],
        store: &SpanStore,
    ) -> Result<ChainProof, VerifyError> {
        if store.is_empty() {
            return Err(VerifyError::TraceExportMissing("export contains no spans".to_string()));
        }
        let mut best: Option<ChainGap> = None;

        for candidate in candidates {
            let candidate = candidate.as_ref().trim();
            if candidate.is_empty() {
                continue;
            }
            match self.requirement.evaluate(candidate, store.group(candidate)) {
                Ok(proof) => {
                    tracing::debug!(correlation_id = candidate, spans = proof.evidence.len(), "chain complete");
                    return Ok(proof);
                },
                Err(gap) => {
                    tracing::debug!(correlation_id = candidate, unmet = gap.unmet(), "chain incomplete");
                    if best.as_ref().is_none_or(|b| gap.unmet() < b.unmet()) {
                        best = Some(gap);
                    }
                },
            }
        }

        Err(VerifyError::ChainIncomplete { best })
    }

    /// Parse `export_text` and verify it in one step.
    pub fn verify_export<S: AsRef<str>>(
        &self,
        candidates: &[S],
        export_text: &str,
    ) -> Result<ChainProof, VerifyError> {
        let batch = TraceExport::parse(export_text)?.into_batch()?;
        let store = SpanStore::from_batch(batch);
        tracing::debug!(
            correlation_ids = store.correlation_count(),
            uncorrelated = store.uncorrelated(),
            "span store built"
        );
        self.verify(candidates, &store)
    }
}
