//! Chain completeness rule.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracechain_proto::{BUSINESS_ID_FIELD, LEGACY_BUSINESS_ID_FIELD};

use crate::span::Span;

/// Operation kinds a complete chain must cover, in causal order.
const STANDARD_KINDS: [&str; 4] = ["ws.message", "pg.write", "redis.update", "ws.push"];

/// What a correlation id's spans must collectively show.
///
/// Kinds are matched by substring of the span name and are order-insensitive.
/// The business identifier may sit on any span of the group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainRequirement {
    /// Required operation-kind substrings
    pub kinds: Vec<String>,
    /// Attribute names accepted as the business identifier
    pub business_id_fields: Vec<String>,
}

impl Default for ChainRequirement {
    fn default() -> Self {
        Self::standard()
    }
}

impl ChainRequirement {
    /// Ingress message, durable write, cache update, fan-out push.
    pub fn standard() -> Self {
        Self {
            kinds: STANDARD_KINDS.iter().map(ToString::to_string).collect(),
            business_id_fields: vec![
                BUSINESS_ID_FIELD.to_string(),
                LEGACY_BUSINESS_ID_FIELD.to_string(),
            ],
        }
    }

    /// Check one correlation id's spans.
    pub fn evaluate(&self, correlation_id: &str, spans: &[Span]) -> Result<ChainProof, ChainGap> {
        let missing_kinds: Vec<String> = self
            .kinds
            .iter()
            .filter(|kind| !spans.iter().any(|s| s.name.contains(kind.as_str())))
            .cloned()
            .collect();
        let business_id = spans.iter().find_map(|s| s.business_id(&self.business_id_fields));

        match business_id {
            Some(business_id) if missing_kinds.is_empty() => Ok(ChainProof {
                correlation_id: correlation_id.to_string(),
                business_id: business_id.to_string(),
                evidence: spans.iter().filter(|s| self.is_evidence(s)).cloned().collect(),
            }),
            _ => Err(ChainGap {
                correlation_id: correlation_id.to_string(),
                span_count: spans.len(),
                missing_kinds,
                missing_business_id: business_id.is_none(),
            }),
        }
    }

    fn is_evidence(&self, span: &Span) -> bool {
        self.kinds.iter().any(|k| span.name.contains(k.as_str()))
            || span.business_id(&self.business_id_fields).is_some()
    }
}

/// A candidate whose spans satisfy the requirement.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainProof {
    /// Winning correlation id
    pub correlation_id: String,
    /// First business identifier found in the group
    pub business_id: String,
    /// Spans that matched a kind or carried the business identifier
    pub evidence: Vec<Span>,
}

/// What a candidate was missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainGap {
    /// Candidate correlation id
    pub correlation_id: String,
    /// Spans found under the id
    pub span_count: usize,
    /// Required kinds with no matching span
    pub missing_kinds: Vec<String>,
    /// No span carried a business identifier
    pub missing_business_id: bool,
}

impl ChainGap {
    /// Number of unmet requirements.
    pub fn unmet(&self) -> usize {
        self.missing_kinds.len() + usize::from(self.missing_business_id)
    }
}

impl fmt::Display for ChainGap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "correlation_id {} ({} spans)", self.correlation_id, self.span_count)?;
        if !self.missing_kinds.is_empty() {
            write!(f, " missing kinds [{}]", self.missing_kinds.join(", "))?;
        }
        if self.missing_business_id {
            f.write_str(" missing business identifier")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(cid: &str) -> Vec<Span> {
        vec![
            Span::new("ws.message").with_attr("correlation_id", cid),
            Span::new("pg.write").with_attr("correlation_id", cid).with_attr("session_id", "s-1"),
            Span::new("redis.update").with_attr("correlation_id", cid),
            Span::new("ws.push").with_attr("correlation_id", cid),
        ]
    }

    #[test]
    fn complete_chain_is_proven() {
        let proof = ChainRequirement::standard().evaluate("c-1", &chain("c-1")).unwrap();

        assert_eq!(proof.correlation_id, "c-1");
        assert_eq!(proof.business_id, "s-1");
        assert_eq!(proof.evidence.len(), 4);
    }

    #[test]
    fn kinds_match_by_substring_in_any_order() {
        let mut spans = chain("c-1");
        spans.reverse();
        spans[0].name = "svc.ws.push.fanout".to_string();

        assert!(ChainRequirement::standard().evaluate("c-1", &spans).is_ok());
    }

    #[test]
    fn gap_names_missing_kind_and_business_id() {
        let spans: Vec<_> = chain("c-1")
            .into_iter()
            .filter(|s| s.name != "redis.update")
            .map(|mut s| {
                s.attributes.remove("session_id");
                s
            })
            .collect();

        let gap = ChainRequirement::standard().evaluate("c-1", &spans).unwrap_err();

        assert_eq!(gap.missing_kinds, ["redis.update"]);
        assert!(gap.missing_business_id);
        assert_eq!(gap.unmet(), 2);
        insta::assert_snapshot!(
            gap.to_string(),
            @"correlation_id c-1 (3 spans) missing kinds [redis.update] missing business identifier"
        );
    }

    #[test]
    fn legacy_business_field_counts() {
        let spans: Vec<_> = chain("c-1")
            .into_iter()
            .map(|mut s| {
                if s.attributes.remove("session_id").is_some() {
                    s = s.with_attr("class_session_id", "cs-9");
                }
                s
            })
            .collect();

        let proof = ChainRequirement::standard().evaluate("c-1", &spans).unwrap();
        assert_eq!(proof.business_id, "cs-9");
    }
}
