//! Trace chain verifier.
//!
//! Proves that one client correlation id threads through a fixed set of
//! operation kinds in an exported span batch: ingress message, durable write,
//! cache aggregate update, and fan-out push.
//!
//! # Architecture
//!
//! Parsing, grouping and checking are separate, pure steps. [`TraceExport`]
//! turns the raw export into a [`SpanBatch`] or tells a missing export apart
//! from a malformed one, [`SpanStore`] groups spans by correlation id, and
//! [`TraceVerifier`] walks the candidate ids in preference order against a
//! [`ChainRequirement`]. Nothing here does I/O, so verification can be
//! repeated against the same export with identical results.
//!
//! # Components
//!
//! - [`Span`], [`AttrValue`], [`SpanBatch`]: exported trace records
//! - [`TraceExport`]: batch or missing-export marker
//! - [`ChainRequirement`]: required kinds plus business identifier fields
//! - [`TraceVerifier`]: first-satisfying candidate search
//! - [`check_evidence_tokens`]: required literal tokens in log evidence

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod evidence;
mod requirement;
mod span;
mod verifier;

pub use error::VerifyError;
pub use evidence::{REQUIRED_TOKENS, TokenCheck, check_evidence_tokens};
pub use requirement::{ChainGap, ChainProof, ChainRequirement};
pub use span::{AttrValue, MISSING_FROM_API, Span, SpanBatch, SpanStore, TraceExport};
pub use verifier::TraceVerifier;
