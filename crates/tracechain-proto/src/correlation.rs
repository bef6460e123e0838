//! Correlation identifiers.
//!
//! A correlation id is minted once per client session at connect time and
//! never changes afterwards. The harness treats ids echoed by the server as
//! opaque strings, so any value round-trips even if it is not a UUID.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Header name under which the correlation id travels on HTTP-style edges.
pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Field name carrying the correlation id in messages, logs and spans.
pub const CORRELATION_FIELD: &str = "correlation_id";

/// Business identifier field naming the shared session.
pub const BUSINESS_ID_FIELD: &str = "session_id";

/// Older name of [`BUSINESS_ID_FIELD`], still emitted by some servers.
pub const LEGACY_BUSINESS_ID_FIELD: &str = "class_session_id";

/// Opaque per-session correlation token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Mint a fresh random id (UUID v4).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl AsRef<str> for CorrelationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_uuids() {
        let a = CorrelationId::generate();
        let b = CorrelationId::generate();

        assert_ne!(a, b);
        assert!(Uuid::parse_str(a.as_str()).is_ok());
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = CorrelationId::from("abc-123");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc-123\"");

        let back: CorrelationId = serde_json::from_str("\"abc-123\"").unwrap();
        assert_eq!(back, id);
    }
}
