//! Credential acquisition.
//!
//! Issuing tokens belongs to the system under test. The harness only asks a
//! [`TokenSource`] for an opaque string and sends it verbatim in `auth`.

use async_trait::async_trait;
use thiserror::Error;

/// Who a session authenticates as.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity {
    /// Stable user identifier
    pub user_id: String,
    /// Role claimed by the user, e.g. `teacher` or `student`
    pub role: String,
}

impl ClientIdentity {
    /// Create an identity.
    pub fn new(user_id: impl Into<String>, role: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), role: role.into() }
    }
}

/// Token acquisition errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// The source has no credential for this identity.
    #[error("no token for {user_id} ({role})")]
    Unavailable {
        /// User that was asked for
        user_id: String,
        /// Role that was asked for
        role: String,
    },

    /// The source failed for another reason.
    #[error("token source failed: {0}")]
    Source(String),
}

/// Supplies signed credentials for an identity and target session.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Obtain a token for `identity` to join `session_id`.
    async fn token_for(
        &self,
        identity: &ClientIdentity,
        session_id: &str,
    ) -> Result<String, TokenError>;
}

/// Hands out the same pre-issued token to every identity.
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    /// Wrap a pre-issued token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn token_for(
        &self,
        identity: &ClientIdentity,
        _session_id: &str,
    ) -> Result<String, TokenError> {
        if self.0.trim().is_empty() {
            return Err(TokenError::Unavailable {
                user_id: identity.user_id.clone(),
                role: identity.role.clone(),
            });
        }
        Ok(self.0.clone())
    }
}
