//! Required literal tokens in log evidence.

use tracechain_proto::{CORRELATION_FIELD, CORRELATION_HEADER};

/// Tokens every evidence blob must contain verbatim.
pub const REQUIRED_TOKENS: [&str; 2] = [CORRELATION_HEADER, CORRELATION_FIELD];

/// Outcome of [`check_evidence_tokens`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TokenCheck {
    /// Required tokens not found
    pub missing: Vec<String>,
    /// Business field found, if any
    pub business_field: Option<String>,
}

impl TokenCheck {
    /// Whether every required token and one business field were found.
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Check `text` for the correlation header, the correlation field, and at
/// least one of `business_fields`.
///
/// When no business field is present, the missing entry lists every accepted
/// name joined with `|`.
pub fn check_evidence_tokens<S: AsRef<str>>(text: &str, business_fields: &[S]) -> TokenCheck {
    let mut missing: Vec<String> = REQUIRED_TOKENS
        .iter()
        .filter(|token| !text.contains(*token))
        .map(ToString::to_string)
        .collect();

    let business_field = business_fields
        .iter()
        .map(AsRef::as_ref)
        .find(|field| text.contains(field))
        .map(str::to_string);
    if business_field.is_none() {
        let names: Vec<&str> = business_fields.iter().map(AsRef::as_ref).collect();
        missing.push(names.join("|"));
    }

    TokenCheck { missing, business_field }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIELDS: [&str; 2] = ["session_id", "class_session_id"];

    #[test]
    fn complete_blob_passes() {
        let text = "x-correlation-id c-1\ncorrelation_id c-1\nclass_session_id s-1\n";
        let check = check_evidence_tokens(text, &FIELDS);

        assert!(check.is_complete());
        assert_eq!(check.business_field.as_deref(), Some("session_id"));
    }

    #[test]
    fn reports_each_missing_token() {
        let check = check_evidence_tokens("nothing useful", &FIELDS);

        assert_eq!(
            check.missing,
            ["x-correlation-id", "correlation_id", "session_id|class_session_id"]
        );
    }

    #[test]
    fn field_token_alone_does_not_imply_header() {
        let check = check_evidence_tokens("correlation_id c-1 session_id s-1", &FIELDS);
        assert_eq!(check.missing, ["x-correlation-id"]);
    }
}
