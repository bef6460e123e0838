//! Line-oriented pass/fail report.
//!
//! Header lines are `key=value` context. Every assertion is one line starting
//! with `PASS`, `FAIL` or `WARN`. Only `FAIL` lines affect the exit status.
//! Rendering contains no timestamps, so identical inputs render identically.

use std::fmt;

/// Assertion outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    /// Assertion held
    Pass,
    /// Assertion failed
    Fail,
    /// Advisory divergence, never fails the run
    Warn,
}

impl Verdict {
    /// Line prefix.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Warn => "WARN",
        }
    }
}

/// One report line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assertion {
    /// Outcome
    pub verdict: Verdict,
    /// What was asserted
    pub description: String,
    /// Why it failed or warned
    pub detail: Option<String>,
}

impl Assertion {
    /// Pass when `holds`, otherwise fail without detail.
    pub fn check(holds: bool, description: impl Into<String>) -> Self {
        Self {
            verdict: if holds { Verdict::Pass } else { Verdict::Fail },
            description: description.into(),
            detail: None,
        }
    }

    /// Passing assertion.
    pub fn pass(description: impl Into<String>) -> Self {
        Self::check(true, description)
    }

    /// Failing assertion with detail.
    pub fn fail(description: impl Into<String>, detail: impl Into<String>) -> Self {
        Self { verdict: Verdict::Fail, description: description.into(), detail: Some(detail.into()) }
    }

    /// Advisory warning with detail.
    pub fn warn(description: impl Into<String>, detail: impl Into<String>) -> Self {
        Self { verdict: Verdict::Warn, description: description.into(), detail: Some(detail.into()) }
    }

    /// Attach detail when the assertion did not pass.
    #[must_use]
    pub fn with_detail(mut self, detail: Option<String>) -> Self {
        if self.verdict != Verdict::Pass {
            self.detail = detail;
        }
        self
    }
}

impl fmt::Display for Assertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.verdict.as_str(), self.description)?;
        if let Some(detail) = &self.detail {
            write!(f, " ({detail})")?;
        }
        Ok(())
    }
}

/// Ordered header and assertion lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    header: Vec<(String, String)>,
    assertions: Vec<Assertion>,
}

impl Report {
    /// Empty report.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a `key=value` header line.
    pub fn header(&mut self, key: impl Into<String>, value: impl fmt::Display) {
        self.header.push((key.into(), value.to_string()));
    }

    /// Append an assertion.
    pub fn push(&mut self, assertion: Assertion) {
        self.assertions.push(assertion);
    }

    /// Append several assertions.
    pub fn extend(&mut self, assertions: impl IntoIterator<Item = Assertion>) {
        self.assertions.extend(assertions);
    }

    /// Assertions in order.
    pub fn assertions(&self) -> &[Assertion] {
        &self.assertions
    }

    /// Header value for `key`.
    pub fn header_value(&self, key: &str) -> Option<&str> {
        self.header.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Whether any assertion failed.
    pub fn has_failures(&self) -> bool {
        self.assertions.iter().any(|a| a.verdict == Verdict::Fail)
    }

    /// Count of assertions with `verdict`.
    pub fn count(&self, verdict: Verdict) -> usize {
        self.assertions.iter().filter(|a| a.verdict == verdict).count()
    }

    /// Render as newline-terminated text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.header {
            out.push_str(&format!("{key}={value}\n"));
        }
        for assertion in &self.assertions {
            out.push_str(&format!("{assertion}\n"));
        }
        out
    }
}
