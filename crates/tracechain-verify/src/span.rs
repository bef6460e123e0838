//! Exported spans and their grouping by correlation id.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracechain_proto::CORRELATION_FIELD;

use crate::error::VerifyError;

/// Status written by the evidence emitter when the exporter never ran.
pub const MISSING_FROM_API: &str = "MISSING_FROM_API";

/// Scalar span attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    /// String value
    Str(String),
    /// Integer value
    Int(i64),
    /// Floating point value
    Float(f64),
    /// Boolean value
    Bool(bool),
}

impl AttrValue {
    /// String contents, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Scalar view of a JSON value; `null`, arrays and objects have none.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self::Str(s.clone())),
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => n.as_i64().map(Self::Int).or_else(|| n.as_f64().map(Self::Float)),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    /// Whether the value can stand in for a business identifier.
    ///
    /// Non-blank strings and numbers qualify; booleans never do.
    pub fn is_identifier(&self) -> bool {
        match self {
            Self::Str(s) => !s.trim().is_empty(),
            Self::Int(_) | Self::Float(_) => true,
            Self::Bool(_) => false,
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl std::fmt::Display for AttrValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Str(s) => f.write_str(s),
            Self::Int(n) => write!(f, "{n}"),
            Self::Float(n) => write!(f, "{n}"),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// One exported trace record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    /// Operation kind, e.g. `pg.write`
    pub name: String,
    /// Free-form scalar attributes. Non-scalar values are dropped on parse.
    #[serde(default, deserialize_with = "scalar_attributes")]
    pub attributes: BTreeMap<String, AttrValue>,
}

fn scalar_attributes<'de, D>(deserializer: D) -> Result<BTreeMap<String, AttrValue>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, Value>>::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(key, value)| AttrValue::from_json(&value).map(|v| (key, v)))
        .collect())
}

impl Span {
    /// Create a span with no attributes.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), attributes: BTreeMap::new() }
    }

    /// Add an attribute.
    #[must_use]
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Non-blank `correlation_id` attribute.
    pub fn correlation_id(&self) -> Option<&str> {
        self.attributes
            .get(CORRELATION_FIELD)
            .and_then(AttrValue::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// First of `fields` present with an identifier-like value.
    pub fn business_id(&self, fields: &[String]) -> Option<&AttrValue> {
        fields.iter().filter_map(|f| self.attributes.get(f)).find(|v| v.is_identifier())
    }
}

/// A batch of exported spans.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpanBatch {
    /// Spans in export order
    pub spans: Vec<Span>,
}

impl SpanBatch {
    /// Wrap spans.
    pub fn new(spans: Vec<Span>) -> Self {
        Self { spans }
    }

    /// Pretty-printed export JSON.
    pub fn to_json(&self) -> Result<String, VerifyError> {
        serde_json::to_string_pretty(self).map_err(|e| VerifyError::TraceExportMalformed(e.to_string()))
    }
}

/// Contents of a trace export file.
#[derive(Debug, Clone, PartialEq)]
pub enum TraceExport {
    /// The exporter ran and produced a batch (possibly empty).
    Batch(SpanBatch),
    /// A placeholder object with a `status` and no `spans`.
    Missing {
        /// Marker status, e.g. `MISSING_FROM_API`
        status: String,
        /// Optional explanation
        note: Option<String>,
    },
}

impl TraceExport {
    /// Parse export text.
    ///
    /// Only shape errors are returned here; a marker or an empty batch parses
    /// fine and is rejected by [`TraceExport::into_batch`].
    pub fn parse(text: &str) -> Result<Self, VerifyError> {
        if text.trim().is_empty() {
            return Ok(Self::Missing { status: "EMPTY_FILE".to_string(), note: None });
        }

        let value: Value =
            serde_json::from_str(text).map_err(|e| VerifyError::TraceExportMalformed(e.to_string()))?;
        let Value::Object(object) = &value else {
            return Err(VerifyError::TraceExportMalformed("export is not a JSON object".to_string()));
        };

        if object.contains_key("spans") {
            let batch = SpanBatch::deserialize(value)
                .map_err(|e| VerifyError::TraceExportMalformed(e.to_string()))?;
            return Ok(Self::Batch(batch));
        }

        match object.get("status") {
            Some(Value::String(status)) => Ok(Self::Missing {
                status: status.clone(),
                note: object.get("note").and_then(Value::as_str).map(str::to_string),
            }),
            _ => Err(VerifyError::TraceExportMalformed(
                "object has neither `spans` nor `status`".to_string(),
            )),
        }
    }

    /// Marker for an export that was never produced.
    pub fn missing_marker(note: impl Into<String>) -> Value {
        serde_json::json!({ "status": MISSING_FROM_API, "note": note.into() })
    }

    /// The span batch, or [`VerifyError::TraceExportMissing`] when there is
    /// nothing to verify.
    pub fn into_batch(self) -> Result<SpanBatch, VerifyError> {
        match self {
            Self::Batch(batch) if batch.spans.is_empty() => {
                Err(VerifyError::TraceExportMissing("export contains no spans".to_string()))
            },
            Self::Batch(batch) => Ok(batch),
            Self::Missing { status, note } => Err(VerifyError::TraceExportMissing(match note {
                Some(note) => format!("status {status}: {note}"),
                None => format!("status {status}"),
            })),
        }
    }
}

/// Spans grouped by correlation id.
#[derive(Debug, Clone, Default)]
pub struct SpanStore {
    groups: HashMap<String, Vec<Span>>,
    uncorrelated: usize,
}

impl SpanStore {
    /// Group a batch by its `correlation_id` attribute.
    ///
    /// Spans without one are counted but otherwise ignored.
    pub fn from_batch(batch: SpanBatch) -> Self {
        let mut store = Self::default();
        for span in batch.spans {
            match span.correlation_id() {
                Some(id) => store.groups.entry(id.to_string()).or_default().push(span),
                None => store.uncorrelated += 1,
            }
        }
        store
    }

    /// Spans carrying `correlation_id`, in export order.
    pub fn group(&self, correlation_id: &str) -> &[Span] {
        self.groups.get(correlation_id).map_or(&[], Vec::as_slice)
    }

    /// Number of distinct correlation ids.
    pub fn correlation_count(&self) -> usize {
        self.groups.len()
    }

    /// Number of spans without a correlation id.
    pub fn uncorrelated(&self) -> usize {
        self.uncorrelated
    }

    /// Whether the store holds no spans at all.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.uncorrelated == 0
    }
}
