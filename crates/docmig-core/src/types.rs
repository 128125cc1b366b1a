use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A stored document: a JSON object carrying its identifier under `_id`.
pub type Document = serde_json::Map<String, Value>;

/// Field holding a document's identifier.
pub const ID_FIELD: &str = "_id";

/// Identifier of a document within its collection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentId(pub String);

impl DocumentId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_value(&self) -> Value {
        Value::String(self.0.clone())
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for DocumentId {
    fn from(s: String) -> Self {
        DocumentId(s)
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        DocumentId(s.to_string())
    }
}

/// Read the identifier of a document. String ids are used as-is and integer
/// ids are stringified; anything else has no usable id.
pub fn document_id(doc: &Document) -> Option<DocumentId> {
    match doc.get(ID_FIELD)? {
        Value::String(s) => Some(DocumentId(s.clone())),
        Value::Number(n) if n.is_i64() || n.is_u64() => Some(DocumentId(n.to_string())),
        _ => None,
    }
}

/// Stable identifier of a migration job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        JobId(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        JobId(s.to_string())
    }
}

impl From<u32> for JobId {
    fn from(n: u32) -> Self {
        JobId(n.to_string())
    }
}

/// Lifecycle of one job invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    NotStarted,
    Running,
    Completed,
    Aborted,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::NotStarted => write!(f, "not_started"),
            JobState::Running => write!(f, "running"),
            JobState::Completed => write!(f, "completed"),
            JobState::Aborted => write!(f, "aborted"),
        }
    }
}

/// Whether executing a job more than once is safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Idempotency {
    /// Re-running has no effect beyond the first successful completion.
    Idempotent,
    /// Re-running may corrupt data (e.g. regenerates identifiers).
    NonIdempotent,
}

impl Idempotency {
    pub fn is_idempotent(self) -> bool {
        matches!(self, Idempotency::Idempotent)
    }
}
