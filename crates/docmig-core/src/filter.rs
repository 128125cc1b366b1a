//! Query predicates over documents.
//!
//! A [`Filter`] is plain data so it can be evaluated in memory, shipped to a
//! backend as JSON, and hashed into a job fingerprint.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{Document, ID_FIELD};

/// A predicate selecting documents. Paths are dot-separated and walk nested
/// objects (`"meta.owner.id"`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Filter {
    /// Matches every document.
    #[default]
    All,
    /// Field is present (a `null` value counts as present).
    Exists { path: String },
    /// Field is absent.
    Missing { path: String },
    /// Field equals `value`. `null` also matches an absent field.
    Eq { path: String, value: Value },
    /// Negation of `Eq`; matches absent fields.
    Ne { path: String, value: Value },
    In { path: String, values: Vec<Value> },
    Nin { path: String, values: Vec<Value> },
    Gt { path: String, value: Value },
    Lt { path: String, value: Value },
    And { filters: Vec<Filter> },
    Or { filters: Vec<Filter> },
    Not { filter: Box<Filter> },
}

impl Filter {
    pub fn exists(path: &str) -> Self {
        Filter::Exists {
            path: path.to_string(),
        }
    }

    pub fn missing(path: &str) -> Self {
        Filter::Missing {
            path: path.to_string(),
        }
    }

    pub fn equals(path: &str, value: impl Into<Value>) -> Self {
        Filter::Eq {
            path: path.to_string(),
            value: value.into(),
        }
    }

    pub fn not_equals(path: &str, value: impl Into<Value>) -> Self {
        Filter::Ne {
            path: path.to_string(),
            value: value.into(),
        }
    }

    pub fn is_in(path: &str, values: Vec<Value>) -> Self {
        Filter::In {
            path: path.to_string(),
            values,
        }
    }

    pub fn not_in(path: &str, values: Vec<Value>) -> Self {
        Filter::Nin {
            path: path.to_string(),
            values,
        }
    }

    pub fn gt(path: &str, value: impl Into<Value>) -> Self {
        Filter::Gt {
            path: path.to_string(),
            value: value.into(),
        }
    }

    pub fn lt(path: &str, value: impl Into<Value>) -> Self {
        Filter::Lt {
            path: path.to_string(),
            value: value.into(),
        }
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::And { filters }
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Or { filters }
    }

    pub fn negate(filter: Filter) -> Self {
        Filter::Not {
            filter: Box::new(filter),
        }
    }

    /// Evaluate the predicate against a document.
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::All => true,
            Filter::Exists { path } => lookup(doc, path).is_some(),
            Filter::Missing { path } => lookup(doc, path).is_none(),
            Filter::Eq { path, value } => field_equals(doc, path, value),
            Filter::Ne { path, value } => !field_equals(doc, path, value),
            Filter::In { path, values } => values.iter().any(|v| field_equals(doc, path, v)),
            Filter::Nin { path, values } => !values.iter().any(|v| field_equals(doc, path, v)),
            Filter::Gt { path, value } => {
                compare_field(doc, path, value) == Some(Ordering::Greater)
            }
            Filter::Lt { path, value } => compare_field(doc, path, value) == Some(Ordering::Less),
            Filter::And { filters } => filters.iter().all(|f| f.matches(doc)),
            Filter::Or { filters } => filters.iter().any(|f| f.matches(doc)),
            Filter::Not { filter } => !filter.matches(doc),
        }
    }
}

/// Resolve a dotted path inside a document.
pub fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn field_equals(doc: &Document, path: &str, expected: &Value) -> bool {
    match lookup(doc, path) {
        Some(actual) => values_equal(actual, expected),
        None => expected.is_null(),
    }
}

/// JSON equality where numbers compare by value, so `1` equals `1.0`.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| values_equal(x, y)))
        }
        _ => a == b,
    }
}

fn compare_field(doc: &Document, path: &str, bound: &Value) -> Option<Ordering> {
    match (lookup(doc, path)?, bound) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// A paged query against one collection.
#[derive(Debug, Clone, Default)]
pub struct FindQuery {
    pub filter: Filter,
    /// Top-level fields to return; `None` returns whole documents.
    pub projection: Option<Vec<String>>,
    pub limit: Option<usize>,
}

impl FindQuery {
    pub fn new(filter: Filter) -> Self {
        FindQuery {
            filter,
            projection: None,
            limit: None,
        }
    }

    pub fn with_projection(mut self, projection: Option<Vec<String>>) -> Self {
        self.projection = projection;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Apply the projection, if any, to a fetched document.
    pub fn shape(&self, doc: Document) -> Document {
        match &self.projection {
            Some(fields) => project(&doc, fields),
            None => doc,
        }
    }
}

/// Keep only the named top-level fields. `_id` is always kept.
pub fn project(doc: &Document, fields: &[String]) -> Document {
    doc.iter()
        .filter(|(key, _)| key.as_str() == ID_FIELD || fields.iter().any(|f| f == *key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}
