//! Write operations produced by transforms and applied by bulk writes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MigrationError, Result};
use crate::types::{Document, DocumentId, ID_FIELD};

/// Field-level modifications for a single document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Update {
    #[serde(default)]
    pub rename: Vec<(String, String)>,
    #[serde(default)]
    pub set: BTreeMap<String, Value>,
    #[serde(default)]
    pub unset: Vec<String>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, path: &str, value: impl Into<Value>) -> Self {
        self.set.insert(path.to_string(), value.into());
        self
    }

    pub fn unset(mut self, path: &str) -> Self {
        self.unset.push(path.to_string());
        self
    }

    /// Move the value at `from` to `to`. A missing source is a no-op.
    pub fn rename(mut self, from: &str, to: &str) -> Self {
        self.rename.push((from.to_string(), to.to_string()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rename.is_empty() && self.set.is_empty() && self.unset.is_empty()
    }

    /// Apply renames, then sets, then unsets. Returns whether the document
    /// changed. On error the document is left untouched.
    pub fn apply(&self, doc: &mut Document) -> Result<bool> {
        let mut updated = doc.clone();

        for (from, to) in &self.rename {
            guard_id(from)?;
            guard_id(to)?;
            if let Some(value) = remove_path(&mut updated, from) {
                set_path(&mut updated, to, value)?;
            }
        }
        for (path, value) in &self.set {
            guard_id(path)?;
            set_path(&mut updated, path, value.clone())?;
        }
        for path in &self.unset {
            guard_id(path)?;
            remove_path(&mut updated, path);
        }

        if updated == *doc {
            return Ok(false);
        }
        *doc = updated;
        Ok(true)
    }
}

fn guard_id(path: &str) -> Result<()> {
    if path == ID_FIELD || path.starts_with("_id.") {
        return Err(MigrationError::InvalidUpdate {
            path: path.to_string(),
            reason: "document id is immutable".to_string(),
        });
    }
    Ok(())
}

fn set_path(doc: &mut Document, path: &str, value: Value) -> Result<()> {
    let segments: Vec<&str> = path.split('.').collect();
    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| MigrationError::InvalidArgument("empty update path".to_string()))?;

    let mut current = doc;
    for segment in parents {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        current = entry
            .as_object_mut()
            .ok_or_else(|| MigrationError::InvalidUpdate {
                path: path.to_string(),
                reason: format!("'{}' is not an object", segment),
            })?;
    }
    current.insert(last.to_string(), value);
    Ok(())
}

fn remove_path(doc: &mut Document, path: &str) -> Option<Value> {
    let segments: Vec<&str> = path.split('.').collect();
    let (last, parents) = segments.split_last()?;

    let mut current = doc;
    for segment in parents {
        current = current.get_mut(*segment)?.as_object_mut()?;
    }
    current.remove(*last)
}

/// What a transform decided for one document.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Update(Update),
    Delete,
    Skip,
}

/// A single operation inside a bulk write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WriteOp {
    UpdateOne { id: DocumentId, update: Update },
    DeleteOne { id: DocumentId },
}

impl WriteOp {
    pub fn id(&self) -> &DocumentId {
        match self {
            WriteOp::UpdateOne { id, .. } => id,
            WriteOp::DeleteOne { id } => id,
        }
    }

    /// Build the operation for a transform outcome; `Skip` has none.
    pub fn from_outcome(id: DocumentId, outcome: Outcome) -> Option<Self> {
        match outcome {
            Outcome::Update(update) => Some(WriteOp::UpdateOne { id, update }),
            Outcome::Delete => Some(WriteOp::DeleteOne { id }),
            Outcome::Skip => None,
        }
    }
}

/// One rejected operation of a bulk write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteFailure {
    /// Position of the operation in the submitted batch.
    pub index: usize,
    pub id: DocumentId,
    pub message: String,
}

/// Result of an unordered bulk write. Rejected operations are reported in
/// `failures`; the rest of the batch is still applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteSummary {
    pub matched: usize,
    pub modified: usize,
    pub deleted: usize,
    pub failures: Vec<WriteFailure>,
}

impl WriteSummary {
    /// Record the outcome of applying `op` to the document it targets, if
    /// present. Shared by every backend so they agree on counting.
    pub fn apply_op(
        &mut self,
        index: usize,
        op: &WriteOp,
        target: Option<&mut Document>,
    ) -> OpEffect {
        let Some(doc) = target else {
            return OpEffect::NotFound;
        };
        self.matched += 1;
        match op {
            WriteOp::UpdateOne { update, .. } => match update.apply(doc) {
                Ok(true) => {
                    self.modified += 1;
                    OpEffect::Modified
                }
                Ok(false) => OpEffect::Unchanged,
                Err(e) => {
                    self.failures.push(WriteFailure {
                        index,
                        id: op.id().clone(),
                        message: e.to_string(),
                    });
                    OpEffect::Rejected
                }
            },
            WriteOp::DeleteOne { .. } => {
                self.deleted += 1;
                OpEffect::Deleted
            }
        }
    }
}

/// What a backend must persist after [`WriteSummary::apply_op`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpEffect {
    NotFound,
    Unchanged,
    Modified,
    Deleted,
    Rejected,
}

/// Pending operations, bounded by `capacity`.
#[derive(Debug)]
pub struct BulkWriteBatch {
    capacity: usize,
    ops: Vec<WriteOp>,
}

impl BulkWriteBatch {
    pub fn new(capacity: usize) -> Self {
        BulkWriteBatch {
            capacity: capacity.max(1),
            ops: Vec::with_capacity(capacity.clamp(1, 1024)),
        }
    }

    /// Queue an operation. A full batch hands the operation back untouched.
    pub fn push(&mut self, op: WriteOp) -> std::result::Result<(), WriteOp> {
        if self.is_full() {
            return Err(op);
        }
        self.ops.push(op);
        Ok(())
    }

    pub fn is_full(&self) -> bool {
        self.ops.len() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drain the batch for flushing.
    pub fn take(&mut self) -> Vec<WriteOp> {
        std::mem::take(&mut self.ops)
    }
}
