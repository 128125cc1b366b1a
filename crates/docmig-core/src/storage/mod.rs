pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use std::collections::VecDeque;
use uuid::Uuid;

use crate::error::{MigrationError, Result};
use crate::filter::{Filter, FindQuery};
use crate::ledger::{RunFilter, RunRecord};
use crate::ops::{WriteOp, WriteSummary};
use crate::types::{document_id, Document, DocumentId, ID_FIELD};

/// Server-side handle over a query result, read incrementally.
///
/// Callers must `close` the cursor on every exit path; reading a closed
/// cursor is an error.
#[async_trait]
pub trait DocumentCursor: Send {
    /// Next document, or `None` once the result set is exhausted.
    async fn next(&mut self) -> Result<Option<Document>>;

    /// Release the cursor. Closing twice is a no-op.
    async fn close(&mut self) -> Result<()>;
}

/// Trait for pluggable document stores.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Initialize storage (create tables, etc.).
    async fn initialize(&self) -> Result<()>;

    /// Insert documents, assigning a fresh `_id` where none is present.
    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<Vec<DocumentId>>;

    /// Fetch one document by id.
    async fn get(&self, collection: &str, id: &DocumentId) -> Result<Option<Document>>;

    /// Open a cursor over matching documents in ascending `_id` order.
    async fn find(&self, collection: &str, query: &FindQuery) -> Result<Box<dyn DocumentCursor>>;

    /// Count matching documents.
    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64>;

    /// Apply independent update/delete operations in one round trip.
    async fn bulk_write(&self, collection: &str, ops: &[WriteOp]) -> Result<WriteSummary>;

    /// Append a record to the migration run ledger.
    async fn append_run(&self, record: &RunRecord) -> Result<()>;

    /// Query ledger records, newest first.
    async fn query_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>>;
}

/// Give a new document a string `_id`: a fresh uuid when absent, the
/// stringified value for integer ids.
pub(crate) fn assign_id(doc: &mut Document) -> Result<DocumentId> {
    let id = match doc.get(ID_FIELD) {
        None => DocumentId(Uuid::new_v4().to_string()),
        Some(_) => document_id(doc).ok_or_else(|| {
            MigrationError::InvalidArgument("_id must be a string or integer".to_string())
        })?,
    };
    doc.insert(ID_FIELD.to_string(), id.to_value());
    Ok(id)
}

/// Cursor over a page that has already been fetched from the store.
pub struct BufferedCursor {
    docs: VecDeque<Document>,
    closed: bool,
}

impl BufferedCursor {
    pub fn new(docs: Vec<Document>) -> Self {
        BufferedCursor {
            docs: docs.into(),
            closed: false,
        }
    }
}

#[async_trait]
impl DocumentCursor for BufferedCursor {
    async fn next(&mut self) -> Result<Option<Document>> {
        if self.closed {
            return Err(MigrationError::CursorClosed);
        }
        Ok(self.docs.pop_front())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.docs.clear();
        Ok(())
    }
}
