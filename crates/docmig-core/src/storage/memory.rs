use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

use super::{assign_id, BufferedCursor, DocumentCursor, DocumentStore};
use crate::error::{MigrationError, Result};
use crate::filter::{Filter, FindQuery};
use crate::ledger::{RunFilter, RunRecord};
use crate::ops::{OpEffect, WriteOp, WriteSummary};
use crate::types::{Document, DocumentId};

type Collection = BTreeMap<DocumentId, Document>;

#[derive(Default)]
struct Inner {
    collections: HashMap<String, Collection>,
    runs: Vec<RunRecord>,
}

/// Process-local store, mainly for tests and dry rehearsals of a job.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<Vec<DocumentId>> {
        let mut inner = self.inner.lock().await;
        let target = inner.collections.entry(collection.to_string()).or_default();

        let mut ids = Vec::with_capacity(docs.len());
        for mut doc in docs {
            let id = assign_id(&mut doc)?;
            if target.contains_key(&id) {
                return Err(MigrationError::Storage(format!("duplicate _id: {}", id)));
            }
            target.insert(id.clone(), doc);
            ids.push(id);
        }
        Ok(ids)
    }

    async fn get(&self, collection: &str, id: &DocumentId) -> Result<Option<Document>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .collections
            .get(collection)
            .and_then(|c| c.get(id))
            .cloned())
    }

    async fn find(&self, collection: &str, query: &FindQuery) -> Result<Box<dyn DocumentCursor>> {
        let inner = self.inner.lock().await;
        let limit = query.limit.unwrap_or(usize::MAX);
        let docs: Vec<Document> = inner
            .collections
            .get(collection)
            .map(|c| {
                c.values()
                    .filter(|doc| query.filter.matches(doc))
                    .take(limit)
                    .map(|doc| query.shape(doc.clone()))
                    .collect()
            })
            .unwrap_or_default();
        Ok(Box::new(BufferedCursor::new(docs)))
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let inner = self.inner.lock().await;
        Ok(inner
            .collections
            .get(collection)
            .map(|c| c.values().filter(|doc| filter.matches(doc)).count() as u64)
            .unwrap_or(0))
    }

    async fn bulk_write(&self, collection: &str, ops: &[WriteOp]) -> Result<WriteSummary> {
        let mut inner = self.inner.lock().await;
        let mut summary = WriteSummary::default();
        let Some(target) = inner.collections.get_mut(collection) else {
            return Ok(summary);
        };

        for (index, op) in ops.iter().enumerate() {
            let effect = summary.apply_op(index, op, target.get_mut(op.id()));
            if effect == OpEffect::Deleted {
                target.remove(op.id());
            }
        }
        Ok(summary)
    }

    async fn append_run(&self, record: &RunRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.runs.push(record.clone());
        Ok(())
    }

    async fn query_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .runs
            .iter()
            .rev()
            .filter(|r| filter.matches(r))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }
}
