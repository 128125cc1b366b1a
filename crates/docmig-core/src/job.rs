//! Migration job definitions: a filter selecting unmigrated documents plus a
//! per-document transform.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::filter::Filter;
use crate::ops::Outcome;
use crate::storage::DocumentStore;
use crate::types::{Document, DocumentId, Idempotency, JobId};

/// Per-document business logic of a migration.
///
/// Returning `Err` marks only this document as failed; the run continues.
#[async_trait]
pub trait Transform: Send + Sync {
    async fn apply(&self, doc: &Document, ctx: &mut TransformContext<'_>) -> Result<Outcome>;
}

/// Adapter turning a synchronous closure into a [`Transform`].
pub struct FnTransform<F> {
    f: F,
}

/// Wrap a closure `Fn(&Document, &mut JobCache) -> Result<Outcome>`.
pub fn transform_fn<F>(f: F) -> FnTransform<F>
where
    F: Fn(&Document, &mut JobCache) -> Result<Outcome> + Send + Sync,
{
    FnTransform { f }
}

#[async_trait]
impl<F> Transform for FnTransform<F>
where
    F: Fn(&Document, &mut JobCache) -> Result<Outcome> + Send + Sync,
{
    async fn apply(&self, doc: &Document, ctx: &mut TransformContext<'_>) -> Result<Outcome> {
        (self.f)(doc, ctx.cache())
    }
}

/// Key/value cache living for exactly one job invocation, e.g. a map from a
/// parent id to a value derived from the parent document.
#[derive(Debug, Default)]
pub struct JobCache {
    entries: HashMap<String, Value>,
}

impl JobCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.entries.insert(key.into(), value)
    }

    pub fn get_or_insert_with<F>(&mut self, key: &str, f: F) -> &Value
    where
        F: FnOnce() -> Value,
    {
        self.entries.entry(key.to_string()).or_insert_with(f)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What a transform can reach besides the document itself.
pub struct TransformContext<'a> {
    job_id: &'a JobId,
    store: &'a dyn DocumentStore,
    cache: &'a mut JobCache,
}

impl<'a> TransformContext<'a> {
    pub fn new(job_id: &'a JobId, store: &'a dyn DocumentStore, cache: &'a mut JobCache) -> Self {
        TransformContext {
            job_id,
            store,
            cache,
        }
    }

    pub fn job_id(&self) -> &JobId {
        self.job_id
    }

    pub fn cache(&mut self) -> &mut JobCache {
        &mut *self.cache
    }

    /// Read a referenced document, memoising hits and misses in the job
    /// cache so each parent is fetched once per run.
    pub async fn lookup(&mut self, collection: &str, id: &DocumentId) -> Result<Option<Document>> {
        let key = format!("lookup:{}/{}", collection, id);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached.as_object().cloned());
        }

        let found = self.store.get(collection, id).await?;
        let cached = match &found {
            Some(doc) => Value::Object(doc.clone()),
            None => Value::Null,
        };
        self.cache.insert(key, cached);
        Ok(found)
    }
}

/// A named unit of work over one collection.
#[derive(Clone)]
pub struct MigrationJob {
    id: JobId,
    description: String,
    collection: String,
    idempotency: Idempotency,
    filter: Filter,
    projection: Option<Vec<String>>,
    transform: Arc<dyn Transform>,
}

impl MigrationJob {
    /// `filter` must select only documents that still need migrating, so
    /// that writing a document removes it from the result set.
    pub fn new(
        id: impl Into<JobId>,
        collection: &str,
        idempotency: Idempotency,
        filter: Filter,
        transform: impl Transform + 'static,
    ) -> Self {
        MigrationJob {
            id: id.into(),
            description: String::new(),
            collection: collection.to_string(),
            idempotency,
            filter,
            projection: None,
            transform: Arc::new(transform),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Fetch only these top-level fields (plus `_id`) for the transform.
    pub fn with_projection(mut self, fields: Vec<String>) -> Self {
        self.projection = Some(fields);
        self
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn idempotency(&self) -> Idempotency {
        self.idempotency
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    pub fn projection(&self) -> Option<&[String]> {
        self.projection.as_deref()
    }

    pub fn transform(&self) -> &dyn Transform {
        self.transform.as_ref()
    }
}

impl std::fmt::Debug for MigrationJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationJob")
            .field("id", &self.id)
            .field("collection", &self.collection)
            .field("idempotency", &self.idempotency)
            .field("filter", &self.filter)
            .field("projection", &self.projection)
            .finish_non_exhaustive()
    }
}
