//! Shared fixtures for runner tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use docmig_core::error::{MigrationError, Result};
use docmig_core::ledger::{RunFilter, RunRecord};
use docmig_core::storage::{DocumentCursor, DocumentStore};
use docmig_core::{Document, DocumentId, Filter, FindQuery, MemoryStore, RunConfig, WriteOp, WriteSummary};
use serde_json::{json, Value};

/// Wraps a [`MemoryStore`], recording the calls the runner makes and failing
/// a configurable number of them.
#[derive(Default)]
pub struct RecordingStore {
    inner: MemoryStore,
    find_limits: Mutex<Vec<Option<usize>>>,
    find_filters: Mutex<Vec<Filter>>,
    flush_sizes: Mutex<Vec<usize>>,
    gets: AtomicUsize,
    failing_finds: AtomicU32,
    failing_flushes: AtomicU32,
    cursors: Arc<CursorLog>,
}

/// Shared between the store and the cursors it hands out.
#[derive(Default)]
struct CursorLog {
    opened: AtomicUsize,
    closed: AtomicUsize,
    /// Counts down to the read that fails; zero when disarmed.
    reads_until_failure: AtomicUsize,
    stripped_ids: AtomicU32,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` `find` calls.
    pub fn fail_next_finds(&self, n: u32) {
        self.failing_finds.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` `bulk_write` calls.
    pub fn fail_next_flushes(&self, n: u32) {
        self.failing_flushes.store(n, Ordering::SeqCst);
    }

    /// Fail the `nth` cursor read from now, counting across cursors.
    pub fn fail_nth_read(&self, nth: usize) {
        self.cursors.reads_until_failure.store(nth, Ordering::SeqCst);
    }

    /// Hand out the next `n` documents read with their `_id` removed.
    pub fn strip_next_ids(&self, n: u32) {
        self.cursors.stripped_ids.store(n, Ordering::SeqCst);
    }

    pub fn cursors_opened(&self) -> usize {
        self.cursors.opened.load(Ordering::SeqCst)
    }

    pub fn cursors_closed(&self) -> usize {
        self.cursors.closed.load(Ordering::SeqCst)
    }

    pub fn find_limits(&self) -> Vec<Option<usize>> {
        self.find_limits.lock().unwrap().clone()
    }

    pub fn find_filters(&self) -> Vec<Filter> {
        self.find_filters.lock().unwrap().clone()
    }

    pub fn flush_sizes(&self) -> Vec<usize> {
        self.flush_sizes.lock().unwrap().clone()
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        self.find_limits.lock().unwrap().clear();
        self.find_filters.lock().unwrap().clear();
        self.flush_sizes.lock().unwrap().clear();
        self.gets.store(0, Ordering::SeqCst);
        self.cursors.opened.store(0, Ordering::SeqCst);
        self.cursors.closed.store(0, Ordering::SeqCst);
    }
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl DocumentStore for RecordingStore {
    async fn initialize(&self) -> Result<()> {
        self.inner.initialize().await
    }

    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<Vec<DocumentId>> {
        self.inner.insert_many(collection, docs).await
    }

    async fn get(&self, collection: &str, id: &DocumentId) -> Result<Option<Document>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(collection, id).await
    }

    async fn find(&self, collection: &str, query: &FindQuery) -> Result<Box<dyn DocumentCursor>> {
        self.find_limits.lock().unwrap().push(query.limit);
        self.find_filters.lock().unwrap().push(query.filter.clone());
        if take_failure(&self.failing_finds) {
            return Err(MigrationError::Storage("connection reset".to_string()));
        }
        let inner = self.inner.find(collection, query).await?;
        self.cursors.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecordingCursor {
            inner,
            log: Arc::clone(&self.cursors),
        }))
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64> {
        self.inner.count(collection, filter).await
    }

    async fn bulk_write(&self, collection: &str, ops: &[WriteOp]) -> Result<WriteSummary> {
        self.flush_sizes.lock().unwrap().push(ops.len());
        if take_failure(&self.failing_flushes) {
            return Err(MigrationError::Storage("primary stepped down".to_string()));
        }
        self.inner.bulk_write(collection, ops).await
    }

    async fn append_run(&self, record: &RunRecord) -> Result<()> {
        self.inner.append_run(record).await
    }

    async fn query_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>> {
        self.inner.query_runs(filter).await
    }
}

struct RecordingCursor {
    inner: Box<dyn DocumentCursor>,
    log: Arc<CursorLog>,
}

#[async_trait]
impl DocumentCursor for RecordingCursor {
    async fn next(&mut self) -> Result<Option<Document>> {
        let countdown = self.log.reads_until_failure.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |n| n.checked_sub(1),
        );
        if countdown == Ok(1) {
            return Err(MigrationError::Storage("cursor killed".to_string()));
        }
        let mut next = self.inner.next().await?;
        if let Some(doc) = next.as_mut() {
            if take_failure(&self.log.stripped_ids) {
                doc.remove("_id");
            }
        }
        Ok(next)
    }

    async fn close(&mut self) -> Result<()> {
        self.log.closed.fetch_add(1, Ordering::SeqCst);
        self.inner.close().await
    }
}

pub fn doc(value: Value) -> Document {
    value.as_object().cloned().unwrap()
}

/// Id of the `n`th seeded document; zero-padded so id order is numeric order.
pub fn seeded_id(n: usize) -> String {
    format!("svc-{:05}", n)
}

/// Insert `count` documents still carrying the legacy `service_name` field.
pub async fn seed_services(store: &dyn DocumentStore, count: usize) {
    let docs = (1..=count)
        .map(|n| doc(json!({"_id": seeded_id(n), "service_name": format!("service {}", n), "n": n})))
        .collect();
    store.insert_many("services", docs).await.unwrap();
}

/// Pacing suitable for tests: no delay, no backoff.
pub fn fast_config(batch_size: usize) -> RunConfig {
    RunConfig::default()
        .with_batch_size(batch_size)
        .with_inter_batch_delay(Duration::ZERO)
        .with_retry(3, Duration::ZERO)
}
