//! The batch migration runner.
//!
//! A job is driven page by page: query the job's filter with a server-side
//! limit, transform each document, bulk-write the resulting operations,
//! pause, and query again. Because the filter only selects documents that
//! still need migrating, each flush shrinks the result set and the next
//! query naturally returns the remaining work. Re-running an interrupted
//! idempotent job resumes where it stopped.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::RunConfig;
use crate::error::{MigrationError, Result};
use crate::filter::{Filter, FindQuery};
use crate::job::{JobCache, MigrationJob, TransformContext};
use crate::ledger;
use crate::ops::{BulkWriteBatch, WriteOp};
use crate::storage::{DocumentCursor, DocumentStore};
use crate::types::{document_id, DocumentId, JobId, JobState, ID_FIELD};

/// Counts reported for one job invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub job_id: JobId,
    pub state: JobState,
    /// Documents handed to the transform, counted once per completed page.
    pub processed: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Documents the transform chose to leave alone.
    pub skipped: usize,
    /// Transform failures plus rejected writes.
    pub failed: usize,
    /// Pages that returned at least one document.
    pub pages: usize,
}

impl RunResult {
    pub fn new(job_id: JobId) -> Self {
        RunResult {
            job_id,
            state: JobState::NotStarted,
            processed: 0,
            updated: 0,
            deleted: 0,
            skipped: 0,
            failed: 0,
            pages: 0,
        }
    }

    /// Completed with no per-document failures.
    pub fn is_clean(&self) -> bool {
        self.state == JobState::Completed && self.failed == 0
    }
}

/// Mutable counters scoped to one invocation, logged every `log_every`
/// processed documents.
struct ProgressCounter {
    result: RunResult,
    log_every: usize,
    next_report: usize,
}

impl ProgressCounter {
    fn new(job_id: JobId, log_every: usize) -> Self {
        let mut result = RunResult::new(job_id);
        result.state = JobState::Running;
        ProgressCounter {
            result,
            log_every,
            next_report: log_every,
        }
    }

    /// Fold a finished page into the run totals.
    fn absorb(&mut self, page: &PageTally) {
        self.result.processed += page.fetched;
        self.result.updated += page.updated;
        self.result.deleted += page.deleted;
        self.result.skipped += page.skipped;
        self.result.failed += page.failed;

        if self.result.processed >= self.next_report {
            self.next_report = (self.result.processed / self.log_every + 1) * self.log_every;
            info!(
                processed = self.result.processed,
                updated = self.result.updated,
                deleted = self.result.deleted,
                skipped = self.result.skipped,
                failed = self.result.failed,
                "migration progress"
            );
        }
    }

    fn finish(mut self, state: JobState) -> RunResult {
        self.result.state = state;
        self.result
    }
}

/// Counts for the page in flight. They reach the run totals only when the
/// page completes, so a page dropped for a store error is counted once, on
/// the attempt that succeeds.
#[derive(Debug, Default)]
struct PageTally {
    fetched: usize,
    updated: usize,
    deleted: usize,
    skipped: usize,
    failed: usize,
    /// Highest id the page skipped or failed.
    last_excluded: Option<DocumentId>,
    written: HashSet<DocumentId>,
}

impl PageTally {
    fn exclude(&mut self, id: DocumentId) {
        if self.last_excluded.as_ref().map_or(true, |last| id > *last) {
            self.last_excluded = Some(id);
        }
    }
}

/// Why a page did not complete.
enum PageError {
    /// The store misbehaved; the page is dropped and retried.
    Store(MigrationError),
    /// Continuing cannot make progress.
    Fatal(MigrationError),
}

/// Bookkeeping carried from page to page within one invocation.
#[derive(Default)]
struct PageState {
    cache: JobCache,
    /// Pages come back in ascending `_id` order, so every document at or
    /// below the highest skipped or failed id has been seen. Skipped and
    /// failed documents still match the filter; later pages resume above
    /// this bound instead of fetching them again.
    resume_after: Option<DocumentId>,
    /// Documents written by the previous page.
    last_written: HashSet<DocumentId>,
}

impl PageState {
    fn filter(&self, job: &MigrationJob) -> Filter {
        match &self.resume_after {
            None => job.filter().clone(),
            Some(id) => Filter::and(vec![
                job.filter().clone(),
                Filter::gt(ID_FIELD, id.to_value()),
            ]),
        }
    }

    fn advance(&mut self, page: PageTally) {
        if let Some(id) = page.last_excluded {
            if self.resume_after.as_ref().map_or(true, |bound| id > *bound) {
                self.resume_after = Some(id);
            }
        }
        self.last_written = page.written;
    }
}

/// Drives migration jobs against one document store.
pub struct BatchMigrationRunner {
    store: Arc<dyn DocumentStore>,
}

impl BatchMigrationRunner {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        BatchMigrationRunner { store }
    }

    pub fn store(&self) -> &dyn DocumentStore {
        self.store.as_ref()
    }

    /// Run one job to completion.
    ///
    /// Per-document failures are counted, never fatal. The run aborts with
    /// [`MigrationError::Aborted`] (carrying the partial counts) only when the
    /// store keeps failing past the retry budget or the filter is found not
    /// to shrink.
    #[tracing::instrument(skip_all, fields(job = %job.id(), collection = job.collection()))]
    pub async fn run(&self, job: &MigrationJob, config: &RunConfig) -> Result<RunResult> {
        config.validate()?;
        self.check_rerun(job, config).await?;

        let started_at = Utc::now();
        info!(
            batch_size = config.batch_size,
            max_records = ?config.max_records,
            idempotent = job.idempotency().is_idempotent(),
            "starting migration job"
        );

        let mut progress = ProgressCounter::new(job.id().clone(), config.log_every);
        let outcome = self.drive(job, config, &mut progress).await;
        let state = match &outcome {
            Ok(()) => JobState::Completed,
            Err(_) => JobState::Aborted,
        };
        let result = progress.finish(state);

        if config.record_runs {
            if let Err(e) = ledger::record_run(self.store.as_ref(), job, &result, started_at).await
            {
                warn!(error = %e, "failed to record run in ledger");
            }
        }

        match outcome {
            Ok(()) => {
                info!(
                    processed = result.processed,
                    updated = result.updated,
                    deleted = result.deleted,
                    skipped = result.skipped,
                    failed = result.failed,
                    pages = result.pages,
                    "migration job completed"
                );
                Ok(result)
            }
            Err(e) => {
                error!(error = %e, processed = result.processed, "migration job aborted");
                Err(MigrationError::Aborted {
                    job: job.id().to_string(),
                    source: Box::new(e),
                    result: Box::new(result),
                })
            }
        }
    }

    /// Run jobs one after another in the given order, stopping at the first
    /// error. Non-idempotent jobs that already completed are skipped and
    /// reported as `NotStarted`.
    pub async fn run_all(&self, jobs: &[MigrationJob], config: &RunConfig) -> Result<Vec<RunResult>> {
        let mut results = Vec::with_capacity(jobs.len());
        for job in jobs {
            match self.run(job, config).await {
                Ok(result) => results.push(result),
                Err(MigrationError::AlreadyApplied { job: id }) => {
                    info!(job = %id, "skipping already applied job");
                    results.push(RunResult::new(job.id().clone()));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(results)
    }

    async fn check_rerun(&self, job: &MigrationJob, config: &RunConfig) -> Result<()> {
        let Some(previous) = ledger::last_completed(self.store.as_ref(), job.id().as_str()).await?
        else {
            return Ok(());
        };

        if previous.fingerprint != ledger::job_fingerprint(job) {
            warn!(previous_run = %previous.id, "job definition changed since its last completed run");
        }
        if job.idempotency().is_idempotent() {
            info!(previous_run = %previous.id, "re-running idempotent job");
            return Ok(());
        }
        if config.allow_rerun {
            warn!(previous_run = %previous.id, "re-running non-idempotent job on request");
            return Ok(());
        }
        Err(MigrationError::AlreadyApplied {
            job: job.id().to_string(),
        })
    }

    async fn drive(
        &self,
        job: &MigrationJob,
        config: &RunConfig,
        progress: &mut ProgressCounter,
    ) -> Result<()> {
        let mut state = PageState::default();
        let mut consecutive_failures = 0u32;

        loop {
            let limit = match config.max_records {
                Some(max) => {
                    let remaining = max.saturating_sub(progress.result.processed);
                    if remaining == 0 {
                        info!(max_records = max, "record cap reached");
                        return Ok(());
                    }
                    remaining.min(config.batch_size)
                }
                None => config.batch_size,
            };

            let query = FindQuery::new(state.filter(job))
                .with_projection(job.projection().map(|p| p.to_vec()))
                .with_limit(limit);

            let mut page = PageTally::default();
            match self.run_page(job, &query, config, &mut state, &mut page).await {
                Ok(()) if page.fetched == 0 => return Ok(()),
                Ok(()) => {
                    consecutive_failures = 0;
                    let fetched = page.fetched;
                    progress.absorb(&page);
                    progress.result.pages += 1;
                    state.advance(page);
                    debug!(page = progress.result.pages, fetched, "page done");
                    // A short page means nothing else matched at query time.
                    if fetched < limit {
                        return Ok(());
                    }
                    if !config.inter_batch_delay.is_zero() {
                        tokio::time::sleep(config.inter_batch_delay).await;
                    }
                }
                Err(PageError::Fatal(e)) => {
                    progress.absorb(&page);
                    return Err(e);
                }
                Err(PageError::Store(e)) => {
                    consecutive_failures += 1;
                    warn!(
                        error = %e,
                        attempt = consecutive_failures,
                        retry_budget = config.retry_budget,
                        dropped = page.fetched,
                        "page failed"
                    );
                    if consecutive_failures > config.retry_budget {
                        return Err(MigrationError::FatalStore {
                            attempts: consecutive_failures,
                            last_error: e.to_string(),
                        });
                    }
                    tokio::time::sleep(config.retry_backoff).await;
                }
            }
        }
    }

    /// Fetch, transform and flush one page. The cursor is closed on every
    /// exit path.
    async fn run_page(
        &self,
        job: &MigrationJob,
        query: &FindQuery,
        config: &RunConfig,
        state: &mut PageState,
        page: &mut PageTally,
    ) -> std::result::Result<(), PageError> {
        let mut cursor = self
            .store
            .find(job.collection(), query)
            .await
            .map_err(PageError::Store)?;

        let drained = self
            .drain(job, cursor.as_mut(), config, state, page)
            .await;

        if let Err(e) = cursor.close().await {
            warn!(error = %e, "failed to close cursor");
        }
        drained
    }

    async fn drain(
        &self,
        job: &MigrationJob,
        cursor: &mut dyn DocumentCursor,
        config: &RunConfig,
        state: &mut PageState,
        page: &mut PageTally,
    ) -> std::result::Result<(), PageError> {
        let mut batch = BulkWriteBatch::new(config.batch_size);

        while let Some(doc) = cursor.next().await.map_err(PageError::Store)? {
            page.fetched += 1;

            // Without an id the document can be neither written nor resumed past.
            let Some(id) = document_id(&doc) else {
                page.failed += 1;
                return Err(PageError::Fatal(MigrationError::InvalidArgument(format!(
                    "document without a usable {} in collection {}",
                    ID_FIELD,
                    job.collection()
                ))));
            };

            if state.last_written.contains(&id) {
                return Err(PageError::Fatal(MigrationError::FilterNotShrinking {
                    job: job.id().to_string(),
                    id: id.to_string(),
                }));
            }

            let outcome = {
                let mut ctx = TransformContext::new(job.id(), self.store.as_ref(), &mut state.cache);
                job.transform().apply(&doc, &mut ctx).await
            };

            match outcome {
                Ok(outcome) => match WriteOp::from_outcome(id.clone(), outcome) {
                    Some(mut op) => {
                        while let Err(rejected) = batch.push(op) {
                            self.flush(job, &mut batch, page).await?;
                            op = rejected;
                        }
                    }
                    None => {
                        page.skipped += 1;
                        debug!(id = %id, "skipped");
                        page.exclude(id);
                    }
                },
                Err(e) => {
                    page.failed += 1;
                    error!(id = %id, error = %e, "transform failed");
                    page.exclude(id);
                }
            }
        }

        if !batch.is_empty() {
            self.flush(job, &mut batch, page).await?;
        }
        Ok(())
    }

    async fn flush(
        &self,
        job: &MigrationJob,
        batch: &mut BulkWriteBatch,
        page: &mut PageTally,
    ) -> std::result::Result<(), PageError> {
        let ops = batch.take();
        debug!(ops = ops.len(), "flushing batch");

        let summary = self
            .store
            .bulk_write(job.collection(), &ops)
            .await
            .map_err(|e| PageError::Store(MigrationError::Write(e.to_string())))?;

        page.updated += summary.modified;
        page.deleted += summary.deleted;

        let mut rejected = HashSet::new();
        for failure in &summary.failures {
            page.failed += 1;
            error!(id = %failure.id, error = %failure.message, "write rejected");
            rejected.insert(failure.index);
            page.exclude(failure.id.clone());
        }
        for (index, op) in ops.iter().enumerate() {
            if !rejected.contains(&index) {
                page.written.insert(op.id().clone());
            }
        }

        let unmatched = ops.len() - summary.matched;
        if unmatched > 0 {
            debug!(unmatched, "documents vanished before their write");
        }
        Ok(())
    }
}
