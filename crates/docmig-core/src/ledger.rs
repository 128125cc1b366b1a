//! Run ledger: one tamper-evident record per job invocation.
//!
//! Records of the same job are chained through `prev_integrity_hash`, the
//! same way an audit log is chained, so a rewritten history is detectable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::hash::{sha256_hex, value_hash};
use crate::job::MigrationJob;
use crate::runner::RunResult;
use crate::storage::DocumentStore;
use crate::types::{Idempotency, JobState};

/// Persisted summary of one job invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub job_id: String,
    pub collection: String,
    pub idempotency: Idempotency,
    /// Hash of the job definition (collection, filter, projection,
    /// idempotency) at the time of the run.
    pub fingerprint: String,
    pub state: JobState,
    pub processed: usize,
    pub updated: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub pages: usize,
    pub started_at: String,
    pub finished_at: String,
    pub integrity_hash: String,
    pub prev_integrity_hash: Option<String>,
}

/// Filter for querying run records.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub job_id: Option<String>,
    pub state: Option<JobState>,
    pub limit: Option<usize>,
}

impl RunFilter {
    pub fn for_job(job_id: &str) -> Self {
        RunFilter {
            job_id: Some(job_id.to_string()),
            ..Default::default()
        }
    }

    pub fn matches(&self, record: &RunRecord) -> bool {
        self.job_id.as_ref().is_none_or(|j| *j == record.job_id)
            && self.state.is_none_or(|s| s == record.state)
    }
}

/// Fingerprint of a job definition.
pub fn job_fingerprint(job: &MigrationJob) -> String {
    let definition = serde_json::json!({
        "collection": job.collection(),
        "filter": job.filter(),
        "projection": job.projection(),
        "idempotency": job.idempotency(),
    });
    value_hash(&definition)
}

/// Most recent run of a job, in any state.
pub async fn last_run(store: &dyn DocumentStore, job_id: &str) -> Result<Option<RunRecord>> {
    let mut filter = RunFilter::for_job(job_id);
    filter.limit = Some(1);
    Ok(store.query_runs(&filter).await?.into_iter().next())
}

/// Most recent completed run of a job.
pub async fn last_completed(store: &dyn DocumentStore, job_id: &str) -> Result<Option<RunRecord>> {
    let filter = RunFilter {
        job_id: Some(job_id.to_string()),
        state: Some(JobState::Completed),
        limit: Some(1),
    };
    Ok(store.query_runs(&filter).await?.into_iter().next())
}

/// Append a ledger record for a finished invocation, chained to the job's
/// previous record.
pub async fn record_run(
    store: &dyn DocumentStore,
    job: &MigrationJob,
    result: &RunResult,
    started_at: DateTime<Utc>,
) -> Result<RunRecord> {
    let prev_integrity_hash = last_run(store, job.id().as_str())
        .await?
        .map(|r| r.integrity_hash);

    let mut record = RunRecord {
        id: Uuid::new_v4().to_string(),
        job_id: job.id().to_string(),
        collection: job.collection().to_string(),
        idempotency: job.idempotency(),
        fingerprint: job_fingerprint(job),
        state: result.state,
        processed: result.processed,
        updated: result.updated,
        deleted: result.deleted,
        skipped: result.skipped,
        failed: result.failed,
        pages: result.pages,
        started_at: started_at.to_rfc3339(),
        finished_at: Utc::now().to_rfc3339(),
        integrity_hash: String::new(),
        prev_integrity_hash,
    };
    record.integrity_hash = compute_record_hash(&record);

    store.append_run(&record).await?;
    Ok(record)
}

/// Integrity hash over every field except the hash itself.
pub fn compute_record_hash(record: &RunRecord) -> String {
    let counts = format!(
        "{}:{}:{}:{}:{}:{}",
        record.processed,
        record.updated,
        record.deleted,
        record.skipped,
        record.failed,
        record.pages
    );
    let idempotent = if record.idempotency.is_idempotent() {
        "idempotent"
    } else {
        "non_idempotent"
    };
    let state = record.state.to_string();
    sha256_hex(&[
        record.id.as_bytes(),
        record.job_id.as_bytes(),
        record.collection.as_bytes(),
        idempotent.as_bytes(),
        record.fingerprint.as_bytes(),
        state.as_bytes(),
        counts.as_bytes(),
        record.started_at.as_bytes(),
        record.finished_at.as_bytes(),
        record.prev_integrity_hash.as_deref().unwrap_or("").as_bytes(),
    ])
}

/// Check a job's records, oldest first: every hash must match its record
/// and link to its predecessor.
pub fn verify_chain(records: &[RunRecord]) -> bool {
    records.iter().enumerate().all(|(i, record)| {
        let linked = match i {
            0 => true,
            _ => record.prev_integrity_hash.as_deref()
                == Some(records[i - 1].integrity_hash.as_str()),
        };
        linked && compute_record_hash(record) == record.integrity_hash
    })
}
