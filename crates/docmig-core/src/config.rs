//! Tuning knobs for one job invocation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MigrationError, Result};

/// How a job is paced against the shared store.
///
/// Deserializes with every field optional, so a host application can embed
/// it in its own config file (`{"batch_size": 500, "inter_batch_delay_ms": 50}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Page limit and maximum operations per bulk write.
    pub batch_size: usize,
    /// Pause after each flushed page to bound load on the primary.
    #[serde(rename = "inter_batch_delay_ms", with = "duration_ms")]
    pub inter_batch_delay: Duration,
    /// Stop after this many documents (None = until the filter is exhausted).
    pub max_records: Option<usize>,
    /// Emit a progress line every this many processed documents.
    pub log_every: usize,
    /// Consecutive failed pages tolerated before the store is declared
    /// unreachable.
    pub retry_budget: u32,
    #[serde(rename = "retry_backoff_ms", with = "duration_ms")]
    pub retry_backoff: Duration,
    /// Run a non-idempotent job even if the ledger shows it completed.
    pub allow_rerun: bool,
    /// Append a ledger record for each invocation. With this off the runner
    /// persists nothing of its own, and the re-run guard only sees runs
    /// recorded earlier.
    pub record_runs: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            inter_batch_delay: Duration::from_millis(100),
            max_records: None,
            log_every: 1000,
            retry_budget: 3,
            retry_backoff: Duration::from_secs(1),
            allow_rerun: false,
            record_runs: true,
        }
    }
}

impl RunConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_inter_batch_delay(mut self, delay: Duration) -> Self {
        self.inter_batch_delay = delay;
        self
    }

    pub fn with_max_records(mut self, max_records: usize) -> Self {
        self.max_records = Some(max_records);
        self
    }

    pub fn with_log_every(mut self, log_every: usize) -> Self {
        self.log_every = log_every;
        self
    }

    pub fn with_retry(mut self, budget: u32, backoff: Duration) -> Self {
        self.retry_budget = budget;
        self.retry_backoff = backoff;
        self
    }

    pub fn with_allow_rerun(mut self, allow: bool) -> Self {
        self.allow_rerun = allow;
        self
    }

    pub fn with_record_runs(mut self, record: bool) -> Self {
        self.record_runs = record;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(MigrationError::InvalidArgument(
                "batch_size must be positive".to_string(),
            ));
        }
        if self.log_every == 0 {
            return Err(MigrationError::InvalidArgument(
                "log_every must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
