pub mod config;
pub mod error;
pub mod filter;
pub mod hash;
pub mod job;
pub mod ledger;
pub mod ops;
pub mod runner;
pub mod storage;
pub mod types;

// Re-export primary types for convenience
pub use config::RunConfig;
pub use error::{MigrationError, Result};
pub use filter::{Filter, FindQuery};
pub use job::{transform_fn, JobCache, MigrationJob, Transform, TransformContext};
pub use ledger::{RunFilter, RunRecord};
pub use ops::{BulkWriteBatch, Outcome, Update, WriteOp, WriteSummary};
pub use runner::{BatchMigrationRunner, RunResult};
pub use storage::memory::MemoryStore;
pub use storage::sqlite::SqliteStore;
pub use storage::{DocumentCursor, DocumentStore};
pub use types::{Document, DocumentId, Idempotency, JobId, JobState};
