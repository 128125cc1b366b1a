use thiserror::Error;

use crate::runner::RunResult;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("transform failed for document {id}: {reason}")]
    Transform { id: String, reason: String },

    #[error("bulk write failed: {0}")]
    Write(String),

    #[error("store unreachable after {attempts} attempts: {last_error}")]
    FatalStore { attempts: u32, last_error: String },

    #[error("job {job} aborted: {source}")]
    Aborted {
        job: String,
        #[source]
        source: Box<MigrationError>,
        result: Box<RunResult>,
    },

    #[error("job {job} already completed and is not idempotent")]
    AlreadyApplied { job: String },

    #[error("job {job} filter still matches document {id} after it was written")]
    FilterNotShrinking { job: String, id: String },

    #[error("invalid update at {path}: {reason}")]
    InvalidUpdate { path: String, reason: String },

    #[error("cursor already closed")]
    CursorClosed,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl MigrationError {
    /// Shorthand for a transform failure on `id`.
    pub fn transform(id: impl ToString, reason: impl ToString) -> Self {
        MigrationError::Transform {
            id: id.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MigrationError>;

impl From<serde_json::Error> for MigrationError {
    fn from(e: serde_json::Error) -> Self {
        MigrationError::Serialization(e.to_string())
    }
}
