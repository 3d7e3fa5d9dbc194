//! Error taxonomy for the ingestion pipeline
//!
//! Record-level and batch-level failures are normally absorbed into run
//! summaries; everything else here is surfaced to the caller of a trigger.

use discogs_common::DiscogsError;
use thiserror::Error;

/// Result type alias for ingestion operations
pub type Result<T, E = IngestError> = std::result::Result<T, E>;

/// Errors produced by the ingestion core
#[derive(Error, Debug)]
pub enum IngestError {
    /// Transient artifact I/O (decompression, read, local filesystem)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A single record could not be decoded
    #[error("Malformed record: {0}")]
    Decode(String),

    /// A batch write failed and was rolled back
    #[error("Store error: {0}")]
    Store(String),

    /// The store can no longer be reached; the run cannot continue
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A dependent file type was processed after its prerequisite failed
    #[error("Dependency not satisfied: {0}")]
    Dependency(String),

    /// A trigger collided with the current lifecycle state of a period
    #[error("State conflict for period {period}: {message}")]
    StateConflict { period: String, message: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid period key: {0}")]
    InvalidPeriod(String),

    #[error("Invalid file type: {0}")]
    InvalidFileType(String),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl IngestError {
    pub fn state_conflict(period: impl ToString, message: impl Into<String>) -> Self {
        IngestError::StateConflict {
            period: period.to_string(),
            message: message.into(),
        }
    }

    /// Whether the error means the store connection is gone
    pub fn is_fatal(&self) -> bool {
        matches!(self, IngestError::StoreUnavailable(_))
    }
}

/// Failure of a single store operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The batch was rejected and rolled back; later batches may still succeed
    #[error("batch rejected: {0}")]
    Batch(String),

    /// Connection or pool loss
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// SQLSTATE classes that mean the session itself is gone
fn is_connection_state(code: &str) -> bool {
    code.starts_with("08") || matches!(code, "57P01" | "57P02" | "57P03")
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
            sqlx::Error::Database(db)
                if db.code().as_deref().is_some_and(is_connection_state) =>
            {
                StoreError::Unavailable(err.to_string())
            },
            _ => StoreError::Batch(err.to_string()),
        }
    }
}

impl From<StoreError> for IngestError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Batch(msg) => IngestError::Store(msg),
            StoreError::Unavailable(msg) => IngestError::StoreUnavailable(msg),
        }
    }
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::from(err).into()
    }
}

impl From<sqlx::migrate::MigrateError> for IngestError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        IngestError::Store(format!("migration failed: {}", err))
    }
}

impl From<DiscogsError> for IngestError {
    fn from(err: DiscogsError) -> Self {
        match err {
            DiscogsError::Io(e) => IngestError::Io(e),
            manifest @ DiscogsError::Manifest { .. } => IngestError::Download(manifest.to_string()),
        }
    }
}

impl From<reqwest::Error> for IngestError {
    fn from(err: reqwest::Error) -> Self {
        IngestError::Download(err.to_string())
    }
}
