//! Error types for sync orchestration
//!
//! Errors fall into two groups with different blast radius:
//!
//! ```text
//! Run-level (abort the whole run, returned from SyncOrchestrator::run)
//! ├── SyncError::Cycle        - cyclic dependencies under BreakPolicy::FailFast
//! ├── SyncError::Checkpoint   - checkpoint store I/O failure
//! ├── SyncError::RunNotFound  - resume of an unknown run
//! └── SyncError::Configuration
//!
//! Table-level (recorded in the table's ExtractionResult, never raised)
//! ├── SampleSpecError         - invalid spec, detected before scheduling
//! └── ExtractionError
//!     ├── Store(StoreError)   - retryable unless NotFound / PermissionDenied / Schema
//!     ├── Timeout             - retryable
//!     ├── InvalidQuery        - terminal
//!     └── Writer(WriterError) - terminal
//! ```
//!
//! Table-level errors never abort sibling tables; they only cause dependents
//! in later waves to be skipped.

use lakeslice_checkpoint::CheckpointError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Convenience result type using [`SyncError`]
pub type Result<T> = std::result::Result<T, SyncError>;

/// Run-level failure. Whatever checkpoint was last durably written is left in place.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The table graph contains a cycle and the break policy is `FailFast`
    #[error(transparent)]
    Cycle(#[from] CyclicDependencyError),

    /// Checkpoint store failure
    #[error("Checkpoint store error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Two tables share a name (names are case-insensitive)
    #[error("Duplicate table name '{0}' (table names are case-insensitive)")]
    DuplicateTable(String),

    /// Resume requested for a run with no checkpoint
    #[error("No checkpoint found for run '{0}'")]
    RunNotFound(String),

    /// Orchestrator misconfiguration (e.g. zero parallelism)
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// The dependency graph contains at least one cycle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Cyclic dependency among tables: {}", .tables.join(", "))]
pub struct CyclicDependencyError {
    /// Every table that lies on a cycle, sorted by name
    pub tables: Vec<String>,
}

/// A resolved sampling spec is missing a field its strategy requires.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SampleSpecError {
    #[error("Table '{table}': no sampling strategy configured")]
    MissingStrategy { table: String },

    #[error("Table '{table}': strategy '{strategy}' requires field '{field}'")]
    MissingField {
        table: String,
        strategy: String,
        field: &'static str,
    },

    #[error("Table '{table}': field '{field}' is invalid: {reason}")]
    InvalidField {
        table: String,
        field: &'static str,
        reason: String,
    },
}

impl SampleSpecError {
    pub fn table(&self) -> &str {
        match self {
            SampleSpecError::MissingStrategy { table }
            | SampleSpecError::MissingField { table, .. }
            | SampleSpecError::InvalidField { table, .. } => table,
        }
    }
}

/// Classification of remote-store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreErrorKind {
    /// Network failure, timeout, rate limit, transient service error
    Transient,
    /// Table or object does not exist
    NotFound,
    /// Authentication or authorization failure
    PermissionDenied,
    /// Schema mismatch or validation failure
    Schema,
    /// The store does not support the requested extraction
    Unsupported,
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StoreErrorKind::Transient => "transient",
            StoreErrorKind::NotFound => "not found",
            StoreErrorKind::PermissionDenied => "permission denied",
            StoreErrorKind::Schema => "schema",
            StoreErrorKind::Unsupported => "unsupported",
        })
    }
}

/// Error surfaced by a [`RemoteStore`](crate::source::RemoteStore).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} store error: {message}")]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub message: String,
}

impl StoreError {
    pub fn new(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Transient, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::NotFound, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::PermissionDenied, message)
    }

    /// Only transient failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, StoreErrorKind::Transient)
    }
}

/// Error surfaced by a [`TableWriter`](crate::source::TableWriter).
#[derive(Error, Debug)]
pub enum WriterError {
    /// The row stream being written yielded a store error
    #[error(transparent)]
    Upstream(#[from] StoreError),

    #[error("Writer I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Writer error: {0}")]
    Write(String),
}

/// Why a single extraction attempt failed.
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error(transparent)]
    Store(StoreError),

    #[error("Extraction timed out after {0:?}")]
    Timeout(Duration),

    #[error("Malformed custom query: {0}")]
    InvalidQuery(String),

    #[error(transparent)]
    Writer(WriterError),

    #[error(transparent)]
    Spec(#[from] SampleSpecError),
}

impl ExtractionError {
    /// Transient store failures and timeouts are retried; everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExtractionError::Store(e) => e.is_retryable(),
            ExtractionError::Timeout(_) => true,
            ExtractionError::InvalidQuery(_)
            | ExtractionError::Writer(_)
            | ExtractionError::Spec(_) => false,
        }
    }
}

impl From<StoreError> for ExtractionError {
    fn from(err: StoreError) -> Self {
        ExtractionError::Store(err)
    }
}

impl From<WriterError> for ExtractionError {
    /// Store failures surfacing through the writer keep their store classification.
    fn from(err: WriterError) -> Self {
        match err {
            WriterError::Upstream(store) => ExtractionError::Store(store),
            other => ExtractionError::Writer(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_classification() {
        assert!(StoreError::transient("rate limited").is_retryable());
        assert!(!StoreError::not_found("no table").is_retryable());
        assert!(!StoreError::permission_denied("bad token").is_retryable());
        assert!(!StoreError::new(StoreErrorKind::Schema, "drift").is_retryable());
    }

    #[test]
    fn test_upstream_writer_error_keeps_store_class() {
        let err: ExtractionError = WriterError::Upstream(StoreError::transient("reset")).into();
        assert!(err.is_retryable());

        let err: ExtractionError = WriterError::Write("disk full".into()).into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_timeout_is_retryable_and_query_is_not() {
        assert!(ExtractionError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!ExtractionError::InvalidQuery("unbalanced".into()).is_retryable());
    }

    #[test]
    fn test_cycle_error_names_tables() {
        let err = CyclicDependencyError {
            tables: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.to_string(), "Cyclic dependency among tables: a, b");
    }

    #[test]
    fn test_spec_error_names_table_and_field() {
        let err = SampleSpecError::MissingField {
            table: "events".into(),
            strategy: "recent".into(),
            field: "date_column",
        };
        assert_eq!(err.table(), "events");
        assert!(err.to_string().contains("date_column"));
    }
}
