//! Error types for ledger shard migration.

use thiserror::Error;

use crate::models::MigrateState;

/// Result type alias using strata's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for shard migration operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Phase invoked while the recorded state is not its required predecessor
    #[error("Invalid transition: {operation} requires state {required}, current state is {current}")]
    InvalidTransition {
        operation: &'static str,
        current: MigrateState,
        required: MigrateState,
    },

    /// Shard schema DDL could not be applied
    #[error("Schema error: {0}")]
    Schema(String),

    /// A copy batch failed irrecoverably
    #[error("Copy error on table {table}: {message}")]
    Copy { table: String, message: String },

    /// Rewriting derived-table references failed
    #[error("Relink error: {0}")]
    Relink(String),

    /// Secondary index rebuild failed
    #[error("Index error: {0}")]
    Index(String),

    /// Removing copied rows from the main store failed
    #[error("Delete error: {0}")]
    Delete(String),

    /// No active shard run
    #[error("Not initialized: {0}")]
    NotInitialized(String),

    /// Another shard run holds the coordination lock or is unfinished
    #[error("Run in progress: {0}")]
    RunInProgress(String),

    /// Caller-supplied shard hash does not match the shard content
    #[error("Shard hash mismatch: expected {expected}, computed {actual}")]
    HashMismatch { expected: String, actual: String },

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// SQLSTATE codes worth retrying inside a single batch.
const TRANSIENT_SQLSTATES: &[&str] = &[
    "40001", // serialization_failure
    "40P01", // deadlock_detected
    "55P03", // lock_not_available
    "57014", // query_canceled (statement timeout)
];

impl Error {
    /// Whether a failed batch may be retried locally before surfacing.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Database(e) => match e {
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed => {
                    true
                }
                sqlx::Error::Database(db) => db
                    .code()
                    .map(|code| TRANSIENT_SQLSTATES.iter().any(|c| code == *c))
                    .unwrap_or(false),
                _ => false,
            },
            _ => false,
        }
    }

    /// Whether this error was a rejected call that never touched stored state.
    pub fn leaves_state_unchanged(&self) -> bool {
        matches!(
            self,
            Error::InvalidTransition { .. }
                | Error::InvalidInput(_)
                | Error::NotInitialized(_)
                | Error::RunInProgress(_)
                | Error::HashMismatch { .. }
                | Error::Schema(_)
        )
    }
}
