//! Error taxonomy for the conversion engine.
//!
//! Every failure the engine can raise is a [`ConvertError`]. The orchestrator
//! never inspects messages: it decides what to do from [`ConvertError::scope`]
//! (how much of the job the failure invalidates) and
//! [`ConvertError::is_transient`] (whether a retry may succeed).

use std::io;

use thiserror::Error;

/// How much of a job an error invalidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorScope {
    /// A single row; skipped and counted.
    Row,
    /// A single column; recovered and reported as a warning.
    Column,
    /// One table on one target; other tables and targets continue.
    Table,
    /// One target; other targets continue.
    Target,
    /// The whole job.
    Job,
}

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("cannot decode {path}: {message}")]
    Decode {
        path: String,
        message: String,
        /// Encoding labels worth trying on a manual retry.
        suggestions: Vec<String>,
    },

    #[error("malformed row {row} in table '{table}': {message}")]
    MalformedRow {
        table: String,
        row: u64,
        column: Option<String>,
        message: String,
    },

    #[error("schema conflict on {table}.{column}: {message}")]
    SchemaConflict {
        table: String,
        column: String,
        message: String,
    },

    #[error("target capacity exceeded for '{table}': {message}")]
    TargetCapacityExceeded { table: String, message: String },

    #[error("transient connection error: {0}")]
    TransientConnection(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("data integrity violation on '{table}': {message}")]
    DataIntegrity { table: String, message: String },

    #[error("target '{target}' failed: {message}")]
    Target { target: String, message: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("job cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ConvertError {
    pub fn target(target: impl Into<String>, message: impl Into<String>) -> Self {
        ConvertError::Target {
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn integrity(table: impl Into<String>, message: impl Into<String>) -> Self {
        ConvertError::DataIntegrity {
            table: table.into(),
            message: message.into(),
        }
    }

    pub fn scope(&self) -> ErrorScope {
        match self {
            ConvertError::MalformedRow { .. } => ErrorScope::Row,
            ConvertError::SchemaConflict { .. } | ConvertError::TargetCapacityExceeded { .. } => {
                ErrorScope::Column
            }
            ConvertError::DataIntegrity { .. } | ConvertError::Target { .. } => ErrorScope::Table,
            ConvertError::TransientConnection(_)
            | ConvertError::Auth(_)
            | ConvertError::Permission(_) => ErrorScope::Target,
            ConvertError::SourceUnavailable(_)
            | ConvertError::Decode { .. }
            | ConvertError::Validation(_)
            | ConvertError::Config(_)
            | ConvertError::Cancelled
            | ConvertError::Io(_) => ErrorScope::Job,
        }
    }

    /// Transient errors are the only ones the retry policy will repeat.
    pub fn is_transient(&self) -> bool {
        matches!(self, ConvertError::TransientConnection(_))
    }

    /// Decode failures can be retried by the caller with a manual encoding.
    pub fn is_retryable_by_user(&self) -> bool {
        matches!(self, ConvertError::Decode { .. })
    }

    /// Stable machine-readable code used in job summaries.
    pub fn code(&self) -> &'static str {
        match self {
            ConvertError::SourceUnavailable(_) => "source_unavailable",
            ConvertError::Decode { .. } => "decode_error",
            ConvertError::MalformedRow { .. } => "malformed_row",
            ConvertError::SchemaConflict { .. } => "schema_conflict",
            ConvertError::TargetCapacityExceeded { .. } => "target_capacity_exceeded",
            ConvertError::TransientConnection(_) => "transient_connection_error",
            ConvertError::Auth(_) => "auth_error",
            ConvertError::Permission(_) => "permission_error",
            ConvertError::DataIntegrity { .. } => "data_integrity_error",
            ConvertError::Target { .. } => "target_error",
            ConvertError::Validation(_) => "validation_error",
            ConvertError::Config(_) => "config_error",
            ConvertError::Cancelled => "cancelled",
            ConvertError::Io(_) => "io_error",
        }
    }
}

impl From<csv::Error> for ConvertError {
    fn from(err: csv::Error) -> Self {
        match err.into_kind() {
            csv::ErrorKind::Io(io) => ConvertError::Io(io),
            other => ConvertError::Validation(format!("CSV error: {other:?}")),
        }
    }
}

pub type Result<T> = std::result::Result<T, ConvertError>;
