//! Job result summary.
//!
//! A [`JobSummary`] is produced for every job, successful or not, so callers
//! always see partial success explicitly: per-table row accounting, a flat
//! warning list and one [`TargetReport`] per configured target.

use std::collections::BTreeMap;

use serde::Serialize;
use uuid::Uuid;

use crate::{error::ConvertError, orchestrator::JobState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningCode {
    MalformedRow,
    MalformedRowsSuppressed,
    UnknownSourceType,
    LossyType,
    TargetCapacityExceeded,
    IdentifierRenamed,
    SchemaWidened,
    RowCountMismatch,
    PartitionColumnMissing,
    EmptyTable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Warning {
    pub table: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    pub code: WarningCode,
    pub message: String,
}

impl Warning {
    pub fn new(table: impl Into<String>, code: WarningCode, message: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: None,
            code,
            message: message.into(),
        }
    }

    pub fn on_column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Success,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableFailure {
    pub table: String,
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetReport {
    pub kind: String,
    pub destination: String,
    pub status: TargetStatus,
    pub rows_written: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_tables: Vec<TableFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl TargetReport {
    pub fn new(kind: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            destination: destination.into(),
            status: TargetStatus::Success,
            rows_written: 0,
            failed_tables: Vec::new(),
            error_detail: None,
        }
    }

    pub fn fail_table(&mut self, table: &str, err: &ConvertError) {
        self.status = TargetStatus::Failed;
        self.failed_tables.push(TableFailure {
            table: table.to_string(),
            code: err.code(),
            message: err.to_string(),
        });
    }

    pub fn fail(&mut self, err: &ConvertError) {
        self.status = TargetStatus::Failed;
        self.error_detail = Some(err.to_string());
    }

    pub fn succeeded(&self) -> bool {
        self.status == TargetStatus::Success
    }
}

/// Row accounting for one table; `rows_read == rows_written + rows_skipped`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableReport {
    pub table: String,
    pub rows_read: u64,
    pub rows_written: u64,
    pub rows_skipped: u64,
    pub batches: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobError {
    pub kind: &'static str,
    pub message: String,
    pub retryable: bool,
}

impl From<&ConvertError> for JobError {
    fn from(err: &ConvertError) -> Self {
        Self {
            kind: err.code(),
            message: err.to_string(),
            retryable: err.is_retryable_by_user(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub job_id: Uuid,
    pub state: JobState,
    pub tables_processed: usize,
    pub rows_written: u64,
    pub rows_skipped: u64,
    pub tables: Vec<TableReport>,
    pub warnings: Vec<Warning>,
    pub per_target: BTreeMap<String, TargetReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub elapsed_ms: u128,
}

impl JobSummary {
    pub fn table(&self, name: &str) -> Option<&TableReport> {
        self.tables.iter().find(|t| t.table == name)
    }

    pub fn warnings_with(&self, code: WarningCode) -> impl Iterator<Item = &Warning> {
        self.warnings.iter().filter(move |w| w.code == code)
    }

    /// Failed overall but at least one target completed.
    pub fn is_partial_success(&self) -> bool {
        self.state == JobState::Failed && self.per_target.values().any(TargetReport::succeeded)
    }

    /// Process exit code for command-line callers.
    pub fn exit_code(&self) -> i32 {
        match self.state {
            JobState::Completed => 0,
            _ if self.is_partial_success() => 2,
            _ => 1,
        }
    }
}
