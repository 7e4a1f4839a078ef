//! Target writers.
//!
//! A [`Writer`] receives one table at a time: `begin_table`, any number of
//! `write_batch` calls (with `alter_column` when the schema widens while
//! streaming), then `finish_table` or `abort_table`. `close` ends the job for
//! that target. Writers are picked from the descriptor's explicit
//! [`TargetKind`] tag.

pub mod delimited;
pub mod document;
pub mod remote;
pub mod spreadsheet;
pub mod sql_script;
pub mod sqlite;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    config::EngineConfig,
    error::{ConvertError, Result},
    naming::{self, NamingVars},
    online::{OnlineContext, RemoteDescriptor},
    report::{Warning, WarningCode},
    rows::{ColumnChange, RowBatch},
    schema::Table,
    typemap::Vocabulary,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    #[serde(alias = "sql")]
    SqlScript,
    #[serde(alias = "embedded")]
    Sqlite,
    #[serde(alias = "csv", alias = "tsv")]
    Delimited,
    #[serde(alias = "xlsx", alias = "excel")]
    Spreadsheet,
    #[serde(alias = "json", alias = "jsonl")]
    Document,
    #[serde(alias = "mysql", alias = "postgres")]
    Remote,
}

impl TargetKind {
    pub fn label(self) -> &'static str {
        match self {
            TargetKind::SqlScript => "sql_script",
            TargetKind::Sqlite => "sqlite",
            TargetKind::Delimited => "delimited",
            TargetKind::Spreadsheet => "spreadsheet",
            TargetKind::Document => "document",
            TargetKind::Remote => "remote",
        }
    }

    /// Kinds whose destination is a local file path.
    pub fn is_file(self) -> bool {
        self != TargetKind::Remote
    }
}

impl std::str::FromStr for TargetKind {
    type Err = ConvertError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sql_script" | "sql" => Ok(TargetKind::SqlScript),
            "sqlite" | "embedded" => Ok(TargetKind::Sqlite),
            "delimited" | "csv" | "tsv" => Ok(TargetKind::Delimited),
            "spreadsheet" | "xlsx" | "excel" => Ok(TargetKind::Spreadsheet),
            "document" | "json" | "jsonl" => Ok(TargetKind::Document),
            "remote" | "mysql" | "postgres" => Ok(TargetKind::Remote),
            other => Err(ConvertError::Config(format!("unknown target kind '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlDialect {
    #[default]
    Mysql,
    Postgres,
    Sqlite,
}

impl SqlDialect {
    pub fn vocabulary(self) -> Vocabulary {
        match self {
            SqlDialect::Mysql => Vocabulary::MySql,
            SqlDialect::Postgres => Vocabulary::Postgres,
            SqlDialect::Sqlite => Vocabulary::Sqlite,
        }
    }
}

impl std::str::FromStr for SqlDialect {
    type Err = ConvertError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(SqlDialect::Mysql),
            "postgres" | "postgresql" => Ok(SqlDialect::Postgres),
            "sqlite" => Ok(SqlDialect::Sqlite),
            other => Err(ConvertError::Config(format!("unknown SQL dialect '{other}'"))),
        }
    }
}

/// What a remote writer does when the destination table already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IfExists {
    #[default]
    Replace,
    Append,
    Fail,
}

impl std::str::FromStr for IfExists {
    type Err = ConvertError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "replace" => Ok(IfExists::Replace),
            "append" => Ok(IfExists::Append),
            "fail" => Ok(IfExists::Fail),
            other => Err(ConvertError::Config(format!(
                "unknown if_exists policy '{other}'; use replace, append or fail"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetDescriptor {
    pub kind: TargetKind,
    /// File path for local targets; table name (template) for remote ones.
    pub destination: String,
    /// Report key; defaults to `kind:destination`.
    #[serde(default)]
    pub name: Option<String>,
    /// Template expanded per partition, replacing `destination`.
    #[serde(default)]
    pub naming: Option<String>,
    #[serde(default)]
    pub partition_column: Option<String>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub dialect: SqlDialect,
    #[serde(default)]
    pub if_exists: IfExists,
    #[serde(default)]
    pub remote: Option<RemoteDescriptor>,
}

impl TargetDescriptor {
    pub fn new(kind: TargetKind, destination: impl Into<String>) -> Self {
        Self {
            kind,
            destination: destination.into(),
            name: None,
            naming: None,
            partition_column: None,
            batch_size: None,
            dialect: SqlDialect::default(),
            if_exists: IfExists::default(),
            remote: None,
        }
    }

    /// Parses a command-line `KIND:DESTINATION` pair.
    pub fn parse_spec(spec: &str) -> Result<Self> {
        let (kind, destination) = spec.split_once(':').ok_or_else(|| {
            ConvertError::Config(format!("target '{spec}' must look like KIND:DESTINATION"))
        })?;
        if destination.trim().is_empty() {
            return Err(ConvertError::Config(format!("target '{spec}' has no destination")));
        }
        Ok(Self::new(kind.parse()?, destination.trim()))
    }

    pub fn id(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.kind.label(), self.destination))
    }

    pub fn path(&self) -> PathBuf {
        PathBuf::from(&self.destination)
    }

    pub fn resolve_relative_to(&mut self, base: &Path) {
        if self.kind.is_file() && Path::new(&self.destination).is_relative() {
            self.destination = base.join(&self.destination).to_string_lossy().into_owned();
        }
    }

    /// The descriptor of one sub-job: the naming template (or the
    /// destination itself) expanded with the partition and source names.
    pub fn for_partition(&self, vars: &NamingVars) -> Result<Self> {
        let template = self.naming.as_deref().unwrap_or(&self.destination);
        let mut expanded = self.clone();
        expanded.destination = naming::expand(template, vars)?;
        if let Some(name) = &self.name
            && let Some(partition) = &vars.partition
        {
            expanded.name = Some(format!("{name}[{partition}]"));
        }
        Ok(expanded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteAck {
    pub rows: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WriterSummary {
    pub rows_written: u64,
    pub tables: usize,
}

pub trait Writer {
    /// Creates the destination for `table` and returns mapping warnings.
    fn begin_table(&mut self, table: &Table) -> Result<Vec<Warning>>;

    /// Applies a column definition that changed mid-stream and returns
    /// mapping warnings for the new type.
    fn alter_column(&mut self, _table: &Table, _change: &ColumnChange) -> Result<Vec<Warning>> {
        Ok(Vec::new())
    }

    fn write_batch(&mut self, batch: &RowBatch) -> Result<WriteAck>;

    /// Completes the current table, returning verification warnings.
    fn finish_table(&mut self) -> Result<Vec<Warning>>;

    /// Abandons the current table after a failure; best effort.
    fn abort_table(&mut self);

    fn close(self: Box<Self>) -> Result<WriterSummary>;
}

/// SQL targets cannot declare a table without columns, so such tables are
/// skipped there and reported.
pub(crate) fn empty_table_warning(table: &Table, target: &str) -> Warning {
    Warning::new(
        &table.name,
        WarningCode::EmptyTable,
        format!("table has no columns; no {target} table was created"),
    )
}

/// Shared inputs for opening writers.
pub struct WriterContext<'a> {
    pub config: &'a EngineConfig,
    pub online: OnlineContext<'a>,
    /// The dataset holds one table, so per-table names need no suffix.
    pub single_table: bool,
}

pub fn open_writer<'a>(
    target: &TargetDescriptor,
    ctx: &WriterContext<'a>,
) -> Result<Box<dyn Writer + 'a>> {
    let writer: Box<dyn Writer + 'a> = match target.kind {
        TargetKind::SqlScript => Box::new(sql_script::SqlScriptWriter::create(
            &target.path(),
            target.dialect,
            ctx.config.rows_per_statement,
        )?),
        TargetKind::Sqlite => Box::new(sqlite::SqliteWriter::open(&target.path())?),
        TargetKind::Delimited => Box::new(delimited::DelimitedWriter::new(
            &target.path(),
            ctx.single_table,
        )),
        TargetKind::Spreadsheet => Box::new(spreadsheet::SpreadsheetWriter::new(&target.path())?),
        TargetKind::Document => Box::new(document::DocumentWriter::new(
            &target.path(),
            ctx.single_table,
        )),
        TargetKind::Remote => {
            let descriptor = target.remote.clone().ok_or_else(|| {
                ConvertError::Config(format!(
                    "remote target '{}' has no connection settings",
                    target.id()
                ))
            })?;
            Box::new(remote::RemoteWriter::connect(
                descriptor,
                &target.destination,
                target.if_exists,
                ctx.online.clone(),
                ctx.single_table,
            )?)
        }
    };
    Ok(writer)
}
