//! Embedded database file written through rusqlite.
//!
//! One file per job. Every batch is its own transaction: a failing batch is
//! rolled back alone and earlier batches stay committed. Finished tables are
//! re-counted and a mismatch is reported as a warning.

use std::path::{Path, PathBuf};

use itertools::Itertools;
use log::{debug, info};
use rusqlite::{Connection, ErrorCode, params_from_iter, types::Value as SqlValue};

use super::{SqlDialect, WriteAck, Writer, WriterSummary, empty_table_warning, sql_script};
use crate::{
    data::Value,
    error::{ConvertError, Result},
    naming,
    report::{Warning, WarningCode},
    rows::{ColumnChange, RowBatch},
    schema::Table,
    typemap::{TargetLayout, Vocabulary},
};

struct OpenTable {
    source: String,
    layout: TargetLayout,
    insert: String,
    acknowledged: u64,
}

pub struct SqliteWriter {
    path: PathBuf,
    conn: Connection,
    current: Option<OpenTable>,
    rows_written: u64,
    tables: usize,
}

fn to_sql_value(value: Option<Value>) -> SqlValue {
    match value {
        None => SqlValue::Null,
        Some(Value::Integer(i)) => SqlValue::Integer(i),
        Some(Value::Boolean(b)) => SqlValue::Integer(i64::from(b)),
        Some(Value::Float(f)) => SqlValue::Real(f),
        Some(Value::Binary(bytes)) => SqlValue::Blob(bytes),
        Some(other) => SqlValue::Text(other.as_display()),
    }
}

impl SqliteWriter {
    pub fn open(path: &Path) -> Result<Self> {
        crate::io_utils::ensure_parent_dir(path)?;
        let conn = Connection::open(path)
            .map_err(|err| ConvertError::target(path.display().to_string(), err.to_string()))?;
        info!("Writing embedded database {path:?}");
        Ok(Self {
            path: path.to_path_buf(),
            conn,
            current: None,
            rows_written: 0,
            tables: 0,
        })
    }

    fn error(&self, table: &str, err: rusqlite::Error) -> ConvertError {
        match err.sqlite_error_code() {
            Some(ErrorCode::ConstraintViolation) => ConvertError::integrity(table, err.to_string()),
            _ => ConvertError::target(self.path.display().to_string(), err.to_string()),
        }
    }

    fn current(&self) -> Result<&OpenTable> {
        self.current.as_ref().ok_or_else(|| {
            ConvertError::target(self.path.display().to_string(), "no table in progress")
        })
    }
}

impl Writer for SqliteWriter {
    fn begin_table(&mut self, table: &Table) -> Result<Vec<Warning>> {
        let name = naming::sanitize_identifier(&table.name);
        let (layout, mut warnings) = TargetLayout::plan(table, &name, Vocabulary::Sqlite);
        if layout.columns.is_empty() {
            warnings.push(empty_table_warning(table, "SQLite"));
            self.current = Some(OpenTable {
                source: table.name.clone(),
                layout,
                insert: String::new(),
                acknowledged: 0,
            });
            return Ok(warnings);
        }
        let ident = sql_script::quote_ident(SqlDialect::Sqlite, &layout.table_name);
        let ddl = format!(
            "DROP TABLE IF EXISTS {ident};\n{}",
            sql_script::create_table_sql(SqlDialect::Sqlite, &layout)
        );
        self.conn
            .execute_batch(&ddl)
            .map_err(|err| self.error(&table.name, err))?;
        let insert = format!(
            "INSERT INTO {ident} ({}) VALUES ({})",
            layout
                .columns
                .iter()
                .map(|c| sql_script::quote_ident(SqlDialect::Sqlite, &c.name))
                .join(", "),
            (1..=layout.columns.len()).map(|n| format!("?{n}")).join(", ")
        );
        self.current = Some(OpenTable {
            source: table.name.clone(),
            layout,
            insert,
            acknowledged: 0,
        });
        Ok(warnings)
    }

    fn alter_column(&mut self, table: &Table, change: &ColumnChange) -> Result<Vec<Warning>> {
        let widening = self
            .current
            .as_mut()
            .and_then(|open| open.layout.widen(&table.name, change));
        Ok(widening.and_then(|w| w.lossy).into_iter().collect())
    }

    fn write_batch(&mut self, batch: &RowBatch) -> Result<WriteAck> {
        let open = self.current()?;
        if open.layout.columns.is_empty() {
            return Ok(WriteAck::default());
        }
        let source = open.source.clone();
        let result = (|| -> rusqlite::Result<()> {
            let tx = self.conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare_cached(&open.insert)?;
                for row in &batch.rows {
                    let projected = open.layout.project(row);
                    stmt.execute(params_from_iter(projected.into_iter().map(to_sql_value)))?;
                }
            }
            tx.commit()
        })();
        result.map_err(|err| self.error(&source, err))?;
        debug!("Committed batch {} ({} rows) to {source}", batch.sequence, batch.len());
        let rows = batch.len() as u64;
        if let Some(open) = self.current.as_mut() {
            open.acknowledged += rows;
        }
        self.rows_written += rows;
        Ok(WriteAck { rows })
    }

    fn finish_table(&mut self) -> Result<Vec<Warning>> {
        let Some(open) = self.current.take() else {
            return Ok(Vec::new());
        };
        self.tables += 1;
        if open.layout.columns.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT COUNT(*) FROM {}",
            sql_script::quote_ident(SqlDialect::Sqlite, &open.layout.table_name)
        );
        let count: i64 = self
            .conn
            .query_row(&sql, [], |row| row.get(0))
            .map_err(|err| self.error(&open.source, err))?;
        if u64::try_from(count).ok() != Some(open.acknowledged) {
            return Ok(vec![Warning::new(
                &open.source,
                WarningCode::RowCountMismatch,
                format!(
                    "table '{}' holds {count} rows but {} were written",
                    open.layout.table_name, open.acknowledged
                ),
            )]);
        }
        Ok(Vec::new())
    }

    fn abort_table(&mut self) {
        self.current = None;
    }

    fn close(self: Box<Self>) -> Result<WriterSummary> {
        let summary = WriterSummary {
            rows_written: self.rows_written,
            tables: self.tables,
        };
        let path = self.path.display().to_string();
        self.conn
            .close()
            .map_err(|(_, err)| ConvertError::target(path, err.to_string()))?;
        Ok(summary)
    }
}
