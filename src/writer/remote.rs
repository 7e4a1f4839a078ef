//! Remote relational target over a [`RemoteSession`].
//!
//! SQL is rendered in the dialect of the descriptor's engine. Every
//! statement group runs through the job's retry policy. A transient failure
//! drops the session and the next attempt reconnects; batches are whole
//! transactions, so a retried batch never lands twice.

use log::{debug, info, warn};

use super::{
    IfExists, SqlDialect, WriteAck, Writer, WriterSummary, empty_table_warning, sql_script,
};
use crate::{
    error::{ConvertError, Result},
    naming,
    online::{OnlineContext, RemoteDescriptor, RemoteSession},
    report::{Warning, WarningCode},
    rows::{ColumnChange, RowBatch},
    schema::Table,
    typemap::TargetLayout,
};

struct OpenTable {
    source: String,
    layout: TargetLayout,
    /// Rows already present before this job wrote anything.
    baseline: u64,
    acknowledged: u64,
}

pub struct RemoteWriter<'a> {
    descriptor: RemoteDescriptor,
    dialect: SqlDialect,
    destination: String,
    if_exists: IfExists,
    online: OnlineContext<'a>,
    single_table: bool,
    session: Option<Box<dyn RemoteSession>>,
    current: Option<OpenTable>,
    rows_written: u64,
    tables: usize,
}

/// Pins driver errors that carry no table to the table being written.
fn attribute(err: ConvertError, table: &str) -> ConvertError {
    match err {
        ConvertError::DataIntegrity { table: t, message } if t.is_empty() => {
            ConvertError::integrity(table, message)
        }
        ConvertError::Target { target, message } if target.is_empty() => {
            ConvertError::target(table, message)
        }
        other => other,
    }
}

impl<'a> RemoteWriter<'a> {
    /// Opens the first session eagerly so unreachable servers fail the
    /// target before any table is started.
    pub fn connect(
        descriptor: RemoteDescriptor,
        destination: &str,
        if_exists: IfExists,
        online: OnlineContext<'a>,
        single_table: bool,
    ) -> Result<Self> {
        let session = online.connect(&descriptor)?;
        info!("Connected to {}", descriptor.label());
        Ok(Self {
            dialect: descriptor.engine.dialect(),
            descriptor,
            destination: destination.to_string(),
            if_exists,
            online,
            single_table,
            session: Some(session),
            current: None,
            rows_written: 0,
            tables: 0,
        })
    }

    /// Runs `op` on the session under the retry policy, reconnecting after
    /// transient failures.
    fn with_session<T>(
        &mut self,
        label: &str,
        table: &str,
        mut op: impl FnMut(&mut dyn RemoteSession) -> Result<T>,
    ) -> Result<T> {
        let online = self.online.clone();
        let descriptor = &self.descriptor;
        let slot = &mut self.session;
        let result = online
            .policy()
            .run(label, online.sleeper, online.cancel, |attempt| {
                let mut session = match slot.take() {
                    Some(session) => session,
                    None => {
                        debug!("{label}: reconnecting for attempt {attempt}");
                        online.connector.connect(descriptor, online.config)?
                    }
                };
                let outcome = op(session.as_mut());
                match &outcome {
                    Err(err) if err.is_transient() => drop(session),
                    _ => *slot = Some(session),
                }
                outcome
            });
        result.map_err(|err| attribute(err, table))
    }

    fn execute(&mut self, label: &str, table: &str, sql: &str) -> Result<()> {
        self.with_session(label, table, |session| session.batch_execute(sql))
    }

    fn count_rows(&mut self, table: &str, layout: &TargetLayout) -> Result<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {}",
            sql_script::quote_ident(self.dialect, &layout.table_name)
        );
        let raw = self.with_session("count rows", table, |session| session.query_scalar(&sql))?;
        Ok(raw.and_then(|count| count.trim().parse().ok()).unwrap_or(0))
    }

    fn table_exists(&mut self, table: &str, name: &str) -> Result<bool> {
        let sql = self.descriptor.engine.table_exists_query(name);
        let raw = self.with_session("check table", table, |session| session.query_scalar(&sql))?;
        Ok(raw.is_some_and(|count| count.trim() != "0"))
    }

    fn rollback(&mut self) {
        if let Some(session) = self.session.as_mut()
            && let Err(err) = session.batch_execute("ROLLBACK")
        {
            debug!("Rollback on {} failed: {err}", self.descriptor.label());
        }
    }
}

impl Writer for RemoteWriter<'_> {
    fn begin_table(&mut self, table: &Table) -> Result<Vec<Warning>> {
        let raw_name = naming::per_table_name(&self.destination, &table.name, self.single_table);
        let name = naming::sanitize_identifier(&raw_name);
        let (layout, mut warnings) = TargetLayout::plan(table, &name, self.dialect.vocabulary());
        if name != raw_name {
            warnings.push(Warning::new(
                &table.name,
                WarningCode::IdentifierRenamed,
                format!("remote table '{raw_name}' is created as '{name}'"),
            ));
        }
        if layout.columns.is_empty() {
            warnings.push(empty_table_warning(table, "remote"));
            self.current = Some(OpenTable {
                source: table.name.clone(),
                layout,
                baseline: 0,
                acknowledged: 0,
            });
            return Ok(warnings);
        }
        let ident = sql_script::quote_ident(self.dialect, &layout.table_name);
        let create = sql_script::create_table_sql(self.dialect, &layout);
        let exists = self.table_exists(&table.name, &name)?;
        let ddl = match self.if_exists {
            IfExists::Replace => format!("DROP TABLE IF EXISTS {ident};\n{create}"),
            IfExists::Append => create,
            IfExists::Fail if exists => {
                return Err(ConvertError::integrity(
                    &table.name,
                    format!("remote table '{name}' already exists"),
                ));
            }
            IfExists::Fail => create,
        };
        self.execute("create table", &table.name, &ddl)?;
        let baseline = if self.if_exists == IfExists::Append && exists {
            self.count_rows(&table.name, &layout)?
        } else {
            0
        };
        info!(
            "Writing table '{}' to {} as {name}",
            table.name,
            self.descriptor.label()
        );
        self.current = Some(OpenTable {
            source: table.name.clone(),
            layout,
            baseline,
            acknowledged: 0,
        });
        Ok(warnings)
    }

    fn alter_column(&mut self, table: &Table, change: &ColumnChange) -> Result<Vec<Warning>> {
        let dialect = self.dialect;
        let Some(open) = self.current.as_mut() else {
            return Ok(Vec::new());
        };
        let Some(widening) = open.layout.widen(&table.name, change) else {
            return Ok(Vec::new());
        };
        let statements = sql_script::alter_column_sql(dialect, &open.layout, &widening);
        if !statements.is_empty() {
            self.execute("alter column", &table.name, &statements.join("\n"))?;
        }
        Ok(widening.lossy.into_iter().collect())
    }

    fn write_batch(&mut self, batch: &RowBatch) -> Result<WriteAck> {
        let open = self.current.as_ref().ok_or_else(|| {
            ConvertError::target(self.descriptor.label(), "no table in progress")
        })?;
        if batch.is_empty() || open.layout.columns.is_empty() {
            return Ok(WriteAck::default());
        }
        let source = open.source.clone();
        let skip_conflicts = !open.layout.primary_key.is_empty();
        let mut sql = format!("{}\n", sql_script::begin_statement(self.dialect));
        for chunk in batch.rows.chunks(self.online.config.rows_per_statement.max(1)) {
            sql.push_str(&sql_script::insert_sql(
                self.dialect,
                &open.layout,
                chunk,
                skip_conflicts,
            ));
        }
        sql.push_str("COMMIT;");
        let label = format!("batch {} of {source}", batch.sequence);
        if let Err(err) = self.execute(&label, &source, &sql) {
            self.rollback();
            return Err(err);
        }
        let rows = batch.len() as u64;
        if let Some(open) = self.current.as_mut() {
            open.acknowledged += rows;
        }
        self.rows_written += rows;
        debug!("Committed {label} ({rows} rows)");
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
        let count = self.count_rows(&open.source, &open.layout)?;
        let expected = open.baseline + open.acknowledged;
        if count != expected {
            warn!(
                "Remote table {} holds {count} rows, expected {expected}",
                open.layout.table_name
            );
            return Ok(vec![Warning::new(
                &open.source,
                WarningCode::RowCountMismatch,
                format!(
                    "remote table '{}' holds {count} rows but {expected} were expected",
                    open.layout.table_name
                ),
            )]);
        }
        Ok(Vec::new())
    }

    fn abort_table(&mut self) {
        if self
            .current
            .take()
            .is_some_and(|open| !open.layout.columns.is_empty())
        {
            self.rollback();
        }
    }

    fn close(mut self: Box<Self>) -> Result<WriterSummary> {
        self.session = None;
        debug!("Released connection to {}", self.descriptor.label());
        Ok(WriterSummary {
            rows_written: self.rows_written,
            tables: self.tables,
        })
    }
}
