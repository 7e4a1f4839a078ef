//! SQL dump scripts, plus the SQL rendering shared with the remote writer.
//!
//! Each table gets a header comment and `CREATE TABLE IF NOT EXISTS`, then
//! its inserts inside one explicit transaction; on MySQL a mid-table `ALTER`
//! ends that transaction and starts another. Inserts carry at most
//! `rows_per_statement` rows each. The script is not transactional across
//! tables. Tables without columns are skipped.

use std::{fmt::Write as _, path::Path};

use itertools::Itertools;
use log::{debug, info};

use super::{SqlDialect, WriteAck, Writer, WriterSummary, empty_table_warning};
use crate::{
    data::{Value, hex_encode, parse_typed_value},
    error::{ConvertError, Result},
    io_utils::{self, CommittedFile},
    naming,
    report::Warning,
    rows::{ColumnChange, RowBatch},
    schema::Table,
    typemap::{TargetColumn, TargetLayout, Widening},
};

pub fn quote_ident(dialect: SqlDialect, name: &str) -> String {
    match dialect {
        SqlDialect::Mysql => format!("`{}`", name.replace('`', "``")),
        SqlDialect::Postgres | SqlDialect::Sqlite => format!("\"{}\"", name.replace('"', "\"\"")),
    }
}

fn quote_text(dialect: SqlDialect, text: &str) -> String {
    let mut escaped = text.replace('\0', "").replace('\'', "''");
    if dialect == SqlDialect::Mysql {
        escaped = escaped.replace('\\', "\\\\");
    }
    format!("'{escaped}'")
}

pub fn render_literal(dialect: SqlDialect, value: Option<&Value>) -> String {
    let Some(value) = value else {
        return "NULL".to_string();
    };
    match value {
        Value::Integer(i) => i.to_string(),
        Value::Decimal(d) => d.normalize().to_string(),
        Value::Float(f) if f.is_finite() => value.as_display(),
        Value::Float(_) => "NULL".to_string(),
        Value::Boolean(b) => match dialect {
            SqlDialect::Postgres => (if *b { "TRUE" } else { "FALSE" }).to_string(),
            _ => (if *b { "1" } else { "0" }).to_string(),
        },
        Value::Binary(bytes) => match dialect {
            SqlDialect::Postgres => format!("'\\x{}'::bytea", hex_encode(bytes)),
            _ => format!("X'{}'", hex_encode(bytes)),
        },
        Value::Date(_) | Value::DateTime(_) | Value::Text(_) => {
            quote_text(dialect, &value.as_display())
        }
    }
}

fn column_definition(dialect: SqlDialect, column: &TargetColumn) -> String {
    let mut definition = format!("{} {}", quote_ident(dialect, &column.name), column.native);
    let not_null = match dialect {
        // SQLite cannot relax NOT NULL later, so only declared ones are kept.
        SqlDialect::Sqlite => !column.nullable && column.nullable_declared,
        _ => !column.nullable,
    };
    if not_null {
        definition.push_str(" NOT NULL");
    }
    if let Some(default) = &column.default {
        let literal = match parse_typed_value(Some(default), &column.ty) {
            Ok(value) => render_literal(dialect, value.as_ref()),
            Err(_) => quote_text(dialect, default),
        };
        let _ = write!(definition, " DEFAULT {literal}");
    }
    definition
}

pub fn create_table_sql(dialect: SqlDialect, layout: &TargetLayout) -> String {
    let mut lines = layout
        .columns
        .iter()
        .map(|column| format!("  {}", column_definition(dialect, column)))
        .collect_vec();
    if !layout.primary_key.is_empty() {
        lines.push(format!(
            "  PRIMARY KEY ({})",
            layout
                .primary_key
                .iter()
                .map(|key| quote_ident(dialect, key))
                .join(", ")
        ));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{}\n);\n",
        quote_ident(dialect, &layout.table_name),
        lines.join(",\n")
    )
}

/// One multi-row INSERT; `skip_conflicts` adds `ON CONFLICT DO NOTHING`
/// (Postgres and SQLite) or `INSERT IGNORE` (MySQL).
pub fn insert_sql(
    dialect: SqlDialect,
    layout: &TargetLayout,
    rows: &[Vec<Option<Value>>],
    skip_conflicts: bool,
) -> String {
    let columns = layout
        .columns
        .iter()
        .map(|column| quote_ident(dialect, &column.name))
        .join(", ");
    let values = rows
        .iter()
        .map(|row| {
            let projected = layout.project(row);
            format!(
                "({})",
                projected
                    .iter()
                    .map(|cell| render_literal(dialect, cell.as_ref()))
                    .join(", ")
            )
        })
        .join(",\n  ");
    let verb = if skip_conflicts && dialect == SqlDialect::Mysql {
        "INSERT IGNORE"
    } else {
        "INSERT"
    };
    let tail = if skip_conflicts && dialect != SqlDialect::Mysql {
        " ON CONFLICT DO NOTHING"
    } else {
        ""
    };
    format!(
        "{verb} INTO {} ({columns}) VALUES\n  {values}{tail};\n",
        quote_ident(dialect, &layout.table_name)
    )
}

/// Statements that bring a target column in line with a widening already
/// applied to `layout`.
pub fn alter_column_sql(
    dialect: SqlDialect,
    layout: &TargetLayout,
    widening: &Widening,
) -> Vec<String> {
    let table = quote_ident(dialect, &layout.table_name);
    let column = &layout.columns[widening.position];
    let ident = quote_ident(dialect, &column.name);
    let native = &column.native;

    let mut statements = Vec::new();
    match dialect {
        SqlDialect::Mysql if widening.type_changed || widening.relaxed => {
            let null = if column.nullable { "NULL" } else { "NOT NULL" };
            statements.push(format!(
                "ALTER TABLE {table} MODIFY COLUMN {ident} {native} {null};"
            ));
        }
        SqlDialect::Postgres => {
            if widening.type_changed {
                statements.push(format!(
                    "ALTER TABLE {table} ALTER COLUMN {ident} TYPE {native} USING {ident}::{native};"
                ));
            }
            if widening.relaxed {
                statements.push(format!(
                    "ALTER TABLE {table} ALTER COLUMN {ident} DROP NOT NULL;"
                ));
            }
        }
        // SQLite columns take any value; its NOT NULLs are declared ones only.
        _ => {}
    }
    statements
}

pub(crate) fn begin_statement(dialect: SqlDialect) -> &'static str {
    match dialect {
        SqlDialect::Mysql => "START TRANSACTION;",
        SqlDialect::Postgres | SqlDialect::Sqlite => "BEGIN;",
    }
}

pub struct SqlScriptWriter {
    file: CommittedFile,
    dialect: SqlDialect,
    rows_per_statement: usize,
    layout: Option<TargetLayout>,
    rows_written: u64,
    tables: usize,
}

impl SqlScriptWriter {
    pub fn create(path: &Path, dialect: SqlDialect, rows_per_statement: usize) -> Result<Self> {
        info!("Writing {dialect:?} script to {path:?}");
        let mut file = CommittedFile::create(path)?;
        let header = format!(
            "-- Generated by legacy-convert {}\n-- Dialect: {dialect:?}\n\n",
            env!("CARGO_PKG_VERSION")
        );
        file.commit(header.as_bytes())?;
        Ok(Self {
            file,
            dialect,
            rows_per_statement: rows_per_statement.max(1),
            layout: None,
            rows_written: 0,
            tables: 0,
        })
    }

    fn layout(&self) -> Result<&TargetLayout> {
        self.layout
            .as_ref()
            .ok_or_else(|| ConvertError::target(self.target_name(), "no table in progress"))
    }

    fn target_name(&self) -> String {
        io_utils::display_path(self.file.path())
    }

    fn commit(&mut self, text: &str) -> Result<()> {
        self.file
            .commit(text.as_bytes())
            .map_err(|err| ConvertError::target(self.target_name(), err.to_string()))
    }
}

impl Writer for SqlScriptWriter {
    fn begin_table(&mut self, table: &Table) -> Result<Vec<Warning>> {
        let name = naming::sanitize_identifier(&table.name);
        let (layout, mut warnings) = TargetLayout::plan(table, &name, self.dialect.vocabulary());
        if layout.columns.is_empty() {
            let text = format!("-- Table: {} (0 columns) skipped\n\n", layout.table_name);
            self.commit(&text)?;
            self.layout = Some(layout);
            warnings.push(empty_table_warning(table, "script"));
            return Ok(warnings);
        }
        let mut text = format!(
            "-- Table: {} ({} columns)\n",
            layout.table_name,
            layout.columns.len()
        );
        text.push_str(&create_table_sql(self.dialect, &layout));
        text.push_str(begin_statement(self.dialect));
        text.push('\n');
        self.commit(&text)?;
        self.layout = Some(layout);
        Ok(warnings)
    }

    fn alter_column(&mut self, table: &Table, change: &ColumnChange) -> Result<Vec<Warning>> {
        let dialect = self.dialect;
        let Some(layout) = self.layout.as_mut() else {
            return Ok(Vec::new());
        };
        let Some(widening) = layout.widen(&table.name, change) else {
            return Ok(Vec::new());
        };
        let statements = alter_column_sql(dialect, layout, &widening);
        if !statements.is_empty() {
            let text = match dialect {
                // MySQL DDL implicitly commits the open transaction.
                SqlDialect::Mysql => format!(
                    "COMMIT;\n{}\n{}\n",
                    statements.join("\n"),
                    begin_statement(dialect)
                ),
                _ => format!("{}\n", statements.join("\n")),
            };
            self.commit(&text)?;
        }
        Ok(widening.lossy.into_iter().collect())
    }

    fn write_batch(&mut self, batch: &RowBatch) -> Result<WriteAck> {
        let layout = self.layout()?;
        if batch.is_empty() || layout.columns.is_empty() {
            return Ok(WriteAck::default());
        }
        let text: String = batch
            .rows
            .chunks(self.rows_per_statement)
            .map(|chunk| insert_sql(self.dialect, layout, chunk, false))
            .collect();
        self.commit(&text)?;
        debug!("Batch {} scripted ({} rows)", batch.sequence, batch.len());
        self.rows_written += batch.len() as u64;
        Ok(WriteAck {
            rows: batch.len() as u64,
        })
    }

    fn finish_table(&mut self) -> Result<Vec<Warning>> {
        if let Some(layout) = self.layout.take() {
            if !layout.columns.is_empty() {
                self.commit("COMMIT;\n\n")?;
            }
            self.tables += 1;
        }
        Ok(Vec::new())
    }

    fn abort_table(&mut self) {
        if self.layout.take().is_some_and(|layout| !layout.columns.is_empty()) {
            let _ = self.file.rollback();
            let _ = self.file.commit(b"ROLLBACK;\n\n");
        }
    }

    fn close(mut self: Box<Self>) -> Result<WriterSummary> {
        self.file
            .sync()
            .map_err(|err| ConvertError::target(self.target_name(), err.to_string()))?;
        Ok(WriterSummary {
            rows_written: self.rows_written,
            tables: self.tables,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        schema::{CanonicalType, Column, ColumnOrigin},
        typemap::Vocabulary,
    };
    use chrono::NaiveDate;
    use std::fs;

    fn clients() -> Table {
        let mut id = Column::declared("id", CanonicalType::INT32);
        id.nullable = false;
        id.nullable_origin = ColumnOrigin::Declared;
        let mut table = Table::new(
            "clients",
            vec![
                id,
                Column::inferred("name", CanonicalType::Text(Some(40)), true),
                Column::inferred("joined", CanonicalType::Date, false),
            ],
        );
        table.primary_key = vec!["id".into()];
        table
    }

    #[test]
    fn literals_follow_dialect_rules() {
        let text = Value::Text("O'Brien \\ co".into());
        assert_eq!(
            render_literal(SqlDialect::Mysql, Some(&text)),
            r"'O''Brien \\ co'"
        );
        assert_eq!(
            render_literal(SqlDialect::Postgres, Some(&text)),
            r"'O''Brien \ co'"
        );
        assert_eq!(
            render_literal(SqlDialect::Postgres, Some(&Value::Boolean(true))),
            "TRUE"
        );
        assert_eq!(
            render_literal(SqlDialect::Mysql, Some(&Value::Binary(vec![0xca, 0xfe]))),
            "X'cafe'"
        );
        assert_eq!(render_literal(SqlDialect::Sqlite, None), "NULL");
    }

    #[test]
    fn ddl_includes_key_and_nullability() {
        let (layout, _) = TargetLayout::plan(&clients(), "clients", Vocabulary::Postgres);
        let ddl = create_table_sql(SqlDialect::Postgres, &layout);
        assert!(ddl.starts_with("CREATE TABLE IF NOT EXISTS \"clients\" ("));
        assert!(ddl.contains("\"id\" INTEGER NOT NULL"));
        assert!(ddl.contains("\"joined\" DATE NOT NULL"));
        assert!(ddl.contains("PRIMARY KEY (\"id\")"));

        let (layout, _) = TargetLayout::plan(&clients(), "clients", Vocabulary::Sqlite);
        let ddl = create_table_sql(SqlDialect::Sqlite, &layout);
        assert!(ddl.contains("\"id\" INTEGER NOT NULL"));
        assert!(!ddl.contains("\"joined\" TEXT NOT NULL"));
    }

    fn joined_change(table: &Table, ty: CanonicalType) -> ColumnChange {
        let mut after = table.columns[2].clone();
        after.ty = ty;
        after.nullable = true;
        ColumnChange {
            index: 2,
            before: table.columns[2].clone(),
            after,
        }
    }

    #[test]
    fn widening_emits_alter_statements() {
        let table = clients();
        let (mut layout, _) = TargetLayout::plan(&table, "clients", Vocabulary::Postgres);
        let change = joined_change(&table, CanonicalType::TEXT);
        let widening = layout.widen(&table.name, &change).unwrap();
        let statements = alter_column_sql(SqlDialect::Postgres, &layout, &widening);
        assert_eq!(
            statements,
            vec![
                "ALTER TABLE \"clients\" ALTER COLUMN \"joined\" TYPE TEXT USING \"joined\"::TEXT;",
                "ALTER TABLE \"clients\" ALTER COLUMN \"joined\" DROP NOT NULL;",
            ]
        );
        assert_eq!(layout.columns[2].native, "TEXT");
    }

    #[test]
    fn mysql_alter_runs_between_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.sql");
        let table = clients();
        let mut writer = Box::new(SqlScriptWriter::create(&path, SqlDialect::Mysql, 10).unwrap());
        writer.begin_table(&table).unwrap();
        let warnings = writer
            .alter_column(&table, &joined_change(&table, CanonicalType::TEXT))
            .unwrap();
        assert!(warnings.is_empty());
        writer.finish_table().unwrap();
        writer.close().unwrap();

        let script = fs::read_to_string(&path).unwrap();
        assert!(script.contains(
            "START TRANSACTION;\nCOMMIT;\nALTER TABLE `clients` MODIFY COLUMN `joined` LONGTEXT NULL;\nSTART TRANSACTION;\nCOMMIT;"
        ));
    }

    #[test]
    fn widening_into_a_wide_decimal_warns_on_sqlite_scripts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.sql");
        let table = clients();
        let mut writer = SqlScriptWriter::create(&path, SqlDialect::Sqlite, 10).unwrap();
        writer.begin_table(&table).unwrap();
        let wide = CanonicalType::Decimal(Some(crate::schema::DecimalSpec::new(20, 4)));
        let warnings = writer
            .alter_column(&table, &joined_change(&table, wide))
            .unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].code, crate::report::WarningCode::LossyType);
        assert_eq!(warnings[0].column.as_deref(), Some("joined"));
    }

    #[test]
    fn tables_without_columns_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.sql");
        let mut writer = Box::new(SqlScriptWriter::create(&path, SqlDialect::Mysql, 10).unwrap());
        let warnings = writer.begin_table(&Table::new("empty", Vec::new())).unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].code, crate::report::WarningCode::EmptyTable);
        writer.finish_table().unwrap();
        writer.begin_table(&clients()).unwrap();
        writer.finish_table().unwrap();
        let summary = writer.close().unwrap();
        assert_eq!(summary.tables, 2);

        let script = fs::read_to_string(&path).unwrap();
        assert!(script.contains("-- Table: empty (0 columns) skipped"));
        assert!(!script.contains("`empty`"));
        assert_eq!(script.matches("START TRANSACTION;").count(), 1);
        assert_eq!(script.matches("COMMIT;").count(), 1);
    }

    #[test]
    fn script_wraps_each_table_in_a_transaction_and_chunks_inserts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.sql");
        let mut writer = Box::new(SqlScriptWriter::create(&path, SqlDialect::Mysql, 2).unwrap());
        writer.begin_table(&clients()).unwrap();
        let date = NaiveDate::from_ymd_opt(2008, 3, 1).unwrap();
        let rows = (1..=3)
            .map(|i| {
                vec![
                    Some(Value::Integer(i)),
                    Some(Value::Text(format!("c{i}"))),
                    Some(Value::Date(date)),
                ]
            })
            .collect();
        let ack = writer
            .write_batch(&RowBatch { sequence: 0, rows })
            .unwrap();
        assert_eq!(ack.rows, 3);
        writer.finish_table().unwrap();
        let summary = writer.close().unwrap();
        assert_eq!(summary.rows_written, 3);

        let script = fs::read_to_string(&path).unwrap();
        assert!(script.contains("-- Table: clients (3 columns)"));
        assert!(script.contains("START TRANSACTION;"));
        assert_eq!(script.matches("INSERT INTO `clients`").count(), 2);
        assert!(script.contains("(3, 'c3', '2008-03-01')"));
        assert!(script.trim_end().ends_with("COMMIT;"));
    }

    #[test]
    fn aborted_table_is_rolled_back_in_script() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.sql");
        let mut writer = SqlScriptWriter::create(&path, SqlDialect::Sqlite, 10).unwrap();
        writer.begin_table(&clients()).unwrap();
        writer.abort_table();
        let script = fs::read_to_string(&path).unwrap();
        assert!(script.contains("BEGIN;\nROLLBACK;"));
    }
}
