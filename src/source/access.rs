//! Legacy desktop-database source (`.mdb` / `.accdb`) read through the
//! mdbtools command-line programs.
//!
//! Tables come from `mdb-tables`, column type tags and the primary key from
//! `mdb-schema`, and rows from `mdb-export`, streamed straight off the child
//! process's stdout. System (`MSys*`) and temporary (`~*`) tables are skipped.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    process::{Child, ChildStdout, Command, Output, Stdio},
    sync::OnceLock,
};

use log::{debug, info, warn};
use regex::Regex;

use super::{DeclaredType, RecordStream, SourceKind, SourceReader, SourceTable, unknown_table};
use crate::{
    error::{ConvertError, Result},
    io_utils,
    report::{Warning, WarningCode},
    rows::SourceRecord,
    schema::clean_column_names,
    typemap,
};

const EXPORT_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub struct AccessReader {
    path: PathBuf,
    tools_dir: Option<PathBuf>,
    tables: Vec<SourceTable>,
}

/// Column definitions and key parsed from `mdb-schema` output.
#[derive(Debug, Default, PartialEq)]
pub struct ParsedSchema {
    pub columns: Vec<(String, String)>,
    pub primary_key: Vec<String>,
}

fn column_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*\[([^\]]+)\]\s+(.+?)\s*,?\s*$").expect("valid pattern")
    })
}

fn primary_key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)CREATE\s+UNIQUE\s+INDEX\s+\[PrimaryKey\]\s+ON\s+\[[^\]]+\]\s*\(([^)]*)\)")
            .expect("valid pattern")
    })
}

pub fn parse_schema(output: &str) -> ParsedSchema {
    let mut parsed = ParsedSchema::default();
    let mut in_table = false;
    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("CREATE TABLE") {
            in_table = true;
            continue;
        }
        if in_table && trimmed.starts_with(");") {
            in_table = false;
            continue;
        }
        if in_table && let Some(caps) = column_pattern().captures(line) {
            parsed.columns.push((caps[1].to_string(), caps[2].to_string()));
        }
    }
    if let Some(caps) = primary_key_pattern().captures(output) {
        parsed.primary_key = caps[1]
            .split(',')
            .map(|part| part.trim().trim_matches(['[', ']']).to_string())
            .filter(|part| !part.is_empty())
            .collect();
    }
    parsed
}

fn is_user_table(name: &str) -> bool {
    !name.is_empty() && !name.starts_with("MSys") && !name.starts_with('~')
}

impl AccessReader {
    pub fn open(path: &Path, tools_dir: Option<&Path>) -> Result<Self> {
        let mut reader = Self {
            path: path.to_path_buf(),
            tools_dir: tools_dir.map(Path::to_path_buf),
            tables: Vec::new(),
        };
        let listing = reader.run(reader.command("mdb-tables").arg("-1").arg(path))?;
        let names: Vec<String> = listing
            .lines()
            .map(str::trim)
            .filter(|name| is_user_table(name))
            .map(str::to_string)
            .collect();
        info!("Legacy database {path:?} has {} user table(s)", names.len());

        for name in names {
            let table = reader.discover(&name)?;
            reader.tables.push(table);
        }
        Ok(reader)
    }

    fn command(&self, program: &str) -> Command {
        match &self.tools_dir {
            Some(dir) => Command::new(dir.join(program)),
            None => Command::new(program),
        }
    }

    fn spawn_error(&self, program: &str, err: std::io::Error) -> ConvertError {
        if err.kind() == ErrorKind::NotFound {
            ConvertError::SourceUnavailable(format!(
                "{program} not found; install mdbtools or set LEGACY_CONVERT_MDBTOOLS_DIR"
            ))
        } else {
            ConvertError::SourceUnavailable(format!("cannot run {program}: {err}"))
        }
    }

    fn run(&self, command: &mut Command) -> Result<String> {
        let program = command.get_program().to_string_lossy().into_owned();
        let Output {
            status,
            stdout,
            stderr,
        } = command
            .output()
            .map_err(|err| self.spawn_error(&program, err))?;
        if !status.success() {
            return Err(ConvertError::SourceUnavailable(format!(
                "{program} failed on {}: {}",
                io_utils::display_path(&self.path),
                String::from_utf8_lossy(&stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }

    fn discover(&self, table: &str) -> Result<SourceTable> {
        let schema_text = self.run(
            self.command("mdb-schema")
                .arg("-T")
                .arg(table)
                .arg(&self.path),
        )?;
        let parsed = parse_schema(&schema_text);
        debug!("Table '{table}': {:?}", parsed.columns);

        if parsed.columns.is_empty() {
            warn!("No column types found for '{table}'; falling back to the export header");
            let header = self.export_header(table)?;
            return Ok(SourceTable::untyped(table, clean_column_names(&header)));
        }

        let raw_names: Vec<String> = parsed.columns.iter().map(|(name, _)| name.clone()).collect();
        let columns = clean_column_names(&raw_names);
        let mut warnings = Vec::new();
        let declared = parsed
            .columns
            .iter()
            .zip(&columns)
            .map(|((_, tag), column)| {
                let mapping = typemap::access_to_canonical(tag);
                if let Some(message) = mapping.warning {
                    warnings.push(
                        Warning::new(table, WarningCode::UnknownSourceType, message).on_column(column),
                    );
                }
                Some(DeclaredType {
                    ty: mapping.ty,
                    source_type: tag.clone(),
                })
            })
            .collect();
        let primary_key = parsed
            .primary_key
            .iter()
            .filter_map(|key| raw_names.iter().position(|n| n == key).map(|i| columns[i].clone()))
            .collect();
        Ok(SourceTable {
            name: table.to_string(),
            columns,
            declared,
            row_count: None,
            primary_key,
            warnings,
        })
    }

    fn export_command(&self, table: &str) -> Command {
        let mut command = self.command("mdb-export");
        command
            .arg("-D")
            .arg(EXPORT_DATE_FORMAT)
            .arg("-b")
            .arg("hex")
            .arg(&self.path)
            .arg(table);
        command
    }

    fn spawn_export(&self, table: &str) -> Result<(Child, ChildStdout)> {
        let mut child = self
            .export_command(table)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| self.spawn_error("mdb-export", err))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ConvertError::SourceUnavailable("mdb-export has no stdout".into()))?;
        Ok((child, stdout))
    }

    fn export_header(&self, table: &str) -> Result<Vec<String>> {
        let (child, stdout) = self.spawn_export(table)?;
        let _guard = ExportGuard(child);
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(stdout);
        Ok(reader.headers()?.iter().map(str::to_string).collect())
    }
}

/// Kills and reaps the export process when the stream is dropped early.
struct ExportGuard(Child);

impl Drop for ExportGuard {
    fn drop(&mut self) {
        if let Ok(None) = self.0.try_wait() {
            let _ = self.0.kill();
        }
        let _ = self.0.wait();
    }
}

struct ExportStream {
    guard: ExportGuard,
    records: csv::StringRecordsIntoIter<ChildStdout>,
    width: usize,
    line: u64,
    done: bool,
}

impl Iterator for ExportStream {
    type Item = Result<SourceRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.records.next() {
            Some(Ok(record)) => {
                self.line += 1;
                let item = if record.len() == self.width {
                    SourceRecord::Row {
                        line: self.line,
                        values: record
                            .iter()
                            .map(|field| (!field.is_empty()).then(|| field.to_string()))
                            .collect(),
                    }
                } else {
                    SourceRecord::Malformed {
                        line: self.line,
                        reason: format!("expected {} fields, found {}", self.width, record.len()),
                    }
                };
                Some(Ok(item))
            }
            Some(Err(err)) if err.is_io_error() => {
                self.done = true;
                Some(Err(ConvertError::from(err)))
            }
            Some(Err(err)) => {
                self.line += 1;
                Some(Ok(SourceRecord::Malformed {
                    line: self.line,
                    reason: err.to_string(),
                }))
            }
            None => {
                self.done = true;
                match self.guard.0.wait() {
                    Ok(status) if status.success() => None,
                    Ok(status) => Some(Err(ConvertError::SourceUnavailable(format!(
                        "mdb-export exited with {status}"
                    )))),
                    Err(err) => Some(Err(ConvertError::Io(err))),
                }
            }
        }
    }
}

impl SourceReader for AccessReader {
    fn kind(&self) -> SourceKind {
        SourceKind::LegacyDatabase
    }

    fn identity(&self) -> String {
        io_utils::display_path(&self.path)
    }

    fn tables(&self) -> &[SourceTable] {
        &self.tables
    }

    fn stream(&self, table: &str) -> Result<RecordStream<'_>> {
        let source = self.table(table).ok_or_else(|| unknown_table(table))?;
        let (child, stdout) = self.spawn_export(table)?;
        let reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(stdout);
        Ok(Box::new(ExportStream {
            guard: ExportGuard(child),
            records: reader.into_records(),
            width: source.columns.len(),
            line: 0,
            done: false,
        }))
    }
}
