//! Structured-document source (JSON and JSON Lines).
//!
//! Supported JSON shapes:
//! - an array of objects, or of scalars (single `value` column);
//! - an object whose values are record arrays, giving one table per key;
//! - a column-oriented object of equal-length scalar arrays;
//! - a single object, giving a one-row table.
//!
//! JSON Lines files are scanned once for their key set and then streamed
//! line by line. Nested values are carried as JSON text.

use std::{
    io::BufRead,
    path::{Path, PathBuf},
};

use log::{debug, info};
use serde_json::{Map, Value as Json};

use super::{RecordStream, SourceKind, SourceReader, SourceTable, unknown_table};
use crate::{
    error::{ConvertError, Result},
    io_utils,
    rows::{RawRow, SourceRecord},
    schema::clean_column_names,
};

const SCALAR_COLUMN: &str = "value";

enum Layout {
    /// Rows parsed up front, index-aligned with the reader's tables.
    Materialized(Vec<Vec<SourceRecord>>),
    /// One object per line, read lazily on every stream.
    Lines { keys: Vec<String> },
}

pub struct DocumentReader {
    path: PathBuf,
    layout: Layout,
    tables: Vec<SourceTable>,
}

fn is_lines_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("jsonl") || ext.eq_ignore_ascii_case("ndjson"))
}

fn cell_text(value: &Json) -> Option<String> {
    match value {
        Json::Null => None,
        Json::String(s) => Some(s.clone()),
        Json::Bool(b) => Some(b.to_string()),
        Json::Number(n) => Some(n.to_string()),
        nested => Some(nested.to_string()),
    }
}

/// Keys in first-seen order across all records.
fn collect_keys<'a>(records: impl Iterator<Item = &'a Map<String, Json>>) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    for record in records {
        for key in record.keys() {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
    }
    keys
}

fn object_row(record: &Map<String, Json>, keys: &[String]) -> RawRow {
    keys.iter()
        .map(|key| record.get(key).and_then(cell_text))
        .collect()
}

fn validation(path: &Path, message: &str) -> ConvertError {
    ConvertError::Validation(format!("{}: {message}", io_utils::display_path(path)))
}

/// Builds one table from a JSON array.
fn array_table(name: &str, items: &[Json]) -> (SourceTable, Vec<SourceRecord>) {
    let all_objects = items.iter().all(Json::is_object);
    if all_objects && !items.is_empty() {
        let objects: Vec<&Map<String, Json>> = items.iter().filter_map(Json::as_object).collect();
        let keys = collect_keys(objects.iter().copied());
        let rows = objects
            .iter()
            .zip(1u64..)
            .map(|(record, line)| SourceRecord::Row {
                line,
                values: object_row(record, &keys),
            })
            .collect::<Vec<_>>();
        let mut table = SourceTable::untyped(name, clean_column_names(&keys));
        table.row_count = Some(rows.len() as u64);
        return (table, rows);
    }
    let rows = items
        .iter()
        .zip(1u64..)
        .map(|(item, line)| SourceRecord::Row {
            line,
            values: vec![cell_text(item)],
        })
        .collect::<Vec<_>>();
    let columns = if items.is_empty() {
        Vec::new()
    } else {
        vec![SCALAR_COLUMN.to_string()]
    };
    let mut table = SourceTable::untyped(name, columns);
    table.row_count = Some(rows.len() as u64);
    (table, rows)
}

fn columnar_table(name: &str, object: &Map<String, Json>) -> Option<(SourceTable, Vec<SourceRecord>)> {
    let columns: Vec<&Vec<Json>> = object.values().map(Json::as_array).collect::<Option<_>>()?;
    let height = columns.first().map_or(0, |c| c.len());
    if columns
        .iter()
        .any(|c| c.len() != height || c.iter().any(|v| v.is_object() || v.is_array()))
    {
        return None;
    }
    let keys: Vec<String> = object.keys().cloned().collect();
    let rows = (0..height)
        .map(|idx| SourceRecord::Row {
            line: idx as u64 + 1,
            values: columns.iter().map(|c| cell_text(&c[idx])).collect(),
        })
        .collect::<Vec<_>>();
    let mut table = SourceTable::untyped(name, clean_column_names(&keys));
    table.row_count = Some(height as u64);
    Some((table, rows))
}

impl DocumentReader {
    pub fn open(path: &Path) -> Result<Self> {
        let stem = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());

        if is_lines_path(path) {
            let mut objects = Vec::new();
            let mut count = 0u64;
            for line in io_utils::open_source(path)?.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                count += 1;
                if let Ok(Json::Object(record)) = serde_json::from_str::<Json>(&line) {
                    objects.push(record.keys().cloned().collect::<Vec<_>>());
                }
            }
            let mut keys: Vec<String> = Vec::new();
            for key in objects.into_iter().flatten() {
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
            info!("Opening JSON Lines source {path:?}: {count} line(s), {} key(s)", keys.len());
            let mut table = SourceTable::untyped(stem, clean_column_names(&keys));
            table.row_count = Some(count);
            return Ok(Self {
                path: path.to_path_buf(),
                layout: Layout::Lines { keys },
                tables: vec![table],
            });
        }

        let document: Json = serde_json::from_reader(io_utils::open_source(path)?)
            .map_err(|err| validation(path, &format!("invalid JSON: {err}")))?;
        let parts: Vec<(SourceTable, Vec<SourceRecord>)> = match &document {
            Json::Array(items) => vec![array_table(&stem, items)],
            Json::Object(object)
                if !object.is_empty()
                    && object.values().all(Json::is_array)
                    && object
                        .values()
                        .filter_map(Json::as_array)
                        .any(|items| items.iter().any(Json::is_object)) =>
            {
                object
                    .iter()
                    .filter_map(|(key, value)| Some(array_table(key, value.as_array()?)))
                    .collect()
            }
            Json::Object(object) => match columnar_table(&stem, object) {
                Some(part) if !object.is_empty() => vec![part],
                _ => vec![array_table(&stem, std::slice::from_ref(&document))],
            },
            _ => return Err(validation(path, "top-level JSON value must be an array or object")),
        };
        info!("Opening JSON source {path:?} with {} table(s)", parts.len());
        let (tables, rows): (Vec<_>, Vec<_>) = parts.into_iter().unzip();
        Ok(Self {
            path: path.to_path_buf(),
            layout: Layout::Materialized(rows),
            tables,
        })
    }
}

impl SourceReader for DocumentReader {
    fn kind(&self) -> SourceKind {
        SourceKind::Document
    }

    fn identity(&self) -> String {
        io_utils::display_path(&self.path)
    }

    fn tables(&self) -> &[SourceTable] {
        &self.tables
    }

    fn stream(&self, table: &str) -> Result<RecordStream<'_>> {
        let index = self
            .tables
            .iter()
            .position(|t| t.name == table)
            .ok_or_else(|| unknown_table(table))?;
        match &self.layout {
            Layout::Materialized(rows) => Ok(Box::new(rows[index].iter().cloned().map(Ok))),
            Layout::Lines { keys } => {
                debug!("Streaming JSON Lines from {:?}", self.path);
                let lines = io_utils::open_source(&self.path)?.lines();
                let records = lines
                    .filter(|line| !line.as_ref().is_ok_and(|l| l.trim().is_empty()))
                    .zip(1u64..)
                    .map(move |(line, number)| {
                        let line = line?;
                        let record = match serde_json::from_str::<Json>(&line) {
                            Ok(Json::Object(record)) => SourceRecord::Row {
                                line: number,
                                values: object_row(&record, keys),
                            },
                            Ok(_) => SourceRecord::Malformed {
                                line: number,
                                reason: "line is not a JSON object".to_string(),
                            },
                            Err(err) => SourceRecord::Malformed {
                                line: number,
                                reason: format!("invalid JSON: {err}"),
                            },
                        };
                        Ok(record)
                    });
                Ok(Box::new(records))
            }
        }
    }
}
