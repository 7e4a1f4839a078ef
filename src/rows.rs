//! Row records, batching and typed row conversion.
//!
//! Sources yield [`SourceRecord`]s. A [`Batcher`] groups them into bounded
//! [`RawBatch`]es (row count and byte cap), and [`RowConverter`] turns each raw
//! batch into a typed [`RowBatch`] against the live table schema, widening
//! inferred columns in place and reporting declared-type violations as
//! malformed rows.

use chrono::NaiveTime;
use rust_decimal::{Decimal, prelude::ToPrimitive};

use crate::{
    data::{Value, parse_typed_value},
    error::{ConvertError, Result},
    schema::{CanonicalType, Column, ColumnOrigin, Table, detect_value_type},
};

pub type RawRow = Vec<Option<String>>;

/// One record as produced by a source; `line` is 1-based within the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRecord {
    Row { line: u64, values: RawRow },
    Malformed { line: u64, reason: String },
}

impl SourceRecord {
    pub fn line(&self) -> u64 {
        match self {
            SourceRecord::Row { line, .. } | SourceRecord::Malformed { line, .. } => *line,
        }
    }

    fn approx_bytes(&self) -> usize {
        match self {
            SourceRecord::Row { values, .. } => values
                .iter()
                .map(|v| v.as_ref().map_or(1, |s| s.len() + 1))
                .sum(),
            SourceRecord::Malformed { reason, .. } => reason.len(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RawBatch {
    pub records: Vec<SourceRecord>,
}

impl RawBatch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Groups a record stream into batches of at most `max_rows` records and,
/// past the first record, at most `max_bytes` of cell text.
pub struct Batcher<I> {
    inner: I,
    max_rows: usize,
    max_bytes: usize,
    failed: bool,
}

impl<I> Batcher<I>
where
    I: Iterator<Item = Result<SourceRecord>>,
{
    pub fn new(inner: I, max_rows: usize, max_bytes: usize) -> Self {
        Self {
            inner,
            max_rows: max_rows.max(1),
            max_bytes: max_bytes.max(1),
            failed: false,
        }
    }
}

impl<I> Iterator for Batcher<I>
where
    I: Iterator<Item = Result<SourceRecord>>,
{
    type Item = Result<RawBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let mut batch = RawBatch::default();
        let mut bytes = 0usize;
        while batch.records.len() < self.max_rows {
            match self.inner.next() {
                Some(Ok(record)) => {
                    bytes += record.approx_bytes();
                    batch.records.push(record);
                    if bytes >= self.max_bytes {
                        break;
                    }
                }
                Some(Err(err)) => {
                    self.failed = true;
                    return Some(Err(err));
                }
                None => break,
            }
        }
        (!batch.is_empty()).then_some(Ok(batch))
    }
}

/// Typed rows aligned with the table's columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowBatch {
    pub sequence: u64,
    pub rows: Vec<Vec<Option<Value>>>,
}

impl RowBatch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A column definition changed while streaming.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnChange {
    pub index: usize,
    pub before: Column,
    pub after: Column,
}

#[derive(Debug)]
pub struct Converted {
    pub batch: RowBatch,
    /// Rows that were skipped, as `MalformedRow` errors.
    pub skipped: Vec<ConvertError>,
    pub changes: Vec<ColumnChange>,
}

/// Converts raw batches against a live table schema.
#[derive(Debug, Clone, Copy, Default)]
pub struct RowConverter;

impl RowConverter {
    pub fn convert(&self, table: &mut Table, raw: RawBatch, sequence: u64) -> Converted {
        let mut rows = Vec::with_capacity(raw.len());
        let mut skipped = Vec::new();
        let mut changes: Vec<ColumnChange> = Vec::new();

        for record in raw.records {
            let (line, values) = match record {
                SourceRecord::Row { line, values } => (line, values),
                SourceRecord::Malformed { line, reason } => {
                    skipped.push(malformed(table, line, None, reason));
                    continue;
                }
            };
            if values.len() != table.columns.len() {
                let reason = format!(
                    "expected {} fields, found {}",
                    table.columns.len(),
                    values.len()
                );
                skipped.push(malformed(table, line, None, reason));
                continue;
            }
            match convert_row(table, &values, &mut changes) {
                Ok(row) => rows.push(row),
                Err((column, reason)) => skipped.push(malformed(table, line, Some(column), reason)),
            }
        }

        if !changes.is_empty() {
            for change in &changes {
                let ty = &table.columns[change.index].ty;
                for row in &mut rows {
                    if let Some(cell) = row[change.index].take() {
                        row[change.index] = Some(coerce_value(cell, ty));
                    }
                }
            }
        }

        Converted {
            batch: RowBatch { sequence, rows },
            skipped,
            changes: collapse_changes(changes),
        }
    }
}

fn malformed(table: &Table, line: u64, column: Option<String>, message: String) -> ConvertError {
    ConvertError::MalformedRow {
        table: table.name.clone(),
        row: line,
        column,
        message,
    }
}

/// Converts one row, mutating inferred columns as needed. Declared columns
/// are never changed; a violation returns the column name and a reason.
fn convert_row(
    table: &mut Table,
    values: &[Option<String>],
    changes: &mut Vec<ColumnChange>,
) -> std::result::Result<Vec<Option<Value>>, (String, String)> {
    // Column changes are applied only once the whole row is accepted.
    let mut typed = Vec::with_capacity(values.len());
    let mut pending: Vec<(usize, Column)> = Vec::new();
    for (idx, column) in table.columns.iter().enumerate() {
        let raw = values[idx].as_deref();
        match parse_typed_value(raw, &column.ty) {
            Ok(None) if !column.nullable => {
                if column.nullable_origin == ColumnOrigin::Declared {
                    return Err((column.name.clone(), "null in a NOT NULL column".to_string()));
                }
                let mut after = column.clone();
                after.nullable = true;
                pending.push((idx, after));
                typed.push(None);
            }
            Ok(value) => typed.push(value),
            Err(err) if column.origin == ColumnOrigin::Declared => {
                return Err((
                    column.name.clone(),
                    format!("value '{}' is not a valid {}", err.value, err.expected),
                ));
            }
            Err(_) => {
                let raw = raw.unwrap_or_default();
                let mut after = column.clone();
                after.ty = column.ty.widen(&detect_value_type(raw));
                let value = match parse_typed_value(Some(raw), &after.ty) {
                    Ok(value) => value,
                    Err(_) => {
                        after.ty = CanonicalType::TEXT;
                        Some(Value::Text(raw.to_string()))
                    }
                };
                typed.push(value);
                pending.push((idx, after));
            }
        }
    }
    for (idx, after) in pending {
        let before = std::mem::replace(&mut table.columns[idx], after.clone());
        changes.push(ColumnChange {
            index: idx,
            before,
            after,
        });
    }
    Ok(typed)
}

/// Keeps one change per column: the first `before` and the last `after`.
fn collapse_changes(changes: Vec<ColumnChange>) -> Vec<ColumnChange> {
    let mut collapsed: Vec<ColumnChange> = Vec::new();
    for change in changes {
        match collapsed.iter_mut().find(|c| c.index == change.index) {
            Some(existing) => existing.after = change.after,
            None => collapsed.push(change),
        }
    }
    collapsed
}

/// Re-expresses a value under a wider column type.
pub fn coerce_value(value: Value, ty: &CanonicalType) -> Value {
    match (value, ty) {
        (Value::Text(s), CanonicalType::Text(_)) => Value::Text(s),
        (other, CanonicalType::Text(_)) => Value::Text(other.as_display()),
        (Value::Integer(i), CanonicalType::Decimal(None)) => Value::Float(i as f64),
        (Value::Decimal(d), CanonicalType::Decimal(None)) => {
            d.to_f64().map_or(Value::Decimal(d), Value::Float)
        }
        (Value::Integer(i), CanonicalType::Decimal(Some(_))) => Value::Decimal(Decimal::from(i)),
        (Value::Date(d), CanonicalType::DateTime) => Value::DateTime(d.and_time(NaiveTime::MIN)),
        (other, _) => other,
    }
}

/// Batch size to read with, given what is known about the table.
///
/// Tables with a known row count at or under `chunk_threshold` move as a
/// single batch; everything else is chunked at `batch_size`.
pub fn plan_batch_rows(row_count: Option<u64>, batch_size: usize, chunk_threshold: u64) -> usize {
    match row_count {
        Some(count) if count <= chunk_threshold => {
            usize::try_from(count).unwrap_or(usize::MAX).max(1)
        }
        _ => batch_size.max(1),
    }
}
