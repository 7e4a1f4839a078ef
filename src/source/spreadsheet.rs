//! Spreadsheet source: every sheet is a table, in workbook order. Empty
//! sheets are kept as zero-row tables.

use std::path::{Path, PathBuf};

use calamine::{Data, Range, Reader, open_workbook_auto};
use chrono::NaiveTime;
use log::{debug, info};

use super::{RecordStream, SourceKind, SourceReader, SourceTable, unknown_table};
use crate::{
    error::{ConvertError, Result},
    io_utils,
    rows::{RawRow, SourceRecord},
    schema::clean_column_names,
};

pub struct SpreadsheetReader {
    path: PathBuf,
    /// Sheet names, index-aligned with `tables`.
    sheets: Vec<String>,
    tables: Vec<SourceTable>,
}

fn workbook_error(path: &Path, err: impl std::fmt::Display) -> ConvertError {
    ConvertError::SourceUnavailable(format!("{}: {err}", io_utils::display_path(path)))
}

fn load_range(path: &Path, sheet: &str) -> Result<Range<Data>> {
    let mut workbook = open_workbook_auto(path).map_err(|err| workbook_error(path, err))?;
    workbook
        .worksheet_range(sheet)
        .map_err(|err| workbook_error(path, err))
}

/// Renders one cell as source text; error cells make the whole row malformed.
fn cell_text(cell: &Data) -> std::result::Result<Option<String>, String> {
    let text = match cell {
        Data::Empty => return Ok(None),
        Data::String(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => format!("{f:.0}"),
        Data::Float(f) => f.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(value) if value.time() == NaiveTime::MIN => value.format("%Y-%m-%d").to_string(),
            Some(value) => value.format("%Y-%m-%d %H:%M:%S").to_string(),
            None => dt.as_f64().to_string(),
        },
        Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        Data::Error(err) => return Err(format!("cell error {err}")),
    };
    Ok(Some(text))
}

fn row_record<'a>(line: u64, cells: impl Iterator<Item = &'a Data>) -> SourceRecord {
    match cells.map(cell_text).collect::<std::result::Result<RawRow, _>>() {
        Ok(values) => SourceRecord::Row { line, values },
        Err(reason) => SourceRecord::Malformed { line, reason },
    }
}

impl SpreadsheetReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut workbook = open_workbook_auto(path).map_err(|err| workbook_error(path, err))?;
        let sheets = workbook.sheet_names();
        info!("Opening workbook {path:?} with {} sheet(s)", sheets.len());

        let mut tables = Vec::with_capacity(sheets.len());
        for sheet in &sheets {
            let range = workbook
                .worksheet_range(sheet)
                .map_err(|err| workbook_error(path, err))?;
            let headers: Vec<String> = range
                .rows()
                .next()
                .map(|cells| {
                    cells
                        .iter()
                        .map(|cell| cell_text(cell).ok().flatten().unwrap_or_default())
                        .collect()
                })
                .unwrap_or_default();
            let mut table = SourceTable::untyped(sheet.clone(), clean_column_names(&headers));
            table.row_count = Some(range.height().saturating_sub(1) as u64);
            debug!(
                "Sheet '{sheet}': {} column(s), {:?} row(s)",
                table.columns.len(),
                table.row_count
            );
            tables.push(table);
        }
        Ok(Self {
            path: path.to_path_buf(),
            sheets,
            tables,
        })
    }
}

/// Lazily walks the data rows of one loaded sheet.
struct SheetRows {
    range: Range<Data>,
    next: usize,
}

impl Iterator for SheetRows {
    type Item = Result<SourceRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.range.height() {
            return None;
        }
        let row = self.next;
        let cells = (0..self.range.width()).filter_map(|col| self.range.get((row, col)));
        let record = row_record(row as u64, cells);
        self.next += 1;
        Some(Ok(record))
    }
}

impl SourceReader for SpreadsheetReader {
    fn kind(&self) -> SourceKind {
        SourceKind::Spreadsheet
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
        let range = load_range(&self.path, &self.sheets[index])?;
        Ok(Box::new(SheetRows { range, next: 1 }))
    }
}
