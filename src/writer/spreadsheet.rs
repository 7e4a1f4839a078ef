//! Spreadsheet workbook: one worksheet per table, saved when the writer is
//! closed. Tables taller than a worksheet continue on numbered sheets.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use log::{info, warn};
use rust_xlsxwriter::{Format, Workbook, Worksheet, XlsxError};

use super::{WriteAck, Writer, WriterSummary};
use crate::{
    data::Value,
    error::{ConvertError, Result},
    io_utils,
    naming,
    report::{Warning, WarningCode},
    rows::{ColumnChange, RowBatch},
    schema::Table,
    typemap::{SPREADSHEET_MAX_SAFE_INTEGER, SPREADSHEET_MAX_TEXT, TargetLayout, Vocabulary},
};

/// Data rows per worksheet, below the header row.
const MAX_DATA_ROWS: u32 = 1_048_575;

struct OpenSheet {
    source: String,
    base_name: String,
    layout: TargetLayout,
    sheet: Worksheet,
    next_row: u32,
    parts: u32,
}

pub struct SpreadsheetWriter {
    path: PathBuf,
    workbook: Workbook,
    taken: HashSet<String>,
    date_format: Format,
    datetime_format: Format,
    current: Option<OpenSheet>,
    pending: Vec<Warning>,
    rows_written: u64,
    tables: usize,
}

impl SpreadsheetWriter {
    pub fn new(path: &Path) -> Result<Self> {
        io_utils::ensure_parent_dir(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            workbook: Workbook::new(),
            taken: HashSet::new(),
            date_format: Format::new().set_num_format("yyyy-mm-dd"),
            datetime_format: Format::new().set_num_format("yyyy-mm-dd hh:mm:ss"),
            current: None,
            pending: Vec::new(),
            rows_written: 0,
            tables: 0,
        })
    }

    fn xlsx_error(&self, err: XlsxError) -> ConvertError {
        ConvertError::target(io_utils::display_path(&self.path), err.to_string())
    }

    /// A sheet name not used yet in this workbook.
    fn unique_sheet_name(&mut self, base: &str) -> String {
        let mut candidate = naming::sanitize_sheet_name(base);
        let mut n = 2;
        while self.taken.contains(&candidate.to_lowercase()) {
            let suffix = format!(" ({n})");
            let head: String = naming::sanitize_sheet_name(base)
                .chars()
                .take(31 - suffix.len())
                .collect();
            candidate = format!("{head}{suffix}");
            n += 1;
        }
        self.taken.insert(candidate.to_lowercase());
        candidate
    }

    fn new_sheet(&mut self, base: &str, layout: &TargetLayout) -> Result<Worksheet> {
        let name = self.unique_sheet_name(base);
        let mut sheet = Worksheet::new();
        sheet.set_name(&name).map_err(|err| self.xlsx_error(err))?;
        let bold = Format::new().set_bold();
        for (col, column) in layout.columns.iter().enumerate() {
            sheet
                .write_string_with_format(0, col as u16, &column.name, &bold)
                .map_err(|err| self.xlsx_error(err))?;
        }
        Ok(sheet)
    }

    fn write_cell(
        &self,
        sheet: &mut Worksheet,
        row: u32,
        col: u16,
        value: &Value,
    ) -> std::result::Result<bool, XlsxError> {
        let mut truncated = false;
        match value {
            Value::Integer(i) if i.unsigned_abs() <= SPREADSHEET_MAX_SAFE_INTEGER as u64 => {
                sheet.write_number(row, col, *i as f64)?;
            }
            Value::Float(f) => {
                sheet.write_number(row, col, *f)?;
            }
            Value::Decimal(d) => match d.normalize().to_string().parse::<f64>() {
                Ok(f) => {
                    sheet.write_number(row, col, f)?;
                }
                Err(_) => {
                    sheet.write_string(row, col, d.to_string())?;
                }
            },
            Value::Boolean(b) => {
                sheet.write_boolean(row, col, *b)?;
            }
            Value::Date(d) => {
                sheet.write_datetime_with_format(row, col, d, &self.date_format)?;
            }
            Value::DateTime(dt) => {
                sheet.write_datetime_with_format(row, col, dt, &self.datetime_format)?;
            }
            other => {
                let text = other.as_display();
                if text.chars().count() > SPREADSHEET_MAX_TEXT {
                    truncated = true;
                    let cut: String = text.chars().take(SPREADSHEET_MAX_TEXT).collect();
                    sheet.write_string(row, col, cut)?;
                } else {
                    sheet.write_string(row, col, text)?;
                }
            }
        }
        Ok(truncated)
    }

    fn flush_sheet(&mut self, open: OpenSheet) {
        self.workbook.push_worksheet(open.sheet);
    }
}

impl Writer for SpreadsheetWriter {
    fn begin_table(&mut self, table: &Table) -> Result<Vec<Warning>> {
        let (layout, warnings) = TargetLayout::plan(table, &table.name, Vocabulary::Spreadsheet);
        let sheet = self.new_sheet(&table.name, &layout)?;
        info!("Writing table '{}' to a worksheet of {:?}", table.name, self.path);
        self.current = Some(OpenSheet {
            source: table.name.clone(),
            base_name: table.name.clone(),
            layout,
            sheet,
            next_row: 1,
            parts: 1,
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
        let mut open = self.current.take().ok_or_else(|| {
            ConvertError::target(io_utils::display_path(&self.path), "no table in progress")
        })?;
        let mut truncated_columns: HashSet<usize> = HashSet::new();
        let mut result = Ok(());
        for row in &batch.rows {
            if open.next_row > MAX_DATA_ROWS {
                open.parts += 1;
                let continuation = format!("{} ({})", open.base_name, open.parts);
                warn!("Worksheet for '{}' is full; continuing on a new sheet", open.source);
                self.pending.push(Warning::new(
                    &open.source,
                    WarningCode::TargetCapacityExceeded,
                    format!("rows beyond {MAX_DATA_ROWS} continue on another worksheet"),
                ));
                let sheet = match self.new_sheet(&continuation, &open.layout) {
                    Ok(sheet) => sheet,
                    Err(err) => {
                        result = Err(err);
                        break;
                    }
                };
                let full = std::mem::replace(&mut open.sheet, sheet);
                self.workbook.push_worksheet(full);
                open.next_row = 1;
            }
            for (col, cell) in open.layout.project(row).iter().enumerate() {
                let Some(value) = cell else { continue };
                match self.write_cell(&mut open.sheet, open.next_row, col as u16, value) {
                    Ok(true) => {
                        truncated_columns.insert(col);
                    }
                    Ok(false) => {}
                    Err(err) => {
                        result = Err(self.xlsx_error(err));
                        break;
                    }
                }
            }
            open.next_row += 1;
        }
        for col in truncated_columns {
            let column = open.layout.columns[col].name.clone();
            self.pending.push(
                Warning::new(
                    &open.source,
                    WarningCode::TargetCapacityExceeded,
                    format!("text longer than {SPREADSHEET_MAX_TEXT} characters was truncated"),
                )
                .on_column(column),
            );
        }
        self.current = Some(open);
        result?;
        self.rows_written += batch.len() as u64;
        Ok(WriteAck {
            rows: batch.len() as u64,
        })
    }

    fn finish_table(&mut self) -> Result<Vec<Warning>> {
        if let Some(open) = self.current.take() {
            self.flush_sheet(open);
            self.tables += 1;
        }
        Ok(std::mem::take(&mut self.pending))
    }

    fn abort_table(&mut self) {
        // The partial sheet is kept so earlier batches still reach the file.
        if let Some(open) = self.current.take() {
            self.flush_sheet(open);
        }
    }

    fn close(mut self: Box<Self>) -> Result<WriterSummary> {
        if let Some(open) = self.current.take() {
            self.flush_sheet(open);
        }
        if self.workbook.worksheets().is_empty() {
            self.workbook.add_worksheet();
        }
        let path = self.path.clone();
        self.workbook
            .save(&path)
            .map_err(|err| self.xlsx_error(err))?;
        Ok(WriterSummary {
            rows_written: self.rows_written,
            tables: self.tables,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CanonicalType, Column};
    use calamine::{Data, Reader, open_workbook_auto};
    use chrono::NaiveDate;

    #[test]
    fn tables_become_sheets_readable_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.xlsx");
        let mut writer = Box::new(SpreadsheetWriter::new(&path).unwrap());
        let table = Table::new(
            "Q1/Q2",
            vec![
                Column::inferred("id", CanonicalType::INT64, false),
                Column::inferred("day", CanonicalType::Date, false),
            ],
        );
        writer.begin_table(&table).unwrap();
        writer
            .write_batch(&RowBatch {
                sequence: 0,
                rows: vec![vec![
                    Some(Value::Integer(1 << 60)),
                    Some(Value::Date(NaiveDate::from_ymd_opt(2009, 7, 4).unwrap())),
                ]],
            })
            .unwrap();
        writer.finish_table().unwrap();
        writer.close().unwrap();

        let mut workbook = open_workbook_auto(&path).unwrap();
        assert_eq!(workbook.sheet_names(), vec!["Q1_Q2".to_string()]);
        let range = workbook.worksheet_range("Q1_Q2").unwrap();
        assert_eq!(
            range.get((1, 0)),
            Some(&Data::String((1i64 << 60).to_string()))
        );
    }

    #[test]
    fn widening_to_wide_integers_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SpreadsheetWriter::new(&dir.path().join("x.xlsx")).unwrap();
        let table = Table::new(
            "orders",
            vec![Column::inferred("id", CanonicalType::INT32, false)],
        );
        assert!(writer.begin_table(&table).unwrap().is_empty());
        let mut after = table.columns[0].clone();
        after.ty = CanonicalType::INT64;
        let change = ColumnChange {
            index: 0,
            before: table.columns[0].clone(),
            after,
        };
        let warnings = writer.alter_column(&table, &change).unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].code, WarningCode::LossyType);
        assert_eq!(warnings[0].column.as_deref(), Some("id"));
    }

    #[test]
    fn sheet_names_stay_unique() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SpreadsheetWriter::new(&dir.path().join("x.xlsx")).unwrap();
        assert_eq!(writer.unique_sheet_name("data"), "data");
        assert_eq!(writer.unique_sheet_name("DATA"), "DATA (2)");
    }
}
