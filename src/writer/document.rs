//! Structured-document files, one per table: a JSON array of objects, or
//! one object per line for `.jsonl` / `.ndjson` destinations.

use std::path::{Path, PathBuf};

use log::info;
use serde_json::{Map, Value as Json};

use super::{WriteAck, Writer, WriterSummary};
use crate::{
    error::{ConvertError, Result},
    io_utils::{self, CommittedFile},
    naming,
    report::Warning,
    rows::RowBatch,
    schema::Table,
    typemap::{TargetLayout, Vocabulary},
};

struct OpenDocument {
    file: CommittedFile,
    layout: TargetLayout,
    rows: u64,
}

pub struct DocumentWriter {
    destination: PathBuf,
    single_table: bool,
    lines: bool,
    current: Option<OpenDocument>,
    rows_written: u64,
    tables: usize,
}

impl DocumentWriter {
    pub fn new(destination: &Path, single_table: bool) -> Self {
        let lines = destination
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("jsonl") || ext.eq_ignore_ascii_case("ndjson"));
        Self {
            destination: destination.to_path_buf(),
            single_table,
            lines,
            current: None,
            rows_written: 0,
            tables: 0,
        }
    }
}

fn write_error(path: &Path, err: impl std::fmt::Display) -> ConvertError {
    ConvertError::target(io_utils::display_path(path), err.to_string())
}

impl Writer for DocumentWriter {
    fn begin_table(&mut self, table: &Table) -> Result<Vec<Warning>> {
        let path = naming::per_table_path(&self.destination, &table.name, self.single_table);
        let (layout, warnings) = TargetLayout::plan(table, &table.name, Vocabulary::Json);
        info!("Writing table '{}' to {path:?}", table.name);
        let mut file = CommittedFile::create(&path)?;
        if !self.lines {
            file.commit(b"[")?;
        }
        self.current = Some(OpenDocument {
            file,
            layout,
            rows: 0,
        });
        Ok(warnings)
    }

    fn write_batch(&mut self, batch: &RowBatch) -> Result<WriteAck> {
        let lines = self.lines;
        let open = self
            .current
            .as_mut()
            .ok_or_else(|| write_error(&self.destination, "no table in progress"))?;
        let mut text = String::new();
        for row in &batch.rows {
            let object: Map<String, Json> = open
                .layout
                .columns
                .iter()
                .zip(open.layout.project(row))
                .map(|(column, cell)| (column.name.clone(), cell.map_or(Json::Null, |v| v.to_json())))
                .collect();
            let rendered = serde_json::to_string(&Json::Object(object))
                .map_err(|err| write_error(open.file.path(), err))?;
            if lines {
                text.push_str(&rendered);
                text.push('\n');
            } else {
                text.push_str(if open.rows == 0 { "\n  " } else { ",\n  " });
                text.push_str(&rendered);
            }
            open.rows += 1;
        }
        let path = open.file.path().to_path_buf();
        if let Err(err) = open.file.commit(text.as_bytes()) {
            open.rows -= batch.len() as u64;
            return Err(write_error(&path, err));
        }
        self.rows_written += batch.len() as u64;
        Ok(WriteAck {
            rows: batch.len() as u64,
        })
    }

    fn finish_table(&mut self) -> Result<Vec<Warning>> {
        if let Some(mut open) = self.current.take() {
            if !self.lines {
                let tail: &[u8] = if open.rows == 0 { b"]\n" } else { b"\n]\n" };
                open.file.commit(tail)?;
            }
            open.file.sync()?;
            self.tables += 1;
        }
        Ok(Vec::new())
    }

    fn abort_table(&mut self) {
        if let Some(mut open) = self.current.take() {
            let _ = open.file.rollback();
        }
    }

    fn close(self: Box<Self>) -> Result<WriterSummary> {
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
        data::Value,
        schema::{CanonicalType, Column, DecimalSpec},
    };
    use rust_decimal::Decimal;
    use std::{fs, str::FromStr};

    fn table() -> Table {
        Table::new(
            "prices",
            vec![
                Column::inferred("sku", CanonicalType::TEXT, false),
                Column::inferred(
                    "price",
                    CanonicalType::Decimal(Some(DecimalSpec::new(6, 2))),
                    true,
                ),
            ],
        )
    }

    fn batch() -> RowBatch {
        RowBatch {
            sequence: 0,
            rows: vec![
                vec![
                    Some(Value::Text("A-1".into())),
                    Some(Value::Decimal(Decimal::from_str("12.50").unwrap())),
                ],
                vec![Some(Value::Text("B-2".into())), None],
            ],
        }
    }

    #[test]
    fn json_array_is_closed_on_finish() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prices.json");
        let mut writer = DocumentWriter::new(&path, true);
        writer.begin_table(&table()).unwrap();
        writer.write_batch(&batch()).unwrap();
        writer.finish_table().unwrap();

        let parsed: Json = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(
            parsed,
            serde_json::json!([
                {"sku": "A-1", "price": 12.5},
                {"sku": "B-2", "price": null}
            ])
        );
    }

    #[test]
    fn json_lines_and_empty_tables() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = DocumentWriter::new(&dir.path().join("{table}.jsonl"), false);
        writer.begin_table(&table()).unwrap();
        writer.write_batch(&batch()).unwrap();
        writer.finish_table().unwrap();
        let written = fs::read_to_string(dir.path().join("prices.jsonl")).unwrap();
        assert_eq!(written.lines().count(), 2);

        let mut writer = DocumentWriter::new(&dir.path().join("empty.json"), true);
        writer.begin_table(&table()).unwrap();
        writer.finish_table().unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("empty.json")).unwrap(), "[]\n");
    }
}
