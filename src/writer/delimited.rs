//! Delimited-text files, one per table. Each batch is appended as a unit,
//! so a failure leaves the rows of every earlier batch and no partial row.

use std::path::{Path, PathBuf};

use log::{debug, info};

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

struct OpenFile {
    file: CommittedFile,
    layout: TargetLayout,
}

pub struct DelimitedWriter {
    destination: PathBuf,
    single_table: bool,
    current: Option<OpenFile>,
    rows_written: u64,
    tables: usize,
}

impl DelimitedWriter {
    pub fn new(destination: &Path, single_table: bool) -> Self {
        Self {
            destination: destination.to_path_buf(),
            single_table,
            current: None,
            rows_written: 0,
            tables: 0,
        }
    }

    fn encode(&self, path: &Path, rows: impl Iterator<Item = Vec<String>>) -> Result<Vec<u8>> {
        let delimiter = io_utils::resolve_input_delimiter(path, None);
        let mut writer = csv::WriterBuilder::new()
            .delimiter(delimiter)
            .from_writer(Vec::new());
        for row in rows {
            writer.write_record(&row)?;
        }
        writer
            .into_inner()
            .map_err(|err| ConvertError::target(io_utils::display_path(path), err.to_string()))
    }
}

fn open_error(path: &Path) -> ConvertError {
    ConvertError::target(io_utils::display_path(path), "no table in progress")
}

impl Writer for DelimitedWriter {
    fn begin_table(&mut self, table: &Table) -> Result<Vec<Warning>> {
        let path = naming::per_table_path(&self.destination, &table.name, self.single_table);
        let (layout, warnings) = TargetLayout::plan(table, &table.name, Vocabulary::Delimited);
        info!("Writing table '{}' to {path:?}", table.name);
        let mut file = CommittedFile::create(&path)?;
        let names = layout.columns.iter().map(|c| c.name.clone()).collect::<Vec<_>>();
        let header = self.encode(&path, std::iter::once(names))?;
        file.commit(&header)?;
        self.current = Some(OpenFile { file, layout });
        Ok(warnings)
    }

    fn write_batch(&mut self, batch: &RowBatch) -> Result<WriteAck> {
        let open = self.current.as_ref().ok_or_else(|| open_error(&self.destination))?;
        let path = open.file.path().to_path_buf();
        let encoded = self.encode(
            &path,
            batch.rows.iter().map(|row| {
                open.layout
                    .project(row)
                    .iter()
                    .map(|cell| cell.as_ref().map(|v| v.as_display()).unwrap_or_default())
                    .collect::<Vec<_>>()
            }),
        )?;
        let open = self.current.as_mut().ok_or_else(|| open_error(&path))?;
        open.file
            .commit(&encoded)
            .map_err(|err| ConvertError::target(io_utils::display_path(&path), err.to_string()))?;
        debug!("Appended batch {} to {path:?}", batch.sequence);
        self.rows_written += batch.len() as u64;
        Ok(WriteAck {
            rows: batch.len() as u64,
        })
    }

    fn finish_table(&mut self) -> Result<Vec<Warning>> {
        if let Some(mut open) = self.current.take() {
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
        schema::{CanonicalType, Column},
    };
    use std::fs;

    #[test]
    fn writes_one_file_per_table_with_headers() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = Box::new(DelimitedWriter::new(&dir.path().join("out.tsv"), false));
        let table = Table::new(
            "orders",
            vec![
                Column::inferred("id", CanonicalType::INT32, false),
                Column::inferred("note", CanonicalType::TEXT, true),
            ],
        );
        writer.begin_table(&table).unwrap();
        writer
            .write_batch(&RowBatch {
                sequence: 0,
                rows: vec![
                    vec![Some(Value::Integer(1)), Some(Value::Text("a\tb".into()))],
                    vec![Some(Value::Integer(2)), None],
                ],
            })
            .unwrap();
        writer.finish_table().unwrap();
        assert_eq!(writer.close().unwrap().rows_written, 2);

        let written = fs::read_to_string(dir.path().join("out_orders.tsv")).unwrap();
        assert_eq!(written, "id\tnote\n1\t\"a\tb\"\n2\t\n");
    }
}
