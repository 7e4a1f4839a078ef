//! Delimited-text source: one file, one table named after the file stem.

use std::{
    io::Read,
    path::{Path, PathBuf},
};

use encoding_rs::Encoding;
use log::{debug, info};

use super::{RecordStream, SourceKind, SourceOptions, SourceReader, SourceTable, unknown_table};
use crate::{
    error::{ConvertError, Result},
    io_utils,
    rows::SourceRecord,
    schema::clean_column_names,
};

pub struct DelimitedReader {
    path: PathBuf,
    delimiter: u8,
    encoding: &'static Encoding,
    tables: Vec<SourceTable>,
}

fn csv_reader<R: Read>(reader: R, delimiter: u8) -> csv::Reader<R> {
    csv::ReaderBuilder::new()
        .has_headers(false)
        .delimiter(delimiter)
        .double_quote(true)
        .flexible(true)
        .from_reader(reader)
}

impl DelimitedReader {
    pub fn open(path: &Path, options: &SourceOptions) -> Result<Self> {
        let encoding = match options.encoding.as_deref() {
            Some(label) => io_utils::resolve_encoding(label)?,
            None => io_utils::detect_encoding(path)?.encoding,
        };
        let delimiter = io_utils::resolve_input_delimiter(path, options.delimiter);
        info!(
            "Opening delimited source {path:?} (encoding {}, delimiter {:?})",
            encoding.name(),
            delimiter as char
        );

        let mut reader = csv_reader(io_utils::open_decoded(path, encoding)?, delimiter);
        let mut header = csv::StringRecord::new();
        let raw_headers: Vec<String> = if reader.read_record(&mut header)? {
            header.iter().map(str::to_string).collect()
        } else {
            Vec::new()
        };
        let columns = clean_column_names(&raw_headers);
        debug!("Header columns: {columns:?}");

        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "data".to_string());
        let mut table = SourceTable::untyped(name, columns);
        if raw_headers.is_empty() {
            table.row_count = Some(0);
        }
        Ok(Self {
            path: path.to_path_buf(),
            delimiter,
            encoding,
            tables: vec![table],
        })
    }
}

impl SourceReader for DelimitedReader {
    fn kind(&self) -> SourceKind {
        SourceKind::Delimited
    }

    fn identity(&self) -> String {
        io_utils::display_path(&self.path)
    }

    fn tables(&self) -> &[SourceTable] {
        &self.tables
    }

    fn stream(&self, table: &str) -> Result<RecordStream<'_>> {
        let source = self.table(table).ok_or_else(|| unknown_table(table))?;
        let width = source.columns.len();
        let reader = csv_reader(io_utils::open_decoded(&self.path, self.encoding)?, self.delimiter);
        let records = reader
            .into_records()
            .skip(1)
            .zip(1u64..)
            .map(move |(record, line)| match record {
                Ok(record) if record.len() == width => Ok(SourceRecord::Row {
                    line,
                    values: record
                        .iter()
                        .map(|field| (!field.is_empty()).then(|| field.to_string()))
                        .collect(),
                }),
                Ok(record) => Ok(SourceRecord::Malformed {
                    line,
                    reason: format!("expected {width} fields, found {}", record.len()),
                }),
                Err(err) if err.is_io_error() => Err(ConvertError::from(err)),
                Err(err) => Ok(SourceRecord::Malformed {
                    line,
                    reason: err.to_string(),
                }),
            });
        Ok(Box::new(records))
    }
}
