//! Source readers.
//!
//! Every source kind implements [`SourceReader`]: table discovery happens once
//! when the reader is opened, and [`SourceReader::stream`] hands out a fresh,
//! forward-only record stream for one table each time it is called. Streams
//! can only be restarted from the first row.

pub mod access;
pub mod delimited;
pub mod document;
pub mod spreadsheet;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    config::EngineConfig,
    error::{ConvertError, Result},
    io_utils,
    report::Warning,
    rows::SourceRecord,
    schema::{CanonicalType, ColumnOverrides},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    #[serde(alias = "access", alias = "mdb")]
    LegacyDatabase,
    #[serde(alias = "csv", alias = "tsv")]
    Delimited,
    #[serde(alias = "excel", alias = "xlsx")]
    Spreadsheet,
    #[serde(alias = "json", alias = "jsonl")]
    Document,
}

impl SourceKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "mdb" | "accdb" => Some(SourceKind::LegacyDatabase),
            "csv" | "tsv" | "txt" => Some(SourceKind::Delimited),
            "xlsx" | "xlsm" | "xlsb" | "xls" | "ods" => Some(SourceKind::Spreadsheet),
            "json" | "jsonl" | "ndjson" => Some(SourceKind::Document),
            _ => None,
        }
    }
}

impl std::str::FromStr for SourceKind {
    type Err = ConvertError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "legacy_database" | "access" | "mdb" => Ok(SourceKind::LegacyDatabase),
            "delimited" | "csv" | "tsv" => Ok(SourceKind::Delimited),
            "spreadsheet" | "excel" | "xlsx" => Ok(SourceKind::Spreadsheet),
            "document" | "json" | "jsonl" => Ok(SourceKind::Document),
            other => Err(ConvertError::Config(format!("unknown source kind '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceOptions {
    /// Rows examined by schema inference; `None` reads every row.
    pub sample_rows: Option<usize>,
    /// Fail the job on the first malformed row instead of skipping it.
    pub strict: bool,
    /// Manual text encoding label, bypassing detection.
    pub encoding: Option<String>,
    #[serde(with = "delimiter_serde")]
    pub delimiter: Option<u8>,
    /// Restrict the dataset to these tables.
    pub tables: Vec<String>,
    /// Tables processed first, in this order (e.g. foreign-key order).
    pub table_order: Vec<String>,
    pub columns: ColumnOverrides,
    pub primary_key: Vec<String>,
}

mod delimiter_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<u8>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(byte) => serializer.serialize_str(&(*byte as char).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u8>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        raw.map(|value| crate::cli::parse_delimiter(&value).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceDescriptor {
    #[serde(default)]
    pub kind: Option<SourceKind>,
    pub path: PathBuf,
    #[serde(default)]
    pub options: SourceOptions,
}

impl SourceDescriptor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: None,
            path: path.into(),
            options: SourceOptions::default(),
        }
    }

    pub fn resolved_kind(&self) -> Result<SourceKind> {
        self.kind
            .or_else(|| SourceKind::from_path(&self.path))
            .ok_or_else(|| {
                ConvertError::Validation(format!(
                    "cannot tell the source kind of {}; pass it explicitly",
                    io_utils::display_path(&self.path)
                ))
            })
    }

    /// Name used for `{source}` in naming templates.
    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "source".to_string())
    }
}

/// A column type the source itself declares.
#[derive(Debug, Clone, PartialEq)]
pub struct DeclaredType {
    pub ty: CanonicalType,
    pub source_type: String,
}

/// One discovered table.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceTable {
    pub name: String,
    /// Cleaned, unique column names in source order.
    pub columns: Vec<String>,
    pub declared: Vec<Option<DeclaredType>>,
    pub row_count: Option<u64>,
    pub primary_key: Vec<String>,
    /// Mapping problems found during discovery.
    pub warnings: Vec<Warning>,
}

impl SourceTable {
    pub fn untyped(name: impl Into<String>, columns: Vec<String>) -> Self {
        let declared = vec![None; columns.len()];
        Self {
            name: name.into(),
            columns,
            declared,
            row_count: None,
            primary_key: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

pub type RecordStream<'a> = Box<dyn Iterator<Item = Result<SourceRecord>> + 'a>;

pub trait SourceReader {
    fn kind(&self) -> SourceKind;

    fn identity(&self) -> String;

    /// Tables in discovery order.
    fn tables(&self) -> &[SourceTable];

    /// Opens a new stream over `table`, starting at its first row.
    fn stream(&self, table: &str) -> Result<RecordStream<'_>>;

    fn table(&self, name: &str) -> Option<&SourceTable> {
        self.tables().iter().find(|t| t.name == name)
    }
}

pub(crate) fn unknown_table(table: &str) -> ConvertError {
    ConvertError::Validation(format!("unknown table '{table}'"))
}

/// Validates the source file and opens the reader for its kind.
pub fn open_reader(
    descriptor: &SourceDescriptor,
    config: &EngineConfig,
) -> Result<Box<dyn SourceReader>> {
    let kind = descriptor.resolved_kind()?;
    io_utils::validate_source_file(&descriptor.path, config.max_file_size_bytes())?;
    let reader: Box<dyn SourceReader> = match kind {
        SourceKind::Delimited => Box::new(delimited::DelimitedReader::open(
            &descriptor.path,
            &descriptor.options,
        )?),
        SourceKind::Spreadsheet => {
            Box::new(spreadsheet::SpreadsheetReader::open(&descriptor.path)?)
        }
        SourceKind::Document => Box::new(document::DocumentReader::open(&descriptor.path)?),
        SourceKind::LegacyDatabase => Box::new(access::AccessReader::open(
            &descriptor.path,
            config.mdbtools_dir.as_deref(),
        )?),
    };
    Ok(reader)
}
