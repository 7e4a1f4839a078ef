//! Naming templates and identifier clean-up.
//!
//! Templates such as `at2-{year}` or `out/{source}_{table}.csv` are expanded
//! once per partition and table. Recognised placeholders are `{year}` and
//! `{partition}` (both the partition value), `{table}` and `{source}` (the
//! source file stem).

use std::path::{Path, PathBuf};

use crate::{
    data::{parse_naive_date, parse_naive_datetime},
    error::{ConvertError, Result},
};

/// Partition value used for rows whose partition column is empty.
pub const UNKNOWN_PARTITION: &str = "unknown";

const SHEET_NAME_MAX: usize = 31;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamingVars {
    pub source: String,
    pub table: Option<String>,
    pub partition: Option<String>,
}

impl NamingVars {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Self::default()
        }
    }

    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }
}

/// Expands every placeholder in `template`. Placeholders whose value is not
/// known yet (for example `{table}` while planning a whole job) are kept.
pub fn expand(template: &str, vars: &NamingVars) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after.find('}').ok_or_else(|| {
            ConvertError::Config(format!("unclosed placeholder in template '{template}'"))
        })?;
        let key = &after[..close];
        let value = match key {
            "year" | "partition" => vars.partition.as_deref(),
            "table" => vars.table.as_deref(),
            "source" => Some(vars.source.as_str()),
            other => {
                return Err(ConvertError::Config(format!(
                    "unknown placeholder '{{{other}}}' in template '{template}'"
                )));
            }
        };
        match value {
            Some(value) => out.push_str(value),
            None => {
                out.push('{');
                out.push_str(key);
                out.push('}');
            }
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

pub fn has_placeholder(template: &str, name: &str) -> bool {
    template.contains(&format!("{{{name}}}"))
}

/// Partition key of one raw cell: the year of a date, else the trimmed text.
pub fn partition_key(raw: Option<&str>) -> String {
    let Some(raw) = raw.map(str::trim).filter(|value| !value.is_empty()) else {
        return UNKNOWN_PARTITION.to_string();
    };
    if let Some(date) = parse_naive_date(raw) {
        return date.format("%Y").to_string();
    }
    if let Some(datetime) = parse_naive_datetime(raw) {
        return datetime.format("%Y").to_string();
    }
    raw.to_string()
}

/// Name for one table of a multi-table destination: `{table}` is expanded
/// when present, a single-table dataset keeps the name as is, and otherwise
/// the table name is appended as `_{table}`.
pub fn per_table_name(destination: &str, table: &str, single_table: bool) -> String {
    if has_placeholder(destination, "table") {
        destination.replace("{table}", table)
    } else if single_table {
        destination.to_string()
    } else {
        format!("{destination}_{table}")
    }
}

/// Like [`per_table_name`] for file paths, suffixing the file stem so the
/// extension is kept.
pub fn per_table_path(destination: &Path, table: &str, single_table: bool) -> PathBuf {
    let text = destination.to_string_lossy();
    if has_placeholder(&text, "table") {
        return PathBuf::from(text.replace("{table}", &sanitize_file_stem(table)));
    }
    if single_table {
        return destination.to_path_buf();
    }
    let stem = destination
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut name = format!("{stem}_{}", sanitize_file_stem(table));
    if let Some(ext) = destination.extension() {
        name.push('.');
        name.push_str(&ext.to_string_lossy());
    }
    destination.with_file_name(name)
}

fn sanitize_file_stem(name: &str) -> String {
    name.chars()
        .map(|ch| match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            other => other,
        })
        .collect()
}

/// SQL table identifier: non-word characters become `_` and a leading digit
/// gets a `table_` prefix.
pub fn sanitize_identifier(name: &str) -> String {
    let mut clean: String = name
        .trim()
        .chars()
        .map(|ch| if ch.is_alphanumeric() || ch == '_' { ch } else { '_' })
        .collect();
    if clean.is_empty() {
        clean.push_str("table");
    }
    if clean.starts_with(|ch: char| ch.is_ascii_digit()) {
        clean.insert_str(0, "table_");
    }
    clean
}

/// Worksheet name: at most 31 characters, none of `[]:*?/\`.
pub fn sanitize_sheet_name(name: &str) -> String {
    let clean: String = name
        .chars()
        .map(|ch| match ch {
            '[' | ']' | ':' | '*' | '?' | '/' | '\\' => '_',
            other => other,
        })
        .take(SHEET_NAME_MAX)
        .collect();
    let clean = clean.trim_matches('\'').to_string();
    if clean.trim().is_empty() {
        "Sheet".to_string()
    } else {
        clean
    }
}
