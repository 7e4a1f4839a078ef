//! Type mapper: source type tags into the canonical pivot, and canonical
//! types out to each target's native vocabulary.
//!
//! Mapping is deterministic and never fatal. Unknown source tags become
//! unbounded text with a warning; target restrictions (identifier length,
//! column count, value ranges) are handled by renaming, overflow packing
//! or a documented lossy fallback, each reported as a [`Warning`].

use std::collections::HashSet;

use itertools::Itertools;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::{
    data::Value,
    report::{Warning, WarningCode},
    rows::ColumnChange,
    schema::{CanonicalType, ColumnOrigin, DecimalSpec, Table},
};

/// Name of the text column that carries columns beyond a target's limit.
pub const OVERFLOW_COLUMN: &str = "overflow_columns";

/// Largest integer magnitude a spreadsheet cell (IEEE double) stores exactly.
pub const SPREADSHEET_MAX_SAFE_INTEGER: i64 = 1 << 53;

pub const SPREADSHEET_MAX_TEXT: usize = 32_767;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalMapping {
    pub ty: CanonicalType,
    pub warning: Option<String>,
}

impl CanonicalMapping {
    fn exact(ty: CanonicalType) -> Self {
        Self { ty, warning: None }
    }
}

fn tag_arguments(tag: &str) -> (String, Vec<u32>) {
    let (head, args) = match tag.split_once('(') {
        Some((head, rest)) => (
            head,
            rest.trim_end_matches(')')
                .split(',')
                .filter_map(|arg| arg.trim().parse().ok())
                .collect(),
        ),
        None => (tag, Vec::new()),
    };
    (head.trim().to_ascii_lowercase(), args)
}

/// Maps a legacy desktop-database column tag (as printed by `mdb-schema`).
pub fn access_to_canonical(tag: &str) -> CanonicalMapping {
    let (head, args) = tag_arguments(tag);
    let ty = match (head.as_str(), args.as_slice()) {
        ("boolean" | "yes/no" | "bit", _) => CanonicalType::Boolean,
        ("byte", _) => CanonicalType::Integer { width: 8 },
        ("integer", _) => CanonicalType::Integer { width: 16 },
        ("long integer" | "autonumber", _) => CanonicalType::INT32,
        ("currency" | "money", _) => CanonicalType::Decimal(Some(DecimalSpec::new(19, 4))),
        ("single" | "double", _) => CanonicalType::FLOAT,
        ("numeric" | "decimal", [precision, scale]) => {
            match (u8::try_from(*precision), u8::try_from(*scale)) {
                (Ok(p), Ok(s)) if p <= crate::schema::DECIMAL_MAX_PRECISION => {
                    CanonicalType::Decimal(Some(DecimalSpec::new(p, s)))
                }
                _ => {
                    return CanonicalMapping {
                        ty: CanonicalType::FLOAT,
                        warning: Some(format!(
                            "{tag} exceeds the exact decimal range; values become floating point"
                        )),
                    };
                }
            }
        }
        ("numeric" | "decimal", _) => CanonicalType::FLOAT,
        ("datetime" | "date/time" | "date", _) => CanonicalType::DateTime,
        ("text" | "char" | "varchar", [len]) => CanonicalType::Text(Some(*len)),
        ("text" | "memo" | "memo/hyperlink" | "hyperlink" | "char" | "varchar", _) => CanonicalType::TEXT,
        ("ole" | "ole object" | "binary" | "attachment", _) => CanonicalType::Binary,
        ("replication id" | "guid", _) => CanonicalType::Text(Some(38)),
        _ => {
            return CanonicalMapping {
                ty: CanonicalType::TEXT,
                warning: Some(format!("unknown source type '{tag}' mapped to text")),
            };
        }
    };
    CanonicalMapping::exact(ty)
}

/// Target type vocabularies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vocabulary {
    MySql,
    Postgres,
    Sqlite,
    Delimited,
    Spreadsheet,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeType {
    pub name: String,
    /// Set when the target cannot represent every canonical value exactly.
    pub lossy: Option<String>,
}

impl NativeType {
    fn exact(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lossy: None,
        }
    }

    fn lossy(name: impl Into<String>, note: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lossy: Some(note.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TargetLimits {
    pub max_identifier_len: Option<usize>,
    pub max_columns: Option<usize>,
}

impl Vocabulary {
    pub fn limits(self) -> TargetLimits {
        let (max_identifier_len, max_columns) = match self {
            Vocabulary::MySql => (Some(64), Some(4096)),
            Vocabulary::Postgres => (Some(63), Some(1600)),
            Vocabulary::Sqlite => (None, Some(2000)),
            Vocabulary::Spreadsheet => (Some(31), Some(16_384)),
            Vocabulary::Delimited | Vocabulary::Json => (None, None),
        };
        TargetLimits {
            max_identifier_len,
            max_columns,
        }
    }

    pub fn from_canonical(self, ty: &CanonicalType) -> NativeType {
        match self {
            Vocabulary::MySql => mysql_type(ty),
            Vocabulary::Postgres => postgres_type(ty),
            Vocabulary::Sqlite => sqlite_type(ty),
            Vocabulary::Delimited => NativeType::exact("text"),
            Vocabulary::Spreadsheet => spreadsheet_type(ty),
            Vocabulary::Json => json_type(ty),
        }
    }
}

fn mysql_type(ty: &CanonicalType) -> NativeType {
    match ty {
        CanonicalType::Integer { width: 8 } => NativeType::exact("TINYINT"),
        CanonicalType::Integer { width: 16 } => NativeType::exact("SMALLINT"),
        CanonicalType::Integer { width: 32 } => NativeType::exact("INT"),
        CanonicalType::Integer { .. } => NativeType::exact("BIGINT"),
        CanonicalType::Decimal(Some(spec)) => {
            NativeType::exact(format!("DECIMAL({},{})", spec.precision, spec.scale))
        }
        CanonicalType::Decimal(None) => NativeType::exact("DOUBLE"),
        CanonicalType::Text(Some(len)) if *len <= 16_383 => {
            NativeType::exact(format!("VARCHAR({len})"))
        }
        CanonicalType::Text(_) => NativeType::exact("LONGTEXT"),
        CanonicalType::Boolean => NativeType::exact("TINYINT(1)"),
        CanonicalType::Date => NativeType::exact("DATE"),
        CanonicalType::DateTime => NativeType::exact("DATETIME"),
        CanonicalType::Binary => NativeType::exact("LONGBLOB"),
        CanonicalType::Unknown => NativeType::exact("LONGTEXT"),
    }
}

fn postgres_type(ty: &CanonicalType) -> NativeType {
    match ty {
        CanonicalType::Integer { width: 8 | 16 } => NativeType::exact("SMALLINT"),
        CanonicalType::Integer { width: 32 } => NativeType::exact("INTEGER"),
        CanonicalType::Integer { .. } => NativeType::exact("BIGINT"),
        CanonicalType::Decimal(Some(spec)) => {
            NativeType::exact(format!("NUMERIC({},{})", spec.precision, spec.scale))
        }
        CanonicalType::Decimal(None) => NativeType::exact("DOUBLE PRECISION"),
        CanonicalType::Text(Some(len)) => NativeType::exact(format!("VARCHAR({len})")),
        CanonicalType::Text(None) | CanonicalType::Unknown => NativeType::exact("TEXT"),
        CanonicalType::Boolean => NativeType::exact("BOOLEAN"),
        CanonicalType::Date => NativeType::exact("DATE"),
        CanonicalType::DateTime => NativeType::exact("TIMESTAMP"),
        CanonicalType::Binary => NativeType::exact("BYTEA"),
    }
}

fn sqlite_type(ty: &CanonicalType) -> NativeType {
    match ty {
        CanonicalType::Integer { .. } | CanonicalType::Boolean => NativeType::exact("INTEGER"),
        CanonicalType::Decimal(Some(spec)) if spec.precision > 15 => NativeType::lossy(
            "NUMERIC",
            format!(
                "SQLite stores decimal({},{}) as a double; digits beyond 15 may be lost",
                spec.precision, spec.scale
            ),
        ),
        CanonicalType::Decimal(Some(_)) => NativeType::exact("NUMERIC"),
        CanonicalType::Decimal(None) => NativeType::exact("REAL"),
        CanonicalType::Text(_)
        | CanonicalType::Date
        | CanonicalType::DateTime
        | CanonicalType::Unknown => NativeType::exact("TEXT"),
        CanonicalType::Binary => NativeType::exact("BLOB"),
    }
}

fn spreadsheet_type(ty: &CanonicalType) -> NativeType {
    match ty {
        CanonicalType::Integer { width: 64 } => NativeType::lossy(
            "number",
            "integers beyond 2^53 are written as text cells",
        ),
        CanonicalType::Integer { .. } => NativeType::exact("number"),
        CanonicalType::Decimal(Some(spec)) if spec.precision > 15 => NativeType::lossy(
            "number",
            format!(
                "decimal({},{}) is stored as a double; digits beyond 15 may be lost",
                spec.precision, spec.scale
            ),
        ),
        CanonicalType::Decimal(_) => NativeType::exact("number"),
        CanonicalType::Text(Some(len)) if (*len as usize) <= SPREADSHEET_MAX_TEXT => {
            NativeType::exact("string")
        }
        CanonicalType::Text(_) | CanonicalType::Unknown => NativeType::lossy(
            "string",
            format!("cells hold at most {SPREADSHEET_MAX_TEXT} characters; longer text is truncated"),
        ),
        CanonicalType::Boolean => NativeType::exact("boolean"),
        CanonicalType::Date | CanonicalType::DateTime => NativeType::exact("datetime"),
        CanonicalType::Binary => NativeType::exact("string"),
    }
}

fn json_type(ty: &CanonicalType) -> NativeType {
    match ty {
        CanonicalType::Integer { .. } | CanonicalType::Decimal(_) => NativeType::exact("number"),
        CanonicalType::Boolean => NativeType::exact("boolean"),
        _ => NativeType::exact("string"),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetColumn {
    pub name: String,
    pub ty: CanonicalType,
    pub native: String,
    pub nullable: bool,
    /// NOT NULL comes from a declaration rather than from the rows seen so far.
    pub nullable_declared: bool,
    pub default: Option<String>,
}

/// How one table is laid out on one target.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetLayout {
    pub vocabulary: Vocabulary,
    pub table_name: String,
    pub columns: Vec<TargetColumn>,
    pub primary_key: Vec<String>,
    /// Source column positions that map one-to-one onto `columns`.
    direct: Vec<usize>,
    /// Source positions and names packed into the overflow column.
    overflow: Vec<(usize, String)>,
}

/// A target column after its source column widened mid-stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Widening {
    pub position: usize,
    pub type_changed: bool,
    /// The column was NOT NULL and now takes nulls.
    pub relaxed: bool,
    /// Set when the new type maps inexactly where the old one did not.
    pub lossy: Option<Warning>,
}

/// Shortens `name` to `max` characters, appending `_n` until it is unique.
fn fit_identifier(name: &str, max: Option<usize>, taken: &mut HashSet<String>) -> String {
    let truncate = |value: &str, len: usize| value.chars().take(len).collect::<String>();
    let base = match max {
        Some(max) => truncate(name, max),
        None => name.to_string(),
    };
    let mut candidate = base.clone();
    let mut suffix = 1usize;
    while taken.contains(&candidate.to_lowercase()) {
        let tail = format!("_{suffix}");
        candidate = match max {
            Some(max) => format!("{}{tail}", truncate(&base, max.saturating_sub(tail.len()))),
            None => format!("{base}{tail}"),
        };
        suffix += 1;
    }
    taken.insert(candidate.to_lowercase());
    candidate
}

impl TargetLayout {
    /// Plans the target layout, recording every rename, overflow and lossy
    /// mapping as a warning. No column is ever dropped.
    pub fn plan(table: &Table, table_name: &str, vocabulary: Vocabulary) -> (Self, Vec<Warning>) {
        let limits = vocabulary.limits();
        let mut warnings = Vec::new();

        let mut taken = HashSet::new();
        let fitted_table = fit_identifier(table_name, limits.max_identifier_len, &mut taken);
        if fitted_table != table_name {
            warnings.push(Warning::new(
                &table.name,
                WarningCode::IdentifierRenamed,
                format!("table name '{table_name}' shortened to '{fitted_table}'"),
            ));
        }

        let direct_count = match limits.max_columns {
            Some(max) if table.columns.len() > max => max - 1,
            _ => table.columns.len(),
        };

        let mut taken = HashSet::new();
        let mut columns = Vec::with_capacity(direct_count + 1);
        let mut direct = Vec::with_capacity(direct_count);
        let mut renamed = Vec::new();
        for (idx, column) in table.columns.iter().enumerate().take(direct_count) {
            let name = fit_identifier(&column.name, limits.max_identifier_len, &mut taken);
            if name != column.name {
                warnings.push(
                    Warning::new(
                        &table.name,
                        WarningCode::IdentifierRenamed,
                        format!("column '{}' renamed to '{name}'", column.name),
                    )
                    .on_column(&column.name),
                );
                renamed.push((column.name.clone(), name.clone()));
            }
            let native = vocabulary.from_canonical(&column.ty);
            if let Some(note) = &native.lossy {
                warnings.push(
                    Warning::new(&table.name, WarningCode::LossyType, note.clone())
                        .on_column(&column.name),
                );
            }
            columns.push(TargetColumn {
                name,
                ty: column.ty.clone(),
                native: native.name,
                nullable: column.nullable,
                nullable_declared: column.nullable_origin == ColumnOrigin::Declared,
                default: column.default.clone(),
            });
            direct.push(idx);
        }

        let overflow: Vec<(usize, String)> = table
            .columns
            .iter()
            .enumerate()
            .skip(direct_count)
            .map(|(idx, column)| (idx, column.name.clone()))
            .collect();
        if !overflow.is_empty() {
            warn!(
                "Table '{}' has {} columns; packing {} into '{}'",
                table.name,
                table.columns.len(),
                overflow.len(),
                OVERFLOW_COLUMN
            );
            for (_, name) in &overflow {
                warnings.push(
                    Warning::new(
                        &table.name,
                        WarningCode::TargetCapacityExceeded,
                        format!("column beyond the target limit is stored inside '{OVERFLOW_COLUMN}'"),
                    )
                    .on_column(name),
                );
            }
            let ty = CanonicalType::TEXT;
            columns.push(TargetColumn {
                name: fit_identifier(OVERFLOW_COLUMN, limits.max_identifier_len, &mut taken),
                native: vocabulary.from_canonical(&ty).name,
                ty,
                nullable: true,
                nullable_declared: false,
                default: None,
            });
        }

        let primary_key = table
            .primary_key
            .iter()
            .filter_map(|key| {
                let position = table.column_index(key)?;
                let slot = direct.iter().position(|&d| d == position)?;
                Some(columns[slot].name.clone())
            })
            .collect_vec();

        let layout = Self {
            vocabulary,
            table_name: fitted_table,
            columns,
            primary_key,
            direct,
            overflow,
        };
        (layout, warnings)
    }

    /// Follows a source column that widened while streaming. Returns `None`
    /// when the column is packed into the overflow column.
    pub fn widen(&mut self, table: &str, change: &ColumnChange) -> Option<Widening> {
        let position = self.target_position(change.index)?;
        let before = self.vocabulary.from_canonical(&self.columns[position].ty);
        let after = self.vocabulary.from_canonical(&change.after.ty);
        let column = &mut self.columns[position];
        let type_changed = column.ty != change.after.ty;
        let relaxed = !column.nullable && change.after.nullable;
        column.ty = change.after.ty.clone();
        column.native = after.name;
        column.nullable = change.after.nullable;
        let lossy = after
            .lossy
            .filter(|note| before.lossy.as_ref() != Some(note))
            .map(|note| {
                Warning::new(table, WarningCode::LossyType, note).on_column(&change.after.name)
            });
        Some(Widening {
            position,
            type_changed,
            relaxed,
            lossy,
        })
    }

    pub fn has_overflow(&self) -> bool {
        !self.overflow.is_empty()
    }

    /// Target position of a source column, if it maps directly.
    pub fn target_position(&self, source_index: usize) -> Option<usize> {
        self.direct.iter().position(|&idx| idx == source_index)
    }

    /// Reshapes a source row onto this layout.
    pub fn project(&self, row: &[Option<Value>]) -> Vec<Option<Value>> {
        let mut projected: Vec<Option<Value>> = self
            .direct
            .iter()
            .map(|&idx| row.get(idx).cloned().flatten())
            .collect();
        if !self.overflow.is_empty() {
            let packed: serde_json::Map<String, serde_json::Value> = self
                .overflow
                .iter()
                .map(|(idx, name)| {
                    let value = row
                        .get(*idx)
                        .and_then(|v| v.as_ref())
                        .map_or(serde_json::Value::Null, Value::to_json);
                    (name.clone(), value)
                })
                .collect();
            projected.push(Some(Value::Text(
                serde_json::Value::Object(packed).to_string(),
            )));
        }
        projected
    }

    pub fn column_names(&self) -> String {
        self.columns.iter().map(|c| c.name.as_str()).join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Column;

    fn table_with(columns: usize) -> Table {
        Table::new(
            "wide",
            (0..columns)
                .map(|i| Column::inferred(format!("c{i}"), CanonicalType::INT32, false))
                .collect(),
        )
    }

    #[test]
    fn access_tags_map_to_canonical_types() {
        assert_eq!(access_to_canonical("Long Integer").ty, CanonicalType::INT32);
        assert_eq!(
            access_to_canonical("Integer").ty,
            CanonicalType::Integer { width: 16 }
        );
        assert_eq!(access_to_canonical("Text (50)").ty, CanonicalType::Text(Some(50)));
        assert_eq!(
            access_to_canonical("Currency").ty,
            CanonicalType::Decimal(Some(DecimalSpec::new(19, 4)))
        );
        assert_eq!(
            access_to_canonical("Numeric (18, 2)").ty,
            CanonicalType::Decimal(Some(DecimalSpec::new(18, 2)))
        );
        assert_eq!(access_to_canonical("Memo/Hyperlink").ty, CanonicalType::TEXT);
        assert_eq!(access_to_canonical("DateTime").ty, CanonicalType::DateTime);
        assert_eq!(access_to_canonical("OLE").ty, CanonicalType::Binary);
    }

    #[test]
    fn unknown_tags_become_text_with_warning() {
        let mapping = access_to_canonical("Geography");
        assert_eq!(mapping.ty, CanonicalType::TEXT);
        assert!(mapping.warning.unwrap().contains("Geography"));
    }

    #[test]
    fn core_types_map_losslessly_to_every_target() {
        let core = [
            CanonicalType::INT32,
            CanonicalType::TEXT,
            CanonicalType::Text(Some(50)),
            CanonicalType::Boolean,
            CanonicalType::Date,
        ];
        for vocabulary in [
            Vocabulary::MySql,
            Vocabulary::Postgres,
            Vocabulary::Sqlite,
            Vocabulary::Delimited,
            Vocabulary::Json,
        ] {
            for ty in &core {
                let native = vocabulary.from_canonical(ty);
                assert!(native.lossy.is_none(), "{vocabulary:?} {ty}");
                assert!(!native.name.is_empty());
            }
        }
    }

    #[test]
    fn wide_decimals_warn_on_sqlite() {
        let ty = CanonicalType::Decimal(Some(DecimalSpec::new(19, 4)));
        assert!(Vocabulary::Sqlite.from_canonical(&ty).lossy.is_some());
        assert!(Vocabulary::Postgres.from_canonical(&ty).lossy.is_none());
        assert_eq!(Vocabulary::MySql.from_canonical(&ty).name, "DECIMAL(19,4)");
    }

    #[test]
    fn widening_into_a_lossy_type_is_reported_once() {
        let table = Table::new(
            "ledger",
            vec![Column::inferred(
                "amount",
                CanonicalType::Decimal(Some(DecimalSpec::new(10, 2))),
                false,
            )],
        );
        let (mut layout, warnings) = TargetLayout::plan(&table, "ledger", Vocabulary::Sqlite);
        assert!(warnings.is_empty());

        let mut after = table.columns[0].clone();
        after.ty = CanonicalType::Decimal(Some(DecimalSpec::new(20, 2)));
        let change = ColumnChange {
            index: 0,
            before: table.columns[0].clone(),
            after: after.clone(),
        };
        let widening = layout.widen("ledger", &change).unwrap();
        assert!(widening.type_changed);
        assert!(!widening.relaxed);
        let warning = widening.lossy.unwrap();
        assert_eq!(warning.code, WarningCode::LossyType);
        assert_eq!(warning.column.as_deref(), Some("amount"));
        assert_eq!(layout.columns[0].native, "NUMERIC");

        let mut relaxed = after.clone();
        relaxed.nullable = true;
        let again = ColumnChange {
            index: 0,
            before: after,
            after: relaxed,
        };
        let widening = layout.widen("ledger", &again).unwrap();
        assert!(widening.relaxed);
        assert!(widening.lossy.is_none());
    }

    #[test]
    fn excess_columns_are_packed_not_dropped() {
        let table = table_with(1602);
        let (layout, warnings) = TargetLayout::plan(&table, "wide", Vocabulary::Postgres);
        assert_eq!(layout.columns.len(), 1600);
        assert_eq!(layout.columns.last().unwrap().name, OVERFLOW_COLUMN);
        let overflow_warnings = warnings
            .iter()
            .filter(|w| w.code == WarningCode::TargetCapacityExceeded)
            .count();
        assert_eq!(overflow_warnings, 3);

        let row: Vec<Option<Value>> = (0..1602).map(|i| Some(Value::Integer(i))).collect();
        let projected = layout.project(&row);
        assert_eq!(projected.len(), 1600);
        let Some(Some(Value::Text(packed))) = projected.last() else {
            panic!("expected packed overflow text");
        };
        assert_eq!(packed, r#"{"c1599":1599,"c1600":1600,"c1601":1601}"#);
    }

    #[test]
    fn long_identifiers_are_shortened_uniquely() {
        let long = "a".repeat(70);
        let table = Table::new(
            "t",
            vec![
                Column::inferred(format!("{long}x"), CanonicalType::TEXT, true),
                Column::inferred(format!("{long}y"), CanonicalType::TEXT, true),
            ],
        );
        let (layout, warnings) = TargetLayout::plan(&table, "t", Vocabulary::Postgres);
        assert_eq!(layout.columns[0].name, "a".repeat(63));
        assert_eq!(layout.columns[1].name, format!("{}_1", "a".repeat(61)));
        assert_eq!(
            warnings
                .iter()
                .filter(|w| w.code == WarningCode::IdentifierRenamed)
                .count(),
            2
        );
    }
}
