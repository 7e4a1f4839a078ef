//! Canonical schema model and inference.
//!
//! This module owns the [`CanonicalType`] pivot every source type is mapped
//! into and every target type is rendered from, the [`Table`] / [`Column`]
//! model, and the inference machinery behind the schema normalizer:
//!
//! - **Value detection**: [`detect_value_type`] classifies one raw cell in the
//!   order integer, decimal, boolean, date, datetime, text.
//! - **Widening**: [`CanonicalType::widen`] is the join of a lattice with
//!   `Unknown` at the bottom and unbounded text at the top, so repeated
//!   widening is monotonic and order-independent.
//! - **Normalization**: [`TableInference`] folds sampled rows into per-column
//!   candidates and [`SchemaNormalizer`] turns them into a frozen [`Table`],
//!   applying declared overrides and header cleaning.

use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    str::FromStr,
};

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use crate::{
    data::{is_null_token, parse_boolean, parse_naive_date, parse_naive_datetime},
    error::{ConvertError, Result},
};

/// Largest precision an exact decimal can carry through the pipeline.
pub const DECIMAL_MAX_PRECISION: u8 = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DecimalSpec {
    pub precision: u8,
    pub scale: u8,
}

impl DecimalSpec {
    /// Builds a spec, clamping scale to precision.
    pub fn new(precision: u8, scale: u8) -> Self {
        let precision = precision.max(1);
        Self {
            precision,
            scale: scale.min(precision),
        }
    }

    pub fn integer_digits(&self) -> u8 {
        self.precision - self.scale
    }

    /// Derives the narrowest spec for a literal such as `-012.50`.
    pub fn of_literal(literal: &str) -> Option<Self> {
        let unsigned = literal.trim().trim_start_matches(['+', '-']);
        let (int_part, frac_part) = match unsigned.split_once('.') {
            Some((int_part, frac_part)) => (int_part, frac_part),
            None => (unsigned, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return None;
        }
        if !int_part.bytes().all(|b| b.is_ascii_digit())
            || !frac_part.bytes().all(|b| b.is_ascii_digit())
        {
            return None;
        }
        let int_digits = int_part.trim_start_matches('0').len();
        let scale = frac_part.len();
        let precision = (int_digits + scale).max(1);
        if precision > DECIMAL_MAX_PRECISION as usize {
            return None;
        }
        Some(Self::new(precision as u8, scale as u8))
    }

    pub fn admits(&self, value: &Decimal) -> bool {
        let normalized = value.normalize();
        if normalized.scale() > u32::from(self.scale) {
            return false;
        }
        let whole = normalized.trunc().abs();
        let int_digits = if whole.is_zero() {
            0
        } else {
            whole.to_string().len()
        };
        int_digits <= usize::from(self.integer_digits())
    }

    /// Smallest spec holding both operands, or `None` once past the exact range.
    pub fn join(&self, other: &DecimalSpec) -> Option<DecimalSpec> {
        let scale = self.scale.max(other.scale);
        let int_digits = self.integer_digits().max(other.integer_digits());
        let precision = u16::from(int_digits) + u16::from(scale);
        (precision <= u16::from(DECIMAL_MAX_PRECISION))
            .then(|| DecimalSpec::new(precision as u8, scale))
    }
}

/// Format-independent column type.
///
/// `Decimal(None)` is an unconstrained approximate number (floating point);
/// `Text(None)` is unbounded text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CanonicalType {
    Integer { width: u8 },
    Decimal(Option<DecimalSpec>),
    Text(Option<u32>),
    Boolean,
    Date,
    DateTime,
    Binary,
    Unknown,
}

/// Decimal digits needed to hold any integer of the given bit width.
fn integer_width_digits(width: u8) -> u8 {
    match width {
        8 => 3,
        16 => 5,
        32 => 10,
        _ => 19,
    }
}

impl CanonicalType {
    pub const INT32: CanonicalType = CanonicalType::Integer { width: 32 };
    pub const INT64: CanonicalType = CanonicalType::Integer { width: 64 };
    pub const TEXT: CanonicalType = CanonicalType::Text(None);
    pub const FLOAT: CanonicalType = CanonicalType::Decimal(None);

    /// Least upper bound of two types in the widening lattice.
    pub fn widen(&self, other: &CanonicalType) -> CanonicalType {
        use CanonicalType::*;
        match (self, other) {
            (a, b) if a == b => a.clone(),
            (Unknown, x) | (x, Unknown) => x.clone(),
            (Integer { width: a }, Integer { width: b }) => Integer { width: *a.max(b) },
            (Integer { width }, Decimal(Some(spec))) | (Decimal(Some(spec)), Integer { width }) => {
                let as_spec = DecimalSpec::new(integer_width_digits(*width), 0);
                Decimal(spec.join(&as_spec))
            }
            (Integer { .. }, Decimal(None)) | (Decimal(None), Integer { .. }) => Decimal(None),
            (Decimal(Some(a)), Decimal(Some(b))) => Decimal(a.join(b)),
            (Decimal(_), Decimal(_)) => Decimal(None),
            (Date, DateTime) | (DateTime, Date) => DateTime,
            (Text(Some(a)), Text(Some(b))) => Text(Some(*a.max(b))),
            _ => Text(None),
        }
    }

    /// True when every value of `self` is also a value of `other`.
    pub fn fits_within(&self, other: &CanonicalType) -> bool {
        self.widen(other) == *other
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, CanonicalType::Integer { .. } | CanonicalType::Decimal(_))
    }

    pub fn is_temporal(&self) -> bool {
        matches!(self, CanonicalType::Date | CanonicalType::DateTime)
    }

    pub fn token(&self) -> String {
        match self {
            CanonicalType::Integer { width: 8 } => "tinyint".to_string(),
            CanonicalType::Integer { width: 16 } => "smallint".to_string(),
            CanonicalType::Integer { width: 32 } => "integer".to_string(),
            CanonicalType::Integer { .. } => "bigint".to_string(),
            CanonicalType::Decimal(Some(spec)) => {
                format!("decimal({},{})", spec.precision, spec.scale)
            }
            CanonicalType::Decimal(None) => "double".to_string(),
            CanonicalType::Text(Some(len)) => format!("varchar({len})"),
            CanonicalType::Text(None) => "text".to_string(),
            CanonicalType::Boolean => "boolean".to_string(),
            CanonicalType::Date => "date".to_string(),
            CanonicalType::DateTime => "datetime".to_string(),
            CanonicalType::Binary => "binary".to_string(),
            CanonicalType::Unknown => "unknown".to_string(),
        }
    }
}

impl fmt::Display for CanonicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token())
    }
}

fn parse_arguments(token: &str) -> Option<(&str, Vec<u32>)> {
    let Some((head, rest)) = token.split_once('(') else {
        return Some((token, Vec::new()));
    };
    let inner = rest.strip_suffix(')')?;
    let args = inner
        .split(',')
        .map(|part| part.trim().parse::<u32>().ok())
        .collect::<Option<Vec<_>>>()?;
    Some((head.trim(), args))
}

impl FromStr for CanonicalType {
    type Err = ConvertError;

    fn from_str(value: &str) -> Result<Self> {
        let lowered = value.trim().to_ascii_lowercase();
        let invalid = || ConvertError::Config(format!("unknown column type '{value}'"));
        let (head, args) = parse_arguments(&lowered).ok_or_else(invalid)?;
        let parsed = match (head, args.as_slice()) {
            ("tinyint" | "int8", []) => CanonicalType::Integer { width: 8 },
            ("smallint" | "int16", []) => CanonicalType::Integer { width: 16 },
            ("integer" | "int" | "int32", []) => CanonicalType::INT32,
            ("bigint" | "int64" | "long", []) => CanonicalType::INT64,
            ("decimal" | "numeric", [precision, scale]) => {
                let precision = u8::try_from(*precision).map_err(|_| invalid())?;
                let scale = u8::try_from(*scale).map_err(|_| invalid())?;
                if precision == 0 || precision > DECIMAL_MAX_PRECISION || scale > precision {
                    return Err(ConvertError::Config(format!(
                        "decimal precision must be 1..={DECIMAL_MAX_PRECISION} with scale <= precision, got '{value}'"
                    )));
                }
                CanonicalType::Decimal(Some(DecimalSpec::new(precision, scale)))
            }
            ("decimal" | "numeric" | "double" | "float" | "real", []) => CanonicalType::FLOAT,
            ("varchar" | "text" | "string", [len]) if *len > 0 => CanonicalType::Text(Some(*len)),
            ("text" | "string", []) => CanonicalType::TEXT,
            ("boolean" | "bool", []) => CanonicalType::Boolean,
            ("date", []) => CanonicalType::Date,
            ("datetime" | "timestamp", []) => CanonicalType::DateTime,
            ("binary" | "blob" | "bytes", []) => CanonicalType::Binary,
            ("unknown", []) => CanonicalType::Unknown,
            _ => return Err(invalid()),
        };
        Ok(parsed)
    }
}

impl Serialize for CanonicalType {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.token())
    }
}

impl<'de> Deserialize<'de> for CanonicalType {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let token = String::deserialize(deserializer)?;
        CanonicalType::from_str(&token).map_err(|err| de::Error::custom(err.to_string()))
    }
}

/// Classifies a single non-null cell.
pub fn detect_value_type(raw: &str) -> CanonicalType {
    let trimmed = raw.trim();
    if let Ok(parsed) = trimmed.parse::<i64>() {
        return if i32::try_from(parsed).is_ok() {
            CanonicalType::INT32
        } else {
            CanonicalType::INT64
        };
    }
    if let Some(spec) = DecimalSpec::of_literal(trimmed) {
        return CanonicalType::Decimal(Some(spec));
    }
    if looks_like_float(trimmed) {
        return CanonicalType::FLOAT;
    }
    if parse_boolean(trimmed).is_some() {
        return CanonicalType::Boolean;
    }
    if parse_naive_date(trimmed).is_some() {
        return CanonicalType::Date;
    }
    if parse_naive_datetime(trimmed).is_some() {
        return CanonicalType::DateTime;
    }
    CanonicalType::TEXT
}

// Rust's f64 parser accepts "inf" and "infinity"; legacy exports never mean those.
fn looks_like_float(value: &str) -> bool {
    value.bytes().any(|b| b.is_ascii_digit())
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'-' | b'+' | b'e' | b'E'))
        && value.parse::<f64>().is_ok_and(f64::is_finite)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnOrigin {
    /// Type came from source metadata or a user override and is authoritative.
    Declared,
    /// Type was inferred from data and may widen while streaming.
    Inferred,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: CanonicalType,
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    pub origin: ColumnOrigin,
    /// Whether nullability was declared (enforced) or inferred (relaxable).
    pub nullable_origin: ColumnOrigin,
    /// Native type tag reported by the source, when it has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,
}

impl Column {
    pub fn inferred(name: impl Into<String>, ty: CanonicalType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable,
            default: None,
            origin: ColumnOrigin::Inferred,
            nullable_origin: ColumnOrigin::Inferred,
            source_type: None,
        }
    }

    pub fn declared(name: impl Into<String>, ty: CanonicalType) -> Self {
        Self {
            origin: ColumnOrigin::Declared,
            ..Self::inferred(name, ty, true)
        }
    }

    pub fn is_declared(&self) -> bool {
        self.origin == ColumnOrigin::Declared
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    /// Known only when the source reports it or inference read every row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub primary_key: Vec<String>,
}

impl Table {
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        Self {
            name: name.into(),
            columns,
            row_count: None,
            primary_key: Vec::new(),
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|column| column.name.eq_ignore_ascii_case(name))
    }

    pub fn headers(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// A named collection of tables read from one input.
#[derive(Debug, Clone, Serialize)]
pub struct Dataset {
    pub identity: String,
    pub tables: Vec<Table>,
}

impl Dataset {
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }
}

/// Trims header names, names blank ones by position and disambiguates
/// case-insensitive duplicates with numeric suffixes in first-seen order.
pub fn clean_column_names(raw: &[String]) -> Vec<String> {
    let trimmed: Vec<String> = raw
        .iter()
        .enumerate()
        .map(|(idx, name)| {
            let name = name.trim();
            if name.is_empty() {
                format!("column_{}", idx + 1)
            } else {
                name.to_string()
            }
        })
        .collect();
    let mut taken: HashSet<String> = HashSet::new();
    let mut result = Vec::with_capacity(trimmed.len());
    for name in &trimmed {
        let mut candidate = name.clone();
        let mut suffix = 1;
        while taken.contains(&candidate.to_lowercase())
            || (candidate != *name && trimmed.iter().any(|n| n.eq_ignore_ascii_case(&candidate)))
        {
            candidate = format!("{name}_{suffix}");
            suffix += 1;
        }
        taken.insert(candidate.to_lowercase());
        result.push(candidate);
    }
    result
}

/// User-declared settings for one column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnOverride {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub ty: Option<CanonicalType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nullable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

/// Overrides keyed by `column` or `table.column`, matched case-insensitively.
pub type ColumnOverrides = BTreeMap<String, ColumnOverride>;

fn lookup_override<'a>(
    overrides: &'a ColumnOverrides,
    table: &str,
    column: &str,
) -> Option<&'a ColumnOverride> {
    let qualified = format!("{table}.{column}");
    overrides
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(&qualified))
        .or_else(|| overrides.iter().find(|(key, _)| key.eq_ignore_ascii_case(column)))
        .map(|(_, value)| value)
}

#[derive(Debug, Clone)]
struct ColumnCandidate {
    ty: CanonicalType,
    saw_null: bool,
}

impl ColumnCandidate {
    fn update(&mut self, value: Option<&str>) {
        match value {
            // Unbounded text is the top of the lattice; skip detection once there.
            Some(_) if self.ty == CanonicalType::TEXT => {}
            Some(raw) if !is_null_token(raw) => self.ty = self.ty.widen(&detect_value_type(raw)),
            _ => self.saw_null = true,
        }
    }
}

/// Accumulates type and nullability evidence for one table.
#[derive(Debug, Clone)]
pub struct TableInference {
    names: Vec<String>,
    declared: Vec<Option<CanonicalType>>,
    source_types: Vec<Option<String>>,
    candidates: Vec<ColumnCandidate>,
    rows_seen: u64,
}

impl TableInference {
    pub fn new(names: Vec<String>) -> Self {
        let count = names.len();
        Self {
            names,
            declared: vec![None; count],
            source_types: vec![None; count],
            candidates: vec![
                ColumnCandidate {
                    ty: CanonicalType::Unknown,
                    saw_null: false,
                };
                count
            ],
            rows_seen: 0,
        }
    }

    /// Records a type the source itself declares for a column.
    pub fn declare(&mut self, index: usize, ty: CanonicalType, source_type: Option<String>) {
        if let Some(slot) = self.declared.get_mut(index) {
            *slot = Some(ty);
        }
        if let Some(slot) = self.source_types.get_mut(index) {
            *slot = source_type;
        }
    }

    pub fn observe(&mut self, row: &[Option<String>]) {
        for (idx, candidate) in self.candidates.iter_mut().enumerate() {
            candidate.update(row.get(idx).and_then(|v| v.as_deref()));
        }
        self.rows_seen += 1;
    }

    pub fn rows_seen(&self) -> u64 {
        self.rows_seen
    }

    pub fn column_names(&self) -> &[String] {
        &self.names
    }
}

/// Turns accumulated evidence into frozen table schemas.
#[derive(Debug, Clone, Default)]
pub struct SchemaNormalizer {
    pub sample_rows: Option<usize>,
    pub overrides: ColumnOverrides,
    pub primary_key: Vec<String>,
}

impl SchemaNormalizer {
    pub fn new(sample_rows: Option<usize>) -> Self {
        Self {
            sample_rows,
            ..Self::default()
        }
    }

    pub fn with_overrides(mut self, overrides: ColumnOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_primary_key(mut self, primary_key: Vec<String>) -> Self {
        self.primary_key = primary_key;
        self
    }

    /// True once the inference pass has seen enough rows.
    pub fn sample_complete(&self, inference: &TableInference) -> bool {
        self.sample_rows
            .is_some_and(|limit| inference.rows_seen() >= limit as u64)
    }

    /// Builds the table schema. `exhausted` says whether inference consumed
    /// the whole stream, which makes the row count known.
    pub fn finish(
        &self,
        table_name: &str,
        inference: TableInference,
        source_primary_key: Vec<String>,
        exhausted: bool,
    ) -> Table {
        let TableInference {
            names,
            declared,
            source_types,
            candidates,
            rows_seen,
        } = inference;
        let columns = names
            .into_iter()
            .zip(declared)
            .zip(source_types)
            .zip(candidates)
            .map(|(((name, declared), source_type), candidate)| {
                let override_ = lookup_override(&self.overrides, table_name, &name);
                let override_ty = override_.and_then(|o| o.ty.clone());
                let (ty, origin) = match (override_ty, declared) {
                    (Some(ty), _) | (None, Some(ty)) => (ty, ColumnOrigin::Declared),
                    (None, None) => {
                        let ty = match candidate.ty {
                            CanonicalType::Unknown => CanonicalType::TEXT,
                            other => other,
                        };
                        (ty, ColumnOrigin::Inferred)
                    }
                };
                let (nullable, nullable_origin) = match override_.and_then(|o| o.nullable) {
                    Some(nullable) => (nullable, ColumnOrigin::Declared),
                    None => (candidate.saw_null || rows_seen == 0, ColumnOrigin::Inferred),
                };
                Column {
                    name,
                    ty,
                    nullable,
                    default: override_.and_then(|o| o.default.clone()),
                    origin,
                    nullable_origin,
                    source_type,
                }
            })
            .collect();
        let mut table = Table::new(table_name, columns);
        table.row_count = exhausted.then_some(rows_seen);
        table.primary_key = if self.primary_key.is_empty() {
            source_primary_key
        } else {
            self.primary_key.clone()
        };
        table
            .primary_key
            .retain(|key| table.columns.iter().any(|c| c.name.eq_ignore_ascii_case(key)));
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn detection_order_prefers_narrow_types() {
        assert_eq!(detect_value_type("42"), CanonicalType::INT32);
        assert_eq!(detect_value_type("9000000000"), CanonicalType::INT64);
        assert_eq!(
            detect_value_type("12.50"),
            CanonicalType::Decimal(Some(DecimalSpec::new(4, 2)))
        );
        assert_eq!(detect_value_type("1.5e10"), CanonicalType::FLOAT);
        assert_eq!(detect_value_type("yes"), CanonicalType::Boolean);
        assert_eq!(detect_value_type("2008-01-31"), CanonicalType::Date);
        assert_eq!(detect_value_type("2008-01-31 10:00:00"), CanonicalType::DateTime);
        assert_eq!(detect_value_type("inf"), CanonicalType::TEXT);
        assert_eq!(detect_value_type("Bob"), CanonicalType::TEXT);
    }

    #[test]
    fn widening_follows_integer_decimal_text_order() {
        let int = CanonicalType::INT32;
        let dec = CanonicalType::Decimal(Some(DecimalSpec::new(4, 2)));
        let widened = int.widen(&dec);
        assert_eq!(
            widened,
            CanonicalType::Decimal(Some(DecimalSpec::new(12, 2)))
        );
        assert_eq!(widened.widen(&CanonicalType::TEXT), CanonicalType::TEXT);
        assert_eq!(
            CanonicalType::Boolean.widen(&CanonicalType::INT32),
            CanonicalType::TEXT
        );
        assert_eq!(
            CanonicalType::Date.widen(&CanonicalType::DateTime),
            CanonicalType::DateTime
        );
        assert_eq!(
            CanonicalType::Unknown.widen(&CanonicalType::Boolean),
            CanonicalType::Boolean
        );
    }

    #[test]
    fn decimal_overflow_widens_to_float() {
        let big = CanonicalType::Decimal(Some(DecimalSpec::new(28, 20)));
        let wide = CanonicalType::Decimal(Some(DecimalSpec::new(20, 0)));
        assert_eq!(big.widen(&wide), CanonicalType::FLOAT);
    }

    #[test]
    fn type_tokens_parse_back() {
        for token in [
            "tinyint",
            "smallint",
            "integer",
            "bigint",
            "decimal(18,2)",
            "double",
            "varchar(50)",
            "text",
            "boolean",
            "date",
            "datetime",
            "binary",
        ] {
            let parsed: CanonicalType = token.parse().unwrap();
            assert_eq!(parsed.token(), token);
        }
        assert!("decimal(40,2)".parse::<CanonicalType>().is_err());
        assert!("geometry".parse::<CanonicalType>().is_err());
    }

    #[test]
    fn column_names_are_cleaned_and_disambiguated() {
        let cleaned = clean_column_names(&names(&[" id ", "Name", "", "name", "NAME", "name_1"]));
        assert_eq!(
            cleaned,
            names(&["id", "Name", "column_3", "name_2", "NAME_3", "name_1"])
        );
    }

    #[test]
    fn inference_tracks_nullability_and_types() {
        let mut inference = TableInference::new(names(&["id", "score", "note"]));
        inference.observe(&[Some("1".into()), Some("2.5".into()), None]);
        inference.observe(&[Some("2".into()), Some("NULL".into()), Some("x".into())]);
        let table = SchemaNormalizer::new(None).finish("t", inference, Vec::new(), true);
        assert_eq!(table.row_count, Some(2));
        assert_eq!(table.columns[0].ty, CanonicalType::INT32);
        assert!(!table.columns[0].nullable);
        assert!(table.columns[1].nullable);
        assert_eq!(table.columns[2].ty, CanonicalType::TEXT);
        assert!(table.columns[2].nullable);
    }

    #[test]
    fn overrides_are_declared_and_authoritative() {
        let mut overrides = ColumnOverrides::new();
        overrides.insert(
            "people.joined".into(),
            ColumnOverride {
                ty: Some(CanonicalType::Date),
                nullable: Some(false),
                default: None,
            },
        );
        let mut inference = TableInference::new(names(&["joined"]));
        inference.observe(&[Some("not a date".into())]);
        let table = SchemaNormalizer::new(Some(1))
            .with_overrides(overrides)
            .finish("people", inference, Vec::new(), false);
        let joined = &table.columns[0];
        assert_eq!(joined.ty, CanonicalType::Date);
        assert!(joined.is_declared());
        assert!(!joined.nullable);
        assert_eq!(joined.nullable_origin, ColumnOrigin::Declared);
        assert_eq!(table.row_count, None);
    }

    #[test]
    fn unknown_primary_key_columns_are_dropped() {
        let inference = TableInference::new(names(&["id"]));
        let table = SchemaNormalizer::new(None)
            .with_primary_key(names(&["id", "missing"]))
            .finish("t", inference, Vec::new(), true);
        assert_eq!(table.primary_key, names(&["id"]));
    }

    fn arb_type() -> impl Strategy<Value = CanonicalType> {
        prop_oneof![
            Just(CanonicalType::Unknown),
            prop_oneof![Just(8u8), Just(16), Just(32), Just(64)]
                .prop_map(|width| CanonicalType::Integer { width }),
            (1u8..=20, 0u8..=8).prop_map(|(p, s)| CanonicalType::Decimal(Some(DecimalSpec::new(p, s)))),
            Just(CanonicalType::FLOAT),
            proptest::option::of(1u32..200).prop_map(CanonicalType::Text),
            Just(CanonicalType::Boolean),
            Just(CanonicalType::Date),
            Just(CanonicalType::DateTime),
            Just(CanonicalType::Binary),
        ]
    }

    proptest! {
        #[test]
        fn widening_is_commutative_and_monotonic(a in arb_type(), b in arb_type(), c in arb_type()) {
            let ab = a.widen(&b);
            prop_assert_eq!(ab.clone(), b.widen(&a));
            prop_assert!(a.fits_within(&ab));
            prop_assert!(b.fits_within(&ab));
            // Widening again never narrows.
            let abc = ab.widen(&c);
            prop_assert!(ab.fits_within(&abc));
        }
    }
}
