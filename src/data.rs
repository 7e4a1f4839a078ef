use std::{fmt, str::FromStr};

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::schema::CanonicalType;

/// Cell contents that count as an absent value, in addition to the empty string.
pub const NULL_TOKENS: &[&str] = &["NULL", "null", "NaN", "nan", "N/A"];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%m/%d/%Y", "%Y/%m/%d", "%d-%m-%Y"];
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%d/%m/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Value {
    Integer(i64),
    Decimal(Decimal),
    Float(f64),
    Boolean(bool),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Text(String),
    Binary(Vec<u8>),
}

impl Value {
    pub fn as_display(&self) -> String {
        match self {
            Value::Integer(i) => i.to_string(),
            Value::Decimal(d) => d.normalize().to_string(),
            Value::Float(f) => {
                if f.fract() == 0.0 && f.abs() < 1e15 {
                    format!("{f:.0}")
                } else {
                    f.to_string()
                }
            }
            Value::Boolean(b) => b.to_string(),
            Value::Date(d) => d.format("%Y-%m-%d").to_string(),
            Value::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
            Value::Text(s) => s.clone(),
            Value::Binary(bytes) => hex_encode(bytes),
        }
    }

    /// Rough in-memory footprint, used for batch byte caps.
    pub fn approx_bytes(&self) -> usize {
        match self {
            Value::Text(s) => s.len(),
            Value::Binary(b) => b.len(),
            _ => 8,
        }
    }

    /// JSON rendering used by document writers and column overflow packing.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::Decimal(d) => {
                // Keep exact digits as a JSON number when they survive the round trip.
                let text = d.normalize().to_string();
                match serde_json::Number::from_str(&text) {
                    Ok(number) => serde_json::Value::Number(number),
                    Err(_) => serde_json::Value::String(text),
                }
            }
            other => serde_json::Value::String(other.as_display()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_display())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("cannot parse '{value}' as {expected}")]
pub struct ParseValueError {
    pub value: String,
    pub expected: String,
}

impl ParseValueError {
    fn new(value: &str, expected: impl fmt::Display) -> Self {
        Self {
            value: value.to_string(),
            expected: expected.to_string(),
        }
    }
}

pub fn is_null_token(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty() || NULL_TOKENS.contains(&trimmed)
}

pub fn parse_naive_date(value: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
}

pub fn parse_naive_datetime(value: &str) -> Option<NaiveDateTime> {
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
}

pub fn parse_boolean(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "y" => Some(true),
        "false" | "f" | "no" | "n" => Some(false),
        _ => None,
    }
}

/// Parses raw cell text into a value of the given canonical type.
///
/// Absent cells and null tokens yield `Ok(None)`. Integers are range-checked
/// against the declared width, text against its maximum length.
pub fn parse_typed_value(
    raw: Option<&str>,
    ty: &CanonicalType,
) -> Result<Option<Value>, ParseValueError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    if is_null_token(raw) {
        return Ok(None);
    }
    let trimmed = raw.trim();
    let parsed = match ty {
        CanonicalType::Integer { width } => {
            let parsed: i64 = trimmed
                .parse()
                .map_err(|_| ParseValueError::new(raw, ty))?;
            if !integer_fits(parsed, *width) {
                return Err(ParseValueError::new(raw, ty));
            }
            Value::Integer(parsed)
        }
        CanonicalType::Decimal(Some(spec)) => {
            let parsed = Decimal::from_str(trimmed)
                .or_else(|_| Decimal::from_scientific(trimmed))
                .map_err(|_| ParseValueError::new(raw, ty))?;
            if !spec.admits(&parsed) {
                return Err(ParseValueError::new(raw, ty));
            }
            Value::Decimal(parsed)
        }
        CanonicalType::Decimal(None) => {
            let parsed: f64 = trimmed
                .parse()
                .map_err(|_| ParseValueError::new(raw, ty))?;
            Value::Float(parsed)
        }
        CanonicalType::Boolean => {
            let parsed = parse_boolean(trimmed)
                .or(match trimmed {
                    "1" => Some(true),
                    "0" => Some(false),
                    _ => None,
                })
                .ok_or_else(|| ParseValueError::new(raw, ty))?;
            Value::Boolean(parsed)
        }
        CanonicalType::Date => {
            Value::Date(parse_naive_date(trimmed).ok_or_else(|| ParseValueError::new(raw, ty))?)
        }
        CanonicalType::DateTime => {
            let parsed = parse_naive_datetime(trimmed)
                .or_else(|| parse_naive_date(trimmed).and_then(|d| d.and_hms_opt(0, 0, 0)))
                .ok_or_else(|| ParseValueError::new(raw, ty))?;
            Value::DateTime(parsed)
        }
        CanonicalType::Binary => {
            Value::Binary(hex_decode(trimmed).ok_or_else(|| ParseValueError::new(raw, ty))?)
        }
        CanonicalType::Text(Some(max)) => {
            if raw.chars().count() > *max as usize {
                return Err(ParseValueError::new(raw, ty));
            }
            Value::Text(raw.to_string())
        }
        CanonicalType::Text(None) | CanonicalType::Unknown => Value::Text(raw.to_string()),
    };
    Ok(Some(parsed))
}

pub fn integer_fits(value: i64, width: u8) -> bool {
    match width {
        8 => i8::try_from(value).is_ok(),
        16 => i16::try_from(value).is_ok(),
        32 => i32::try_from(value).is_ok(),
        _ => true,
    }
}

pub fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// Accepts plain hex as well as the `0x` prefix mdb-export emits.
pub fn hex_decode(value: &str) -> Option<Vec<u8>> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    if digits.len() % 2 != 0 {
        return None;
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(digits.get(i..i + 2)?, 16).ok())
        .collect()
}
