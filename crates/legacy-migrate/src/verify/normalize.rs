//! Value comparison for differential validation.
//!
//! Strict mode compares values exactly and reports a type mismatch when
//! the two sides are of different kinds. Lenient mode (`ignoreMinorDifferences`)
//! applies these rules before deciding two values differ:
//! - Text: surrounding whitespace trimmed, CRLF treated as LF, case ignored
//! - Numbers: equal within an absolute tolerance of 1e-4, including numbers
//!   stored as text on either side
//! - Timestamps: equal when less than one second apart; dates compare as
//!   midnight, text is parsed when it looks like a timestamp
//! - Booleans: equal to 0/1 and to "true"/"false"
//! - NULL only ever equals NULL

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use rust_decimal::prelude::ToPrimitive;

use crate::core::SqlValue;

/// Absolute tolerance for numeric comparison.
pub const NUMERIC_TOLERANCE: f64 = 1e-4;

/// Maximum timestamp drift in milliseconds (exclusive).
pub const TIMESTAMP_TOLERANCE_MS: i64 = 1000;

/// Result of comparing one legacy value against one current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Equal,
    Different,
    TypeMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Null,
    Bool,
    Number,
    Text,
    Bytes,
    Uuid,
    Temporal,
}

fn family(value: &SqlValue) -> Family {
    match value {
        SqlValue::Null => Family::Null,
        SqlValue::Bool(_) => Family::Bool,
        SqlValue::Int(_) | SqlValue::Float(_) | SqlValue::Decimal(_) => Family::Number,
        SqlValue::Text(_) => Family::Text,
        SqlValue::Bytes(_) => Family::Bytes,
        SqlValue::Uuid(_) => Family::Uuid,
        SqlValue::DateTime(_) | SqlValue::Date(_) => Family::Temporal,
    }
}

/// Compare two values under the strict or lenient policy.
pub fn compare(legacy: &SqlValue, current: &SqlValue, lenient: bool) -> Comparison {
    match (legacy.is_null(), current.is_null()) {
        (true, true) => return Comparison::Equal,
        (true, false) | (false, true) => return Comparison::Different,
        _ => {}
    }
    if lenient {
        compare_lenient(legacy, current)
    } else {
        compare_strict(legacy, current)
    }
}

fn compare_strict(legacy: &SqlValue, current: &SqlValue) -> Comparison {
    if family(legacy) != family(current) {
        return Comparison::TypeMismatch;
    }
    let equal = match (legacy, current) {
        (SqlValue::Int(a), SqlValue::Int(b)) => a == b,
        (SqlValue::Decimal(a), SqlValue::Decimal(b)) => a == b,
        (SqlValue::Date(a), SqlValue::Date(b)) => a == b,
        (SqlValue::DateTime(a), SqlValue::DateTime(b)) => a == b,
        (a, b) if family(a) == Family::Number => as_number(a) == as_number(b),
        (a, b) if family(a) == Family::Temporal => as_datetime(a) == as_datetime(b),
        (a, b) => a == b,
    };
    if equal {
        Comparison::Equal
    } else {
        Comparison::Different
    }
}

fn compare_lenient(legacy: &SqlValue, current: &SqlValue) -> Comparison {
    let equal = if let (Some(a), Some(b)) = (as_bool_strict(legacy), as_bool_strict(current)) {
        // At least one side is a real boolean; the other may be 0/1 or text.
        a == b
    } else if let (Some(a), Some(b)) = (as_number(legacy), as_number(current)) {
        (a - b).abs() < NUMERIC_TOLERANCE
    } else if let (Some(a), Some(b)) = (as_datetime(legacy), as_datetime(current)) {
        (a - b).num_milliseconds().abs() < TIMESTAMP_TOLERANCE_MS
    } else {
        normalize_text(&legacy.to_string()) == normalize_text(&current.to_string())
    };
    if equal {
        Comparison::Equal
    } else {
        Comparison::Different
    }
}

/// Boolean view of a value, only when one of the two sides could be a
/// boolean column. Used as the first lenient rule so that `true` matches
/// `1` and `"TRUE"`.
fn as_bool_strict(value: &SqlValue) -> Option<bool> {
    match value {
        SqlValue::Bool(b) => Some(*b),
        SqlValue::Int(0) => Some(false),
        SqlValue::Int(1) => Some(true),
        SqlValue::Text(t) => match t.trim().to_ascii_lowercase().as_str() {
            "true" | "t" => Some(true),
            "false" | "f" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Numeric view of a value, including numeric text.
pub fn as_number(value: &SqlValue) -> Option<f64> {
    match value {
        SqlValue::Int(i) => Some(*i as f64),
        SqlValue::Float(f) => Some(*f),
        SqlValue::Decimal(d) => d.to_f64(),
        SqlValue::Text(t) => {
            let t = t.trim();
            if t.is_empty() {
                return None;
            }
            t.parse::<f64>().ok().filter(|f| f.is_finite())
        }
        _ => None,
    }
}

/// Timestamp view of a value, including timestamp text.
pub fn as_datetime(value: &SqlValue) -> Option<NaiveDateTime> {
    match value {
        SqlValue::DateTime(dt) => Some(*dt),
        SqlValue::Date(d) => d.and_hms_opt(0, 0, 0),
        SqlValue::Text(t) => parse_datetime(t.trim()),
        _ => None,
    }
}

fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    if text.len() < 10 {
        return None;
    }
    const FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%m/%d/%Y %H:%M:%S"];
    for format in FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return Some(dt);
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.naive_utc());
    }
    // PostgreSQL timestamptz text: "2024-01-02 03:04:05+00"
    if let Ok(dt) = DateTime::parse_from_str(&format!("{}00", text), "%Y-%m-%d %H:%M:%S%.f%z") {
        return Some(dt.naive_utc());
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Text form used for lenient comparison and for matching row keys.
pub fn normalize_text(text: &str) -> String {
    text.replace("\r\n", "\n").trim().to_lowercase()
}

/// Canonical key text for one value, so that keyed matching agrees with
/// the comparison policy (`1`, `1.0` and `"1"` are the same key when lenient).
pub fn key_text(value: &SqlValue, lenient: bool) -> String {
    if !lenient {
        return value.to_string();
    }
    if value.is_null() {
        return "NULL".to_string();
    }
    if let Some(n) = as_number(value) {
        if n.fract() == 0.0 && n.abs() < 9.0e15 {
            return format!("{}", n as i64);
        }
        return format!("{}", n);
    }
    normalize_text(&value.to_string())
}
