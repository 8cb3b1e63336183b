//! Typed encode/decode between DB scalar values and JSON-friendly values
//! (spec §4.4).
//!
//! `decode(encode(x)) == x` for every supported typed value and for `null`.
//! Unknown fields in a payload are simply ignored by callers (the codec
//! itself only ever looks at the field it's asked to decode).

use base64::Engine as _;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde_json::Value as Json;

use crate::error::{Result, SyncError};

/// The declared type of a tracked column. Drives both the wire encoding
/// (§4.4) and the SQL bind/extract performed by a [`crate::registry::TrackedTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Bool,
    Date,
    DateTime,
    Time,
    /// Arbitrary-precision decimal, carried as a string on the wire.
    Numeric,
    Binary,
}

/// A scalar value as read from or written to the database, before/after
/// JSON encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Bool(bool),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Time(NaiveTime),
    Numeric(String),
    Binary(Vec<u8>),
}

/// Encodes a scalar value into its JSON-friendly representation.
///
/// | Type | Encoding |
/// |---|---|
/// | Date | `[y, m, d]` |
/// | DateTime | `[y, m, d, H, M, S, µs]` |
/// | Time | `[H, M, S, µs]` |
/// | Binary | base64 (standard) |
/// | Numeric | decimal string |
/// | Other scalars | pass-through |
pub fn encode(value: &SqlValue) -> Json {
    match value {
        SqlValue::Null => Json::Null,
        SqlValue::Integer(i) => Json::from(*i),
        SqlValue::Real(f) => Json::from(*f),
        SqlValue::Text(s) => Json::from(s.clone()),
        SqlValue::Bool(b) => Json::from(*b),
        SqlValue::Numeric(s) => Json::from(s.clone()),
        SqlValue::Binary(bytes) => {
            Json::from(base64::engine::general_purpose::STANDARD.encode(bytes))
        }
        SqlValue::Date(d) => Json::from(vec![d.year() as i64, d.month() as i64, d.day() as i64]),
        SqlValue::DateTime(dt) => Json::from(vec![
            dt.year() as i64,
            dt.month() as i64,
            dt.day() as i64,
            dt.hour() as i64,
            dt.minute() as i64,
            dt.second() as i64,
            dt.nanosecond() as i64 / 1000,
        ]),
        SqlValue::Time(t) => Json::from(vec![
            t.hour() as i64,
            t.minute() as i64,
            t.second() as i64,
            t.nanosecond() as i64 / 1000,
        ]),
    }
}

/// Decodes a JSON-friendly value back into a typed scalar, given the
/// column's declared [`ColumnType`]. `null` always decodes to `SqlValue::Null`.
pub fn decode(ty: ColumnType, value: &Json) -> Result<SqlValue> {
    if value.is_null() {
        return Ok(SqlValue::Null);
    }
    match ty {
        ColumnType::Integer => value
            .as_i64()
            .map(SqlValue::Integer)
            .ok_or_else(|| type_err("integer", value)),
        ColumnType::Real => value
            .as_f64()
            .map(SqlValue::Real)
            .ok_or_else(|| type_err("real", value)),
        ColumnType::Text => value
            .as_str()
            .map(|s| SqlValue::Text(s.to_string()))
            .ok_or_else(|| type_err("text", value)),
        ColumnType::Bool => value
            .as_bool()
            .map(SqlValue::Bool)
            .ok_or_else(|| type_err("bool", value)),
        ColumnType::Numeric => value
            .as_str()
            .map(|s| SqlValue::Numeric(s.to_string()))
            .ok_or_else(|| type_err("numeric string", value)),
        ColumnType::Binary => {
            let s = value.as_str().ok_or_else(|| type_err("base64 string", value))?;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(s)
                .map_err(|e| SyncError::Value(format!("invalid base64: {e}")))?;
            Ok(SqlValue::Binary(bytes))
        }
        ColumnType::Date => {
            let parts = int_array(value, 3, "date")?;
            NaiveDate::from_ymd_opt(parts[0] as i32, parts[1] as u32, parts[2] as u32)
                .map(SqlValue::Date)
                .ok_or_else(|| SyncError::Value("invalid date".into()))
        }
        ColumnType::DateTime => {
            let parts = int_array(value, 7, "datetime")?;
            let date = NaiveDate::from_ymd_opt(parts[0] as i32, parts[1] as u32, parts[2] as u32)
                .ok_or_else(|| SyncError::Value("invalid datetime date part".into()))?;
            let time = NaiveTime::from_hms_micro_opt(
                parts[3] as u32,
                parts[4] as u32,
                parts[5] as u32,
                parts[6] as u32,
            )
            .ok_or_else(|| SyncError::Value("invalid datetime time part".into()))?;
            Ok(SqlValue::DateTime(NaiveDateTime::new(date, time)))
        }
        ColumnType::Time => {
            let parts = int_array(value, 4, "time")?;
            NaiveTime::from_hms_micro_opt(
                parts[0] as u32,
                parts[1] as u32,
                parts[2] as u32,
                parts[3] as u32,
            )
            .map(SqlValue::Time)
            .ok_or_else(|| SyncError::Value("invalid time".into()))
        }
    }
}

fn int_array(value: &Json, len: usize, what: &str) -> Result<Vec<i64>> {
    let arr = value
        .as_array()
        .ok_or_else(|| SyncError::Value(format!("expected {len}-element array for {what}")))?;
    if arr.len() != len {
        return Err(SyncError::Value(format!(
            "expected {len} elements for {what}, got {}",
            arr.len()
        )));
    }
    arr.iter()
        .map(|v| v.as_i64().ok_or_else(|| SyncError::Value(format!("non-integer element in {what}"))))
        .collect()
}

fn type_err(expected: &str, got: &Json) -> SyncError {
    SyncError::Type(format!("expected {expected}, got {got}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(ty: ColumnType, value: SqlValue) {
        let encoded = encode(&value);
        let decoded = decode(ty, &encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn roundtrips_scalars() {
        roundtrip(ColumnType::Integer, SqlValue::Integer(42));
        roundtrip(ColumnType::Real, SqlValue::Real(3.5));
        roundtrip(ColumnType::Text, SqlValue::Text("hi".into()));
        roundtrip(ColumnType::Bool, SqlValue::Bool(true));
        roundtrip(ColumnType::Numeric, SqlValue::Numeric("12.3400".into()));
        roundtrip(ColumnType::Binary, SqlValue::Binary(vec![1, 2, 3, 255]));
    }

    #[test]
    fn roundtrips_date_time() {
        roundtrip(
            ColumnType::Date,
            SqlValue::Date(NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()),
        );
        roundtrip(
            ColumnType::Time,
            SqlValue::Time(NaiveTime::from_hms_micro_opt(13, 45, 9, 12).unwrap()),
        );
        roundtrip(
            ColumnType::DateTime,
            SqlValue::DateTime(NaiveDateTime::new(
                NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(),
                NaiveTime::from_hms_micro_opt(13, 45, 9, 12).unwrap(),
            )),
        );
    }

    #[test]
    fn roundtrips_null() {
        for ty in [
            ColumnType::Integer,
            ColumnType::Real,
            ColumnType::Text,
            ColumnType::Bool,
            ColumnType::Date,
            ColumnType::DateTime,
            ColumnType::Time,
            ColumnType::Numeric,
            ColumnType::Binary,
        ] {
            assert_eq!(decode(ty, &Json::Null).unwrap(), SqlValue::Null);
        }
    }

    #[test]
    fn datetime_keeps_time_of_day() {
        // Regression: one historical revision encoded DateTime as an
        // ordinal day count, losing the time of day entirely.
        let dt = NaiveDateTime::new(
            NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
            NaiveTime::from_hms_opt(23, 59, 1).unwrap(),
        );
        let encoded = encode(&SqlValue::DateTime(dt));
        assert_eq!(encoded, serde_json::json!([2020, 1, 1, 23, 59, 1, 0]));
    }
}
