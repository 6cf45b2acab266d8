//! Explicit conversions between domain date values and their stored text form.
//!
//! Dates are stored as ISO `YYYY-MM-DD` so that SQLite's `julianday()` can
//! operate on them directly; timestamps are stored as RFC 3339 in UTC.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};

use crate::StoreError;

pub fn encode_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub fn encode_optional_date(date: Option<NaiveDate>) -> Option<String> {
    date.map(encode_date)
}

pub fn decode_date(column: &'static str, value: &str) -> Result<NaiveDate, StoreError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|err| StoreError::Decode {
        column,
        value: value.to_string(),
        reason: err.to_string(),
    })
}

pub fn decode_optional_date(
    column: &'static str,
    value: Option<&str>,
) -> Result<Option<NaiveDate>, StoreError> {
    value.map(|v| decode_date(column, v)).transpose()
}

pub fn encode_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn encode_optional_timestamp(timestamp: Option<DateTime<Utc>>) -> Option<String> {
    timestamp.map(encode_timestamp)
}

/// Accepts RFC 3339 as written by [`encode_timestamp`] and SQLite's own
/// `YYYY-MM-DD HH:MM:SS` (treated as UTC).
pub fn decode_timestamp(column: &'static str, value: &str) -> Result<DateTime<Utc>, StoreError> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|err| StoreError::Decode {
            column,
            value: value.to_string(),
            reason: err.to_string(),
        })
}

pub fn decode_optional_timestamp(
    column: &'static str,
    value: Option<&str>,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    value.map(|v| decode_timestamp(column, v)).transpose()
}
