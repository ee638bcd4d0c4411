//! Timestamp encoding for TEXT columns.
//!
//! Every timestamp is stored as RFC 3339 UTC with millisecond precision and a
//! `Z` suffix, so string comparison in SQL matches chronological order.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;

pub fn to_sql(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn to_sql_opt(at: Option<DateTime<Utc>>) -> Option<String> {
    at.map(to_sql)
}

/// Parse a timestamp read from column `idx`.
pub fn parse(idx: usize, text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub fn parse_opt(idx: usize, text: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    text.map(|s| parse(idx, &s)).transpose()
}

/// Read a required timestamp column.
pub fn get(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    parse(idx, &text)
}

/// Read a nullable timestamp column.
pub fn get_opt(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    parse_opt(idx, row.get(idx)?)
}
