//! Persistence layer modules.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::{AppError, Result};

pub mod db;
pub mod ledger;
pub mod retention;
pub mod schema;
pub mod session_account_repo;

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;

/// Render a timestamp with fixed precision so lexical order is chronological.
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp column.
pub(crate) fn parse_ts(column: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid {column}: {e}")))
}

/// Parse an optional stored timestamp column.
pub(crate) fn parse_opt_ts(column: &str, raw: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(column, s)).transpose()
}

/// Convert a stored non-negative integer column.
pub(crate) fn to_u64(column: &str, value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| AppError::Db(format!("negative {column}: {value}")))
}

/// Convert an unsigned counter for storage.
pub(crate) fn to_i64(column: &str, value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| AppError::Db(format!("{column} out of range: {value}")))
}
