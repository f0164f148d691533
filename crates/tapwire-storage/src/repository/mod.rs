//! Database repositories for each table.

pub mod articles;
pub mod instrumentation;
pub mod stats;
pub mod traffic;

pub use articles::ArticlesRepo;
pub use instrumentation::InstrumentationRepo;
pub use stats::StatsRepo;
pub use traffic::TrafficRepo;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};

use crate::error::Result;

/// Format a timestamp for storage.
///
/// Fixed-width RFC 3339 with microseconds so text order matches time order.
pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp.
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|dt| dt.and_utc())
        })
        .unwrap_or_else(|_| Utc::now())
}

/// Timestamp for the next row of `table`, never earlier than its newest row.
///
/// Callers hold the connection lock, so the clamp and the insert that
/// follows cannot interleave with another writer.
pub(crate) fn next_timestamp(
    conn: &Connection,
    table: &str,
    column: &str,
) -> Result<DateTime<Utc>> {
    let now = Utc::now();
    let last: Option<String> = conn
        .query_row(
            &format!("SELECT {column} FROM {table} ORDER BY id DESC LIMIT 1"),
            [],
            |row| row.get(0),
        )
        .optional()?;

    Ok(match last.map(|s| parse_datetime(&s)) {
        Some(prev) if prev > now => prev,
        _ => now,
    })
}
