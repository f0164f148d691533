//! Instrumentation events repository.

use rusqlite::{params, Connection, Row};

use super::{format_datetime, next_timestamp, parse_datetime};
use crate::error::Result;
use crate::models::{InstrumentationEvent, NewInstrumentationEvent};

/// Repository for agent-reported runtime events.
pub struct InstrumentationRepo;

impl InstrumentationRepo {
    /// Insert an event.
    pub fn insert(conn: &Connection, event: &NewInstrumentationEvent) -> Result<i64> {
        let timestamp = next_timestamp(conn, "instrumentation_events", "timestamp")?;

        conn.execute(
            "INSERT INTO instrumentation_events
                (timestamp, source_process_id, hook_name, payload, success)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                format_datetime(&timestamp),
                event.source_process_id,
                event.hook_name,
                serde_json::to_string(&event.payload)?,
                event.success,
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    /// Get the newest events first.
    pub fn get_recent(conn: &Connection, limit: i64) -> Result<Vec<InstrumentationEvent>> {
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, source_process_id, hook_name, payload, success
             FROM instrumentation_events ORDER BY id DESC LIMIT ?1",
        )?;

        let events = stmt
            .query_map([limit], map_row)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(events)
    }

    /// Count all events.
    pub fn count(conn: &Connection) -> Result<i64> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM instrumentation_events",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<InstrumentationEvent> {
    let payload = serde_json::from_str(&row.get::<_, String>(4)?).unwrap_or_default();

    Ok(InstrumentationEvent {
        id: row.get(0)?,
        timestamp: parse_datetime(&row.get::<_, String>(1)?),
        source_process_id: row.get(2)?,
        hook_name: row.get(3)?,
        payload,
        success: row.get(5)?,
    })
}
