//! Network traffic repository.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{format_datetime, next_timestamp, parse_datetime};
use crate::error::Result;
use crate::models::{Direction, HeaderList, NewTraffic, TrafficRecord};

const SELECT_COLUMNS: &str = "SELECT id, timestamp, connection_id, sequence, direction, method,
    url, status_code, headers, body, truncated, note FROM network_traffic";

/// Repository for captured HTTP messages.
pub struct TrafficRepo;

impl TrafficRepo {
    /// Insert a traffic record.
    pub fn insert(conn: &Connection, record: &NewTraffic) -> Result<i64> {
        let timestamp = next_timestamp(conn, "network_traffic", "timestamp")?;
        let headers = serde_json::to_string(&record.headers)?;

        conn.execute(
            "INSERT INTO network_traffic
                (timestamp, connection_id, sequence, direction, method, url, status_code,
                 headers, body, truncated, note)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                format_datetime(&timestamp),
                record.connection_id,
                record.sequence,
                record.direction.as_str(),
                record.method,
                record.url,
                record.status_code,
                headers,
                record.body,
                record.truncated,
                record.note,
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    /// Get a record by ID.
    pub fn get_by_id(conn: &Connection, id: i64) -> Result<Option<TrafficRecord>> {
        let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE id = ?1"))?;
        let record = stmt.query_row([id], map_row).optional()?;
        Ok(record)
    }

    /// Get the newest records first.
    pub fn get_recent(conn: &Connection, limit: i64) -> Result<Vec<TrafficRecord>> {
        let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY id DESC LIMIT ?1"))?;

        let records = stmt
            .query_map([limit], map_row)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(records)
    }

    /// Get both halves of one exchange, request first.
    pub fn get_exchange(
        conn: &Connection,
        connection_id: &str,
        sequence: i64,
    ) -> Result<Vec<TrafficRecord>> {
        let mut stmt = conn.prepare(&format!(
            "{SELECT_COLUMNS} WHERE connection_id = ?1 AND sequence = ?2 ORDER BY id ASC"
        ))?;

        let records = stmt
            .query_map(params![connection_id, sequence], map_row)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(records)
    }

    /// Count all records.
    pub fn count(conn: &Connection) -> Result<i64> {
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM network_traffic", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<TrafficRecord> {
    let headers: HeaderList = serde_json::from_str(&row.get::<_, String>(8)?).unwrap_or_default();
    let body: Vec<u8> = row.get(9)?;

    Ok(TrafficRecord {
        id: row.get(0)?,
        timestamp: parse_datetime(&row.get::<_, String>(1)?),
        connection_id: row.get(2)?,
        sequence: row.get(3)?,
        direction: row
            .get::<_, String>(4)
            .ok()
            .and_then(|s| Direction::parse(&s))
            .unwrap_or(Direction::Request),
        method: row.get(5)?,
        url: row.get(6)?,
        status_code: row
            .get::<_, Option<i64>>(7)?
            .and_then(|code| u16::try_from(code).ok()),
        headers,
        body_len: body.len(),
        body,
        truncated: row.get(10)?,
        note: row.get(11)?,
    })
}
