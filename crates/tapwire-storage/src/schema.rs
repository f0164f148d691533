//! Database schema and migrations.

use rusqlite::Connection;
use tracing::info;

use crate::error::Result;

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version < SCHEMA_VERSION {
        info!(
            "Running migrations from version {} to {}",
            current_version, SCHEMA_VERSION
        );

        if current_version < 1 {
            migrate_v1(conn)?;
        }

        set_schema_version(conn, SCHEMA_VERSION)?;
        info!("Migrations complete");
    }

    Ok(())
}

/// Get the current schema version.
fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .ok();

    Ok(version.unwrap_or(0))
}

/// Set the schema version.
fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    Ok(())
}

/// Migration to version 1: the three append-only tables.
fn migrate_v1(conn: &Connection) -> Result<()> {
    info!("Applying migration v1: Initial schema");

    conn.execute(
        "CREATE TABLE IF NOT EXISTS network_traffic (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            connection_id TEXT NOT NULL,
            sequence INTEGER NOT NULL,
            direction TEXT NOT NULL,
            method TEXT NOT NULL,
            url TEXT NOT NULL,
            status_code INTEGER,
            headers TEXT NOT NULL DEFAULT '[]',
            body BLOB NOT NULL,
            truncated INTEGER NOT NULL DEFAULT 0,
            note TEXT
        )",
        [],
    )?;

    // One request and at most one response per exchange
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_traffic_exchange
         ON network_traffic (connection_id, sequence, direction)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS instrumentation_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            source_process_id INTEGER,
            hook_name TEXT NOT NULL,
            payload TEXT NOT NULL,
            success INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_instrumentation_hook
         ON instrumentation_events (hook_name)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS scraped_articles (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            url TEXT NOT NULL,
            title TEXT NOT NULL,
            content_excerpt TEXT NOT NULL,
            extracted_at TEXT NOT NULL,
            content_hash TEXT NOT NULL
        )",
        [],
    )?;

    // Dedup key for idempotent extraction
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_articles_url_hash
         ON scraped_articles (url, content_hash)",
        [],
    )?;

    Ok(())
}
