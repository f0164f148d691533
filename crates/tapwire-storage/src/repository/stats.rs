//! Aggregate statistics repository.

use rusqlite::Connection;

use super::{ArticlesRepo, InstrumentationRepo, TrafficRepo};
use crate::error::Result;
use crate::models::{RecordKind, Summary};

/// Repository for read-only aggregates.
pub struct StatsRepo;

impl StatsRepo {
    /// Count rows of one kind.
    pub fn count(conn: &Connection, kind: RecordKind) -> Result<i64> {
        match kind {
            RecordKind::Traffic => TrafficRepo::count(conn),
            RecordKind::Instrumentation => InstrumentationRepo::count(conn),
            RecordKind::Article => ArticlesRepo::count(conn),
        }
    }

    /// Build a summary.
    ///
    /// Consistent only when `conn` is a transaction; see
    /// [`crate::Database::summary`].
    pub fn summary(conn: &Connection, recent_limit: i64) -> Result<Summary> {
        Ok(Summary {
            traffic_count: TrafficRepo::count(conn)?,
            instrumentation_count: InstrumentationRepo::count(conn)?,
            article_count: ArticlesRepo::count(conn)?,
            recent_articles: ArticlesRepo::get_recent(conn, recent_limit)?,
        })
    }
}
