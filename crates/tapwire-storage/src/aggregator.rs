//! Summary statistics over the store.

use tracing::info;

use crate::database::Database;
use crate::error::Result;
use crate::models::Summary;

/// Default number of recent articles in a summary.
pub const DEFAULT_RECENT_LIMIT: i64 = 5;

/// Read-only view producing [`Summary`] snapshots.
#[derive(Clone)]
pub struct StatsAggregator {
    db: Database,
    recent_limit: i64,
}

impl StatsAggregator {
    /// Creates an aggregator over `db`.
    pub fn new(db: Database) -> Self {
        Self {
            db,
            recent_limit: DEFAULT_RECENT_LIMIT,
        }
    }

    /// Sets how many recent articles a summary carries.
    pub fn with_recent_limit(mut self, limit: i64) -> Self {
        self.recent_limit = limit.max(0);
        self
    }

    /// Counts and recent articles from one consistent snapshot.
    pub fn summary(&self) -> Result<Summary> {
        self.db.summary(self.recent_limit)
    }

    /// Logs a one-line summary.
    pub fn log_summary(&self) -> Result<Summary> {
        let summary = self.summary()?;
        let health = self.db.health();

        info!(
            traffic = summary.traffic_count,
            instrumentation = summary.instrumentation_count,
            articles = summary.article_count,
            dropped = health.dropped_records,
            degraded = health.degraded,
            "Store summary"
        );

        Ok(summary)
    }
}
