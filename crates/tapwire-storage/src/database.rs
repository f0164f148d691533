//! High-level database interface.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use directories::ProjectDirs;
use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::{info, warn};

use crate::error::{Result, StorageError};
use crate::models::{
    Article, ArticleInsert, InstrumentationEvent, NewArticle, NewInstrumentationEvent,
    NewTraffic, RecordKind, Records, StoreHealth, Summary, TrafficRecord,
};
use crate::pool::ConnectionPool;
use crate::repository::{ArticlesRepo, InstrumentationRepo, StatsRepo, TrafficRepo};
use crate::retry::RetryPolicy;

/// Consecutive dropped writes before the store reports itself degraded.
pub const DEGRADED_AFTER_FAILURES: u32 = 5;

/// Append-only store for traffic, instrumentation events and articles.
///
/// Cloning is cheap and every clone shares the same connection, so writers
/// from the proxy and the instrumentation bridge are serialized.
#[derive(Clone)]
pub struct Database {
    pool: ConnectionPool,
    retry: RetryPolicy,
    health: Arc<HealthTracker>,
}

impl Database {
    /// Create a new database in the default app data directory.
    pub fn new() -> Result<Self> {
        Self::with_path(Self::default_db_path()?)
    }

    /// Create a new database at a specific path.
    pub fn with_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        info!("Opening database at: {:?}", path);
        let pool = ConnectionPool::new(&path)?;

        Ok(Self::from_pool(pool))
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Ok(Self::from_pool(ConnectionPool::in_memory()?))
    }

    fn from_pool(pool: ConnectionPool) -> Self {
        Self {
            pool,
            retry: RetryPolicy::default(),
            health: Arc::new(HealthTracker::default()),
        }
    }

    /// Sets the retry policy for writes.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Get the default database path.
    pub fn default_db_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "tapwire", "tapwire")
            .ok_or_else(|| StorageError::Config("Could not determine app data directory".into()))?;

        Ok(proj_dirs.data_dir().join("tapwire.db"))
    }

    /// Runs a write under the connection lock with the retry policy.
    ///
    /// A write that still fails is dropped: the failure is logged, counted
    /// toward [`Database::health`] and returned to the caller.
    fn write<T>(
        &self,
        operation: &'static str,
        mut op: impl FnMut(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        let result = self.retry.run(operation, || {
            let mut conn = self.pool.get()?;
            op(&mut conn)
        });

        match &result {
            Ok(_) => self.health.record_success(),
            Err(e) => {
                self.health.record_failure(e);
                warn!(operation, error = %e, "Store write failed, record dropped");
            }
        }

        result
    }

    // === Appends ===

    /// Append a single traffic record.
    pub fn append_traffic(&self, record: &NewTraffic) -> Result<i64> {
        self.write("append_traffic", |conn| TrafficRepo::insert(conn, record))
    }

    /// Append both halves of an exchange atomically, request first.
    pub fn append_exchange(
        &self,
        request: &NewTraffic,
        response: &NewTraffic,
    ) -> Result<(i64, i64)> {
        self.write("append_exchange", |conn| {
            let tx = conn.transaction()?;
            let request_id = TrafficRepo::insert(&tx, request)?;
            let response_id = TrafficRepo::insert(&tx, response)?;
            tx.commit()?;
            Ok((request_id, response_id))
        })
    }

    /// Append an instrumentation event.
    pub fn append_instrumentation(&self, event: &NewInstrumentationEvent) -> Result<i64> {
        self.write("append_instrumentation", |conn| {
            InstrumentationRepo::insert(conn, event)
        })
    }

    /// Append an article unless the same `(url, content_hash)` is stored.
    pub fn append_article_if_absent(&self, article: &NewArticle) -> Result<ArticleInsert> {
        self.write("append_article", |conn| {
            let tx = conn.transaction()?;
            let outcome = ArticlesRepo::insert_if_absent(&tx, article)?;
            tx.commit()?;
            Ok(outcome)
        })
    }

    // === Queries ===

    /// Get a traffic record by ID.
    pub fn get_traffic(&self, id: i64) -> Result<Option<TrafficRecord>> {
        let conn = self.pool.get()?;
        TrafficRepo::get_by_id(&conn, id)
    }

    /// Get both halves of an exchange, request first.
    pub fn get_exchange(&self, connection_id: &str, sequence: i64) -> Result<Vec<TrafficRecord>> {
        let conn = self.pool.get()?;
        TrafficRepo::get_exchange(&conn, connection_id, sequence)
    }

    /// Newest traffic records first.
    pub fn recent_traffic(&self, limit: i64) -> Result<Vec<TrafficRecord>> {
        let conn = self.pool.get()?;
        TrafficRepo::get_recent(&conn, limit)
    }

    /// Newest instrumentation events first.
    pub fn recent_instrumentation(&self, limit: i64) -> Result<Vec<InstrumentationEvent>> {
        let conn = self.pool.get()?;
        InstrumentationRepo::get_recent(&conn, limit)
    }

    /// Newest articles first.
    pub fn recent_articles(&self, limit: i64) -> Result<Vec<Article>> {
        let conn = self.pool.get()?;
        ArticlesRepo::get_recent(&conn, limit)
    }

    /// Newest records of one kind.
    pub fn query_recent(&self, kind: RecordKind, limit: i64) -> Result<Records> {
        Ok(match kind {
            RecordKind::Traffic => Records::Traffic(self.recent_traffic(limit)?),
            RecordKind::Instrumentation => {
                Records::Instrumentation(self.recent_instrumentation(limit)?)
            }
            RecordKind::Article => Records::Article(self.recent_articles(limit)?),
        })
    }

    /// Count records of one kind.
    pub fn count(&self, kind: RecordKind) -> Result<i64> {
        let conn = self.pool.get()?;
        StatsRepo::count(&conn, kind)
    }

    /// Counts and recent articles from a single read transaction.
    pub fn summary(&self, recent_limit: i64) -> Result<Summary> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let summary = StatsRepo::summary(&tx, recent_limit)?;
        tx.commit()?;
        Ok(summary)
    }

    /// Write-path health.
    pub fn health(&self) -> StoreHealth {
        self.health.snapshot()
    }
}

/// Tracks write failures for [`Database::health`].
#[derive(Default)]
struct HealthTracker {
    consecutive_failures: AtomicU32,
    dropped_records: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl HealthTracker {
    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    fn record_failure(&self, error: &StorageError) {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        self.dropped_records.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = Some(error.to_string());
    }

    fn snapshot(&self) -> StoreHealth {
        let consecutive_failures = self.consecutive_failures.load(Ordering::Relaxed);
        StoreHealth {
            consecutive_failures,
            dropped_records: self.dropped_records.load(Ordering::Relaxed),
            last_error: self.last_error.lock().clone(),
            degraded: consecutive_failures >= DEGRADED_AFTER_FAILURES,
        }
    }
}
