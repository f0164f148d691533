//! Application state for the API server.

use tapwire_proxy::ProxyMetrics;
use tapwire_storage::{Database, StatsAggregator};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Store handle.
    pub db: Database,
    /// Summary source.
    pub stats: StatsAggregator,
    /// Counters of a proxy running in the same process, if any.
    pub proxy_metrics: Option<ProxyMetrics>,
}

impl AppState {
    /// Creates a new application state with the given database.
    pub fn new(db: Database) -> Self {
        Self {
            stats: StatsAggregator::new(db.clone()),
            db,
            proxy_metrics: None,
        }
    }

    /// Also reports the proxy's counters from `/api/health`.
    pub fn with_proxy_metrics(mut self, metrics: ProxyMetrics) -> Self {
        self.proxy_metrics = Some(metrics);
        self
    }
}
