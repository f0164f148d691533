//! API request and response models.

use serde::{Deserialize, Serialize};
use tapwire_proxy::MetricsSnapshot;
use tapwire_storage::{Records, StoreHealth};

/// Largest `limit` a listing accepts.
pub const MAX_LIMIT: i64 = 1000;

/// Query parameters for the record listings.
#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    /// Maximum number of records to return (default: 50).
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

/// Query parameters for GET /api/summary.
#[derive(Debug, Deserialize)]
pub struct SummaryQuery {
    /// Number of recent articles to include.
    pub recent: Option<i64>,
}

/// Response body for the record listings.
#[derive(Debug, Serialize)]
pub struct RecordsResponse {
    #[serde(flatten)]
    pub records: Records,
    /// Total rows of this kind in the store.
    pub total: i64,
}

/// Response body for GET /api/health.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok" or "degraded".
    pub status: &'static str,
    pub store: StoreHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<MetricsSnapshot>,
}
