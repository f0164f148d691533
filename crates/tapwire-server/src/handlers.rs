//! API route handlers.

use axum::extract::{Path, Query, State};
use axum::Json;
use tapwire_storage::{RecordKind, Summary, TrafficRecord};
use tracing::debug;

use crate::error::{ApiError, Result};
use crate::models::{
    HealthResponse, LimitQuery, RecordsResponse, SummaryQuery, MAX_LIMIT,
};
use crate::state::AppState;

/// GET /api/summary - Counts and recent articles.
pub async fn get_summary(
    State(state): State<AppState>,
    Query(query): Query<SummaryQuery>,
) -> Result<Json<Summary>> {
    let summary = match query.recent {
        Some(recent) => state
            .stats
            .clone()
            .with_recent_limit(check_limit(recent)?)
            .summary()?,
        None => state.stats.summary()?,
    };

    Ok(Json(summary))
}

/// GET /api/health - Store health and proxy counters.
pub async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let store = state.db.health();

    Json(HealthResponse {
        status: if store.degraded { "degraded" } else { "ok" },
        store,
        proxy: state.proxy_metrics.as_ref().map(|m| m.snapshot()),
    })
}

/// GET /api/traffic - Recent captured messages.
pub async fn get_traffic(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<RecordsResponse>> {
    recent(&state, RecordKind::Traffic, query.limit)
}

/// GET /api/traffic/{id} - One captured message.
pub async fn get_traffic_record(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<TrafficRecord>> {
    state
        .db
        .get_traffic(id)?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("traffic record {id}")))
}

/// GET /api/events - Recent instrumentation events.
pub async fn get_events(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<RecordsResponse>> {
    recent(&state, RecordKind::Instrumentation, query.limit)
}

/// GET /api/articles - Recent extracted articles.
pub async fn get_articles(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<RecordsResponse>> {
    recent(&state, RecordKind::Article, query.limit)
}

fn recent(state: &AppState, kind: RecordKind, limit: i64) -> Result<Json<RecordsResponse>> {
    let limit = check_limit(limit)?;
    debug!(?kind, limit, "Listing records");

    Ok(Json(RecordsResponse {
        records: state.db.query_recent(kind, limit)?,
        total: state.db.count(kind)?,
    }))
}

fn check_limit(limit: i64) -> Result<i64> {
    if limit < 0 {
        return Err(ApiError::BadRequest(format!("limit must not be negative: {limit}")));
    }
    Ok(limit.min(MAX_LIMIT))
}
