//! Data models for storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which half of an exchange a traffic record captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Client to upstream.
    Request,
    /// Upstream to client.
    Response,
}

impl Direction {
    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Request => "request",
            Direction::Response => "response",
        }
    }

    /// Parse from database string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "request" => Some(Direction::Request),
            "response" => Some(Direction::Response),
            _ => None,
        }
    }
}

/// Ordered header list; duplicates are kept in wire order.
pub type HeaderList = Vec<(String, String)>;

/// A stored HTTP message snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficRecord {
    /// Unique identifier.
    pub id: i64,
    /// Insert time, non-decreasing across the traffic table.
    pub timestamp: DateTime<Utc>,
    /// Client connection the exchange arrived on.
    pub connection_id: String,
    /// Exchange number within the connection, starting at 1.
    pub sequence: i64,
    /// Request or response.
    pub direction: Direction,
    /// Request method (repeated on the response row).
    pub method: String,
    /// Absolute request URL.
    pub url: String,
    /// Response status code; `None` for requests.
    pub status_code: Option<u16>,
    /// Headers in wire order.
    pub headers: HeaderList,
    /// Captured body prefix.
    #[serde(skip_serializing)]
    pub body: Vec<u8>,
    /// Length of the captured prefix.
    pub body_len: usize,
    /// Whether the body was cut at the capture bound or never completed.
    pub truncated: bool,
    /// Degradation note, e.g. why TLS interception was skipped.
    pub note: Option<String>,
}

/// Parameters for appending a traffic record.
#[derive(Debug, Clone)]
pub struct NewTraffic {
    pub connection_id: String,
    pub sequence: i64,
    pub direction: Direction,
    pub method: String,
    pub url: String,
    pub status_code: Option<u16>,
    pub headers: HeaderList,
    pub body: Vec<u8>,
    pub truncated: bool,
    pub note: Option<String>,
}

/// A runtime event reported by the instrumentation agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentationEvent {
    /// Unique identifier.
    pub id: i64,
    /// Insert time, non-decreasing across the events table.
    pub timestamp: DateTime<Utc>,
    /// Process the agent is attached to, when known.
    pub source_process_id: Option<i64>,
    /// Hook that fired, or a bridge state such as `attach`.
    pub hook_name: String,
    /// Agent payload, stored verbatim.
    pub payload: serde_json::Value,
    /// False for failed attaches and malformed agent output.
    pub success: bool,
}

/// Parameters for appending an instrumentation event.
#[derive(Debug, Clone)]
pub struct NewInstrumentationEvent {
    pub source_process_id: Option<i64>,
    pub hook_name: String,
    pub payload: serde_json::Value,
    pub success: bool,
}

impl NewInstrumentationEvent {
    /// A successful hook event.
    pub fn hook(
        source_process_id: Option<i64>,
        hook_name: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            source_process_id,
            hook_name: hook_name.into(),
            payload,
            success: true,
        }
    }

    /// A failed event (attach failure, malformed payload).
    pub fn failure(
        source_process_id: Option<i64>,
        hook_name: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            success: false,
            ..Self::hook(source_process_id, hook_name, payload)
        }
    }
}

/// An article extracted from a captured HTML page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    /// Unique identifier.
    pub id: i64,
    /// Page URL.
    pub url: String,
    /// Page title.
    pub title: String,
    /// Leading block text, bounded.
    pub content_excerpt: String,
    /// Insert time, non-decreasing across the articles table.
    pub extracted_at: DateTime<Utc>,
    /// SHA-256 hex of the normalized page text.
    pub content_hash: String,
}

/// Parameters for appending an article.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewArticle {
    pub url: String,
    pub title: String,
    pub content_excerpt: String,
    pub content_hash: String,
}

/// Outcome of a deduplicating article insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArticleInsert {
    /// A new row was written.
    Inserted(i64),
    /// A row with the same `(url, content_hash)` already existed.
    Existing(i64),
}

impl ArticleInsert {
    /// The row id, whether new or existing.
    pub fn id(&self) -> i64 {
        match self {
            ArticleInsert::Inserted(id) | ArticleInsert::Existing(id) => *id,
        }
    }

    /// Whether a new row was written.
    pub fn is_new(&self) -> bool {
        matches!(self, ArticleInsert::Inserted(_))
    }
}

/// The three record kinds held by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Traffic,
    Instrumentation,
    Article,
}

/// Result of [`crate::Database::query_recent`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "records", rename_all = "snake_case")]
pub enum Records {
    Traffic(Vec<TrafficRecord>),
    Instrumentation(Vec<InstrumentationEvent>),
    Article(Vec<Article>),
}

impl Records {
    /// Number of records returned.
    pub fn len(&self) -> usize {
        match self {
            Records::Traffic(r) => r.len(),
            Records::Instrumentation(r) => r.len(),
            Records::Article(r) => r.len(),
        }
    }

    /// Whether no records were returned.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Point-in-time aggregate over the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub traffic_count: i64,
    pub instrumentation_count: i64,
    pub article_count: i64,
    /// Newest first.
    pub recent_articles: Vec<Article>,
}

/// Write-path health as seen by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreHealth {
    /// Failed writes since the last success.
    pub consecutive_failures: u32,
    /// Records dropped since the store was opened.
    pub dropped_records: u64,
    /// Most recent write error.
    pub last_error: Option<String>,
    /// True once consecutive failures reach the degraded threshold.
    pub degraded: bool,
}
