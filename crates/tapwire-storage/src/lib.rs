//! Tapwire Storage - SQLite persistence layer.
//!
//! This crate holds everything Tapwire captures:
//!
//! - Network traffic (one row per request and per response)
//! - Instrumentation events reported by the on-device agent
//! - Articles extracted from captured pages, deduplicated by content hash
//!
//! Writes are append-only and retried on transient errors; a write that keeps
//! failing is dropped, logged and counted in [`StoreHealth`].
//!
//! # Example
//!
//! ```no_run
//! use tapwire_storage::{Database, NewInstrumentationEvent, RecordKind, StatsAggregator};
//! use serde_json::json;
//!
//! let db = Database::in_memory().unwrap();
//!
//! db.append_instrumentation(&NewInstrumentationEvent::hook(
//!     Some(1234),
//!     "webview_load",
//!     json!({"url": "https://www.dawn.com/"}),
//! ))
//! .unwrap();
//!
//! assert_eq!(db.count(RecordKind::Instrumentation).unwrap(), 1);
//! let summary = StatsAggregator::new(db).summary().unwrap();
//! ```

mod aggregator;
mod database;
pub mod error;
pub mod models;
mod pool;
pub mod repository;
pub mod retry;
mod schema;

pub use aggregator::{StatsAggregator, DEFAULT_RECENT_LIMIT};
pub use database::{Database, DEGRADED_AFTER_FAILURES};
pub use error::{Result, StorageError};
pub use models::{
    Article, ArticleInsert, Direction, HeaderList, InstrumentationEvent, NewArticle,
    NewInstrumentationEvent, NewTraffic, RecordKind, Records, StoreHealth, Summary, TrafficRecord,
};
pub use pool::ConnectionPool;
pub use retry::{Backoff, RetryPolicy};
