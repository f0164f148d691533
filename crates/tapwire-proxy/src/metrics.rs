//! Operational counters for a running proxy.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Lock-free counters shared by every connection task.
///
/// Cloning shares the underlying counters.
#[derive(Debug, Clone, Default)]
pub struct ProxyMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    connections_accepted: AtomicU64,
    active_connections: AtomicUsize,
    exchanges_recorded: AtomicU64,
    records_dropped: AtomicU64,
    extraction_failures: AtomicU64,
    articles_extracted: AtomicU64,
    tls_degraded: AtomicU64,
}

/// Point-in-time copy of [`ProxyMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub connections_accepted: u64,
    pub active_connections: usize,
    pub exchanges_recorded: u64,
    pub records_dropped: u64,
    pub extraction_failures: u64,
    pub articles_extracted: u64,
    pub tls_degraded: u64,
}

impl ProxyMetrics {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts an accepted connection; the guard marks it inactive on drop.
    pub fn connection_opened(&self) -> ActiveConnection {
        self.inner
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);
        self.inner.active_connections.fetch_add(1, Ordering::Relaxed);
        ActiveConnection {
            metrics: self.clone(),
        }
    }

    pub fn exchange_recorded(&self) {
        self.inner.exchanges_recorded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.inner.records_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn extraction_failed(&self) {
        self.inner
            .extraction_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn article_extracted(&self) {
        self.inner.articles_extracted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tls_degraded(&self) {
        self.inner.tls_degraded.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = &self.inner;
        MetricsSnapshot {
            connections_accepted: inner.connections_accepted.load(Ordering::Relaxed),
            active_connections: inner.active_connections.load(Ordering::Relaxed),
            exchanges_recorded: inner.exchanges_recorded.load(Ordering::Relaxed),
            records_dropped: inner.records_dropped.load(Ordering::Relaxed),
            extraction_failures: inner.extraction_failures.load(Ordering::Relaxed),
            articles_extracted: inner.articles_extracted.load(Ordering::Relaxed),
            tls_degraded: inner.tls_degraded.load(Ordering::Relaxed),
        }
    }
}

/// Held by a connection task for its lifetime.
#[derive(Debug)]
pub struct ActiveConnection {
    metrics: ProxyMetrics,
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.metrics
            .inner
            .active_connections
            .fetch_sub(1, Ordering::Relaxed);
    }
}
