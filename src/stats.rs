//! Process-wide pipeline counters
//!
//! Cheap atomic counters surfaced next to the cache and BM25 statistics so
//! the HTTP layer can expose a monitoring endpoint without touching the
//! pipeline internals.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct PipelineStats {
    queries: AtomicU64,
    cache_hits: AtomicU64,
    exact_code_hits: AtomicU64,
    degraded: AtomicU64,
    no_channels: AtomicU64,
}

/// Point-in-time snapshot of the counters
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub queries: u64,
    pub cache_hits: u64,
    pub exact_code_hits: u64,
    pub degraded: u64,
    pub no_channels: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_exact_code(&self) {
        self.exact_code_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_degraded(&self) {
        self.degraded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_no_channels(&self) {
        self.no_channels.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            queries: self.queries.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            exact_code_hits: self.exact_code_hits.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
            no_channels: self.no_channels.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = PipelineStats::new();
        stats.record_query();
        stats.record_query();
        stats.record_cache_hit();
        stats.record_degraded();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.queries, 2);
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.degraded, 1);
        assert_eq!(snapshot.no_channels, 0);
    }
}
