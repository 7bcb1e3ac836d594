//! Semantic result cache
//!
//! Short-circuits the pipeline for semantically equivalent queries: an
//! exact-string match returns immediately, otherwise the query embedding is
//! compared against every stored entry and the best match above the
//! similarity threshold wins. Eviction is least-recently-used, expiry is
//! TTL-based, and all access is guarded by one coarse lock — throughput is
//! dominated by the pipeline, not the cache.

use crate::embedding::cosine_similarity;
use ahash::AHashMap;
use serde::Serialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Single cache entry with access metadata
struct CacheEntry<T> {
    query_embedding: Vec<f32>,
    value: T,
    created_at: Instant,
    last_access: Instant,
    access_count: u64,
}

#[derive(Default)]
struct Counters {
    hits: u64,
    misses: u64,
    evictions: u64,
    expired: u64,
    total_queries: u64,
}

struct CacheInner<T> {
    entries: AHashMap<String, CacheEntry<T>>,
    counters: Counters,
}

/// Cache statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub expired: u64,
    pub total_queries: u64,
}

/// Thread-safe semantic cache with LRU eviction and TTL expiry
pub struct SemanticCache<T> {
    inner: Mutex<CacheInner<T>>,
    max_size: usize,
    ttl: Duration,
    similarity_threshold: f32,
}

impl<T: Clone> SemanticCache<T> {
    pub fn new(max_size: usize, ttl: Duration, similarity_threshold: f32) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: AHashMap::with_capacity(max_size),
                counters: Counters::default(),
            }),
            max_size,
            ttl,
            similarity_threshold,
        }
    }

    /// Look up a cached value: exact string match first, then the best
    /// cosine match at or above the threshold. Hits refresh `last_access`.
    pub fn get(&self, question: &str, query_embedding: &[f32]) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        inner.counters.total_queries += 1;

        // Exact match fast path
        let exact_expired = inner
            .entries
            .get(question)
            .map(|e| now.duration_since(e.created_at) > self.ttl);
        match exact_expired {
            Some(true) => {
                inner.entries.remove(question);
                inner.counters.expired += 1;
                inner.counters.misses += 1;
                return None;
            }
            Some(false) => {
                let entry = inner.entries.get_mut(question).unwrap();
                entry.last_access = now;
                entry.access_count += 1;
                let value = entry.value.clone();
                inner.counters.hits += 1;
                return Some(value);
            }
            None => {}
        }

        // Semantic match: scan every live entry under the lock
        let mut best: Option<(String, f32)> = None;
        for (key, entry) in &inner.entries {
            if now.duration_since(entry.created_at) > self.ttl {
                continue;
            }
            let similarity = cosine_similarity(query_embedding, &entry.query_embedding);
            if best.as_ref().map_or(true, |(_, s)| similarity > *s) {
                best = Some((key.clone(), similarity));
            }
        }

        if let Some((key, similarity)) = best {
            if similarity >= self.similarity_threshold {
                let entry = inner.entries.get_mut(&key).unwrap();
                entry.last_access = now;
                entry.access_count += 1;
                let value = entry.value.clone();
                inner.counters.hits += 1;
                tracing::debug!(similarity, "Semantic cache hit");
                return Some(value);
            }
        }

        inner.counters.misses += 1;
        None
    }

    /// Store a value, evicting the least-recently-used entry when full
    pub fn put(&self, question: &str, query_embedding: Vec<f32>, value: T) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();

        if !inner.entries.contains_key(question) && inner.entries.len() >= self.max_size {
            let lru_key = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone());
            if let Some(key) = lru_key {
                inner.entries.remove(&key);
                inner.counters.evictions += 1;
            }
        }

        inner.entries.insert(
            question.to_string(),
            CacheEntry {
                query_embedding,
                value,
                created_at: now,
                last_access: now,
                access_count: 0,
            },
        );
    }

    /// Drop every entry
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
    }

    /// Remove expired entries, returning how many were dropped
    pub fn clear_expired(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let ttl = self.ttl;

        let before = inner.entries.len();
        inner
            .entries
            .retain(|_, entry| now.duration_since(entry.created_at) <= ttl);
        let removed = before - inner.entries.len();
        inner.counters.expired += removed as u64;

        if removed > 0 {
            tracing::debug!(removed, "Cleared expired cache entries");
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        let c = &inner.counters;
        CacheStats {
            size: inner.entries.len(),
            max_size: self.max_size,
            hits: c.hits,
            misses: c.misses,
            hit_rate: if c.total_queries > 0 {
                c.hits as f64 / c.total_queries as f64
            } else {
                0.0
            },
            evictions: c.evictions,
            expired: c.expired,
            total_queries: c.total_queries,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_vector(dim: usize, axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[axis] = 1.0;
        v
    }

    fn cache(max_size: usize, ttl: Duration) -> SemanticCache<String> {
        SemanticCache::new(max_size, ttl, 0.92)
    }

    #[test]
    fn test_exact_hit_idempotent() {
        let cache = cache(10, Duration::from_secs(60));
        let emb = unit_vector(8, 0);

        cache.put("đăng ký kết hôn cần giấy tờ gì", emb.clone(), "kết quả".to_string());

        for _ in 0..5 {
            let hit = cache.get("đăng ký kết hôn cần giấy tờ gì", &emb);
            assert_eq!(hit.as_deref(), Some("kết quả"));
        }

        let stats = cache.stats();
        assert_eq!(stats.hits, 5);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn test_semantic_hit() {
        let cache = cache(10, Duration::from_secs(60));
        cache.put("câu hỏi một", vec![1.0, 0.0, 0.0], "kết quả".to_string());

        // Nearly identical embedding, different wording
        let similar = vec![0.999, 0.04, 0.0];
        let hit = cache.get("câu hỏi một viết khác", &similar);
        assert_eq!(hit.as_deref(), Some("kết quả"));
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_semantic_miss_below_threshold() {
        let cache = cache(10, Duration::from_secs(60));
        cache.put("câu hỏi một", unit_vector(4, 0), "kết quả".to_string());

        let miss = cache.get("câu hỏi khác hẳn", &unit_vector(4, 1));
        assert!(miss.is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = cache(3, Duration::from_secs(60));

        cache.put("q1", unit_vector(8, 0), "r1".to_string());
        cache.put("q2", unit_vector(8, 1), "r2".to_string());
        cache.put("q3", unit_vector(8, 2), "r3".to_string());

        // Touch q1 and q3 so q2 is the least recently used
        assert!(cache.get("q1", &unit_vector(8, 0)).is_some());
        assert!(cache.get("q3", &unit_vector(8, 2)).is_some());

        cache.put("q4", unit_vector(8, 3), "r4".to_string());

        assert_eq!(cache.len(), 3);
        assert!(cache.get("q2", &unit_vector(8, 1)).is_none());
        assert!(cache.get("q1", &unit_vector(8, 0)).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = cache(10, Duration::from_millis(10));
        cache.put("q1", unit_vector(4, 0), "r1".to_string());

        std::thread::sleep(Duration::from_millis(30));

        assert!(cache.get("q1", &unit_vector(4, 0)).is_none());
        let stats = cache.stats();
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_clear_expired() {
        let cache = cache(10, Duration::from_millis(10));
        cache.put("q1", unit_vector(4, 0), "r1".to_string());
        cache.put("q2", unit_vector(4, 1), "r2".to_string());

        std::thread::sleep(Duration::from_millis(30));
        cache.put("q3", unit_vector(4, 2), "r3".to_string());

        let removed = cache.clear_expired();
        assert_eq!(removed, 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_put_same_question_replaces() {
        let cache = cache(10, Duration::from_secs(60));
        cache.put("q1", unit_vector(4, 0), "old".to_string());
        cache.put("q1", unit_vector(4, 0), "new".to_string());

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("q1", &unit_vector(4, 0)).as_deref(), Some("new"));
    }

    #[test]
    fn test_size_never_exceeds_max() {
        let cache = cache(5, Duration::from_secs(60));
        for i in 0..20 {
            cache.put(&format!("q{}", i), unit_vector(32, i % 32), format!("r{}", i));
            assert!(cache.len() <= 5);
        }
    }

    #[test]
    fn test_clear() {
        let cache = cache(10, Duration::from_secs(60));
        cache.put("q1", unit_vector(4, 0), "r1".to_string());
        cache.clear();
        assert!(cache.is_empty());
    }
}
