//! Bounded LRU cache for proxied responses.
//!
//! The forwarding engine keeps two separate instances of this cache: one
//! keyed by request path+query for whole responses, and one keyed by content
//! fingerprint for rewrite memoization. Keeping them separate avoids any key
//! collision between response bytes and rewritten strings.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use hyper::body::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Default maximum number of cached entries per cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 100;

/// Path extensions considered static and safe to cache.
const CACHEABLE_EXTENSIONS: &[&str] = &[
    ".js", ".css", ".png", ".jpg", ".jpeg", ".gif", ".svg", ".woff", ".woff2", ".ttf", ".ico",
    ".webp",
];

/// Content-type prefixes considered static and safe to cache.
const CACHEABLE_TYPES: &[&str] = &["image/", "font/", "text/css", "application/javascript"];

/// One cached response: body, headers, and status.
///
/// Entries are immutable once stored; a repeated `put` for the same key
/// replaces the value and refreshes recency.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub body: Bytes,
    pub headers: Vec<(String, String)>,
    pub status: u16,
}

/// Cache counters for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

/// Bounded LRU key -> response store with hit/miss counters.
#[derive(Debug)]
pub struct CacheManager {
    entries: Mutex<LruCache<String, CacheEntry>>,
    max_size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheManager {
    /// Creates a cache holding at most `max_size` entries.
    pub fn new(max_size: usize) -> Self {
        let capacity = NonZeroUsize::new(max_size.max(1)).expect("capacity is at least 1");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            max_size: capacity.get(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Looks up a key. A hit marks the entry most-recently-used; a miss has
    /// no side effect on the map.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %&key[..key.len().min(16)], "cache hit");
                Some(entry.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Inserts or replaces an entry. Past capacity, exactly one
    /// least-recently-used entry is evicted.
    pub fn put(&self, key: String, entry: CacheEntry) {
        let mut entries = self.entries.lock();
        if let Some((evicted, _)) = entries.push(key.clone(), entry) {
            // push returns the old value on replacement and the LRU victim
            // on eviction; only the latter is worth noting.
            if evicted != key {
                tracing::debug!(key = %&evicted[..evicted.len().min(16)], "cache evict");
            }
        }
    }

    /// Drops all entries and resets the counters.
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        let size = entries.len();
        entries.clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        tracing::info!(removed = size, "cache cleared");
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains(key)
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            hits as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        CacheStats {
            size: self.len(),
            max_size: self.max_size,
            hits,
            misses,
            hit_rate,
        }
    }
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

/// Derives the cache key for a request: hash of `path?query` when a query
/// string is present, else hash of the path alone. Header values are
/// deliberately excluded so equivalent requests collapse to one cache line.
pub fn cache_key(path: &str, query: Option<&str>) -> String {
    let full = match query {
        Some(q) if !q.is_empty() => format!("{path}?{q}"),
        _ => path.to_string(),
    };
    let digest = Sha256::digest(full.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Returns true if a response for this path/content-type is safe to cache.
pub fn is_cacheable(path: &str, content_type: &str) -> bool {
    let path_lower = path.to_ascii_lowercase();
    if CACHEABLE_EXTENSIONS.iter().any(|ext| path_lower.contains(ext)) {
        return true;
    }

    let ct_lower = content_type.to_ascii_lowercase();
    CACHEABLE_TYPES.iter().any(|ct| ct_lower.starts_with(ct))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(body: &str) -> CacheEntry {
        CacheEntry {
            body: Bytes::from(body.to_string()),
            headers: vec![("content-type".to_string(), "text/css".to_string())],
            status: 200,
        }
    }

    // ==================== LRU Tests ====================

    #[test]
    fn get_miss_returns_none() {
        let cache = CacheManager::new(2);
        assert!(cache.get("missing").is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn put_then_get_hits() {
        let cache = CacheManager::new(2);
        cache.put("a".to_string(), entry("body-a"));
        let got = cache.get("a").unwrap();
        assert_eq!(got.body, Bytes::from("body-a"));
        assert_eq!(got.status, 200);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn eviction_removes_least_recently_used() {
        let cache = CacheManager::new(2);
        cache.put("a".to_string(), entry("a"));
        cache.put("b".to_string(), entry("b"));
        cache.put("c".to_string(), entry("c"));
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
        assert!(cache.contains("c"));
    }

    #[test]
    fn access_refreshes_recency() {
        // maxSize=2, insert a,b, access a, insert c: b is evicted, not a.
        let cache = CacheManager::new(2);
        cache.put("a".to_string(), entry("a"));
        cache.put("b".to_string(), entry("b"));
        assert!(cache.get("a").is_some());
        cache.put("c".to_string(), entry("c"));
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
    }

    #[test]
    fn put_replaces_and_refreshes() {
        let cache = CacheManager::new(2);
        cache.put("a".to_string(), entry("v1"));
        cache.put("b".to_string(), entry("b"));
        cache.put("a".to_string(), entry("v2"));
        cache.put("c".to_string(), entry("c"));
        // "a" was refreshed by the replacing put, so "b" went first.
        assert_eq!(cache.get("a").unwrap().body, Bytes::from("v2"));
        assert!(!cache.contains("b"));
    }

    #[test]
    fn size_never_exceeds_max() {
        let cache = CacheManager::new(3);
        for i in 0..20 {
            cache.put(format!("key-{i}"), entry("x"));
        }
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn clear_resets_entries_and_counters() {
        let cache = CacheManager::new(2);
        cache.put("a".to_string(), entry("a"));
        cache.get("a");
        cache.get("nope");
        cache.clear();
        assert!(cache.is_empty());
        let stats = cache.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn hit_rate_computed() {
        let cache = CacheManager::new(2);
        cache.put("a".to_string(), entry("a"));
        cache.get("a");
        cache.get("a");
        cache.get("nope");
        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 66.66).abs() < 1.0);
    }

    // ==================== Cache Key Tests ====================

    #[test]
    fn cache_key_stable() {
        assert_eq!(
            cache_key("/app.js", Some("v=1")),
            cache_key("/app.js", Some("v=1"))
        );
    }

    #[test]
    fn cache_key_query_sensitive() {
        assert_ne!(
            cache_key("/app.js", Some("v=1")),
            cache_key("/app.js", Some("v=2"))
        );
        assert_ne!(cache_key("/app.js", None), cache_key("/app.js", Some("v=1")));
    }

    #[test]
    fn cache_key_empty_query_same_as_none() {
        assert_eq!(cache_key("/app.js", None), cache_key("/app.js", Some("")));
    }

    // ==================== is_cacheable Tests ====================

    #[test]
    fn cacheable_by_extension() {
        assert!(is_cacheable("/app.js", "application/javascript"));
        assert!(is_cacheable("/style.css", ""));
        assert!(is_cacheable("/logo.PNG", ""));
        assert!(is_cacheable("/fonts/main.woff2", ""));
    }

    #[test]
    fn cacheable_by_content_type() {
        assert!(is_cacheable("/dynamic/avatar", "image/png"));
        assert!(is_cacheable("/f", "font/woff2"));
        assert!(is_cacheable("/s", "text/css; charset=utf-8"));
    }

    #[test]
    fn not_cacheable_api_json() {
        assert!(!is_cacheable("/api/data", "application/json"));
        assert!(!is_cacheable("/index.html", "text/html"));
        assert!(!is_cacheable("/", ""));
    }
}
