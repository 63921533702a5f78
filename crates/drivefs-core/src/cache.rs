//! Process-wide metadata cache.
//!
//! Explicit invalidation is authoritative: filesystem operations delete the
//! keys they mutate. An optional TTL only bounds how stale an entry may get.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::model::RemoteFile;

/// Cache key. Each variant renders to the string the cache stores it under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Directory listing, keyed by the bare parent id.
    Listing(String),
    /// File detail, `file:<id>`.
    File(String),
    /// Resolved absolute path, `path:<id>`.
    Path(String),
    /// Search results, `search:<parent><name>`.
    Search { parent: String, name: String },
    /// Path-resolution index, `fid:<relative path>`.
    PathIndex(String),
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Listing(parent) => write!(f, "{}", parent),
            CacheKey::File(id) => write!(f, "file:{}", id),
            CacheKey::Path(id) => write!(f, "path:{}", id),
            CacheKey::Search { parent, name } => write!(f, "search:{}{}", parent, name),
            CacheKey::PathIndex(rel) => write!(f, "fid:{}", rel),
        }
    }
}

/// Cached payload.
#[derive(Debug, Clone)]
pub enum CachedValue {
    Listing(Arc<Vec<RemoteFile>>),
    File(RemoteFile),
    Path(String),
    Search(Arc<Vec<RemoteFile>>),
    FileId(String),
}

struct Entry {
    value: CachedValue,
    inserted_at: Instant,
}

/// Cache statistics.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries removed by explicit delete.
    pub invalidations: u64,
    /// Entries dropped by the TTL ceiling.
    pub expirations: u64,
    pub entries: usize,
}

impl CacheStats {
    /// Calculate hit rate as a percentage.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

struct Inner {
    entries: HashMap<String, Entry>,
    stats: CacheStats,
}

/// Thread-safe key/value cache shared by every component of a mount.
pub struct MetadataCache {
    enabled: bool,
    ttl: Option<Duration>,
    inner: Mutex<Inner>,
}

/// Shared handle to the cache.
pub type SharedCache = Arc<MetadataCache>;

/// Create a shared cache from configuration.
pub fn create_cache(config: &drivefs_config::CacheConfig) -> SharedCache {
    Arc::new(MetadataCache::new(
        config.enabled,
        config.ttl.map(|t| t.as_duration()),
    ))
}

impl MetadataCache {
    pub fn new(enabled: bool, ttl: Option<Duration>) -> Self {
        MetadataCache {
            enabled,
            ttl,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                stats: CacheStats::default(),
            }),
        }
    }

    /// Enabled cache with no TTL ceiling.
    pub fn unbounded() -> Self {
        Self::new(true, None)
    }

    fn expired(&self, entry: &Entry) -> bool {
        self.ttl.is_some_and(|ttl| entry.inserted_at.elapsed() > ttl)
    }

    pub fn get(&self, key: &CacheKey) -> Option<CachedValue> {
        if !self.enabled {
            return None;
        }
        let key = key.to_string();
        let mut inner = self.inner.lock();

        let expired = match inner.entries.get(&key) {
            Some(entry) => self.expired(entry),
            None => {
                inner.stats.misses += 1;
                trace!(key = %key, "cache miss");
                return None;
            }
        };

        if expired {
            inner.entries.remove(&key);
            inner.stats.expirations += 1;
            inner.stats.misses += 1;
            inner.stats.entries = inner.entries.len();
            debug!(key = %key, "cache entry expired");
            return None;
        }

        inner.stats.hits += 1;
        trace!(key = %key, "cache hit");
        inner.entries.get(&key).map(|e| e.value.clone())
    }

    pub fn set(&self, key: &CacheKey, value: CachedValue) {
        if !self.enabled {
            return;
        }
        let key = key.to_string();
        let mut inner = self.inner.lock();
        inner.entries.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
        inner.stats.entries = inner.entries.len();
    }

    /// Remove an entry. Returns true if one was present.
    pub fn delete(&self, key: &CacheKey) -> bool {
        let key = key.to_string();
        let mut inner = self.inner.lock();
        let removed = inner.entries.remove(&key).is_some();
        if removed {
            inner.stats.invalidations += 1;
            inner.stats.entries = inner.entries.len();
            debug!(key = %key, "cache entry invalidated");
        }
        removed
    }

    /// Presence check that does not touch hit/miss counters.
    pub fn contains(&self, key: &CacheKey) -> bool {
        let inner = self.inner.lock();
        inner
            .entries
            .get(&key.to_string())
            .is_some_and(|e| !self.expired(e))
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let count = inner.entries.len() as u64;
        inner.entries.clear();
        inner.stats.invalidations += count;
        inner.stats.entries = 0;
        debug!(count, "cache cleared");
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats.clone()
    }

    /// Drop every entry past the TTL ceiling. Returns how many were dropped.
    pub fn prune_expired(&self) -> usize {
        let Some(ttl) = self.ttl else {
            return 0;
        };
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| e.inserted_at.elapsed() <= ttl);
        let pruned = before - inner.entries.len();
        inner.stats.expirations += pruned as u64;
        inner.stats.entries = inner.entries.len();
        pruned
    }

    // ====== Typed helpers ======

    pub fn listing(&self, parent_id: &str) -> Option<Arc<Vec<RemoteFile>>> {
        match self.get(&CacheKey::Listing(parent_id.to_string())) {
            Some(CachedValue::Listing(items)) => Some(items),
            _ => None,
        }
    }

    pub fn set_listing(&self, parent_id: &str, items: Vec<RemoteFile>) {
        self.set(
            &CacheKey::Listing(parent_id.to_string()),
            CachedValue::Listing(Arc::new(items)),
        );
    }

    pub fn invalidate_listing(&self, parent_id: &str) -> bool {
        self.delete(&CacheKey::Listing(parent_id.to_string()))
    }

    pub fn file(&self, file_id: &str) -> Option<RemoteFile> {
        match self.get(&CacheKey::File(file_id.to_string())) {
            Some(CachedValue::File(file)) => Some(file),
            _ => None,
        }
    }

    pub fn set_file(&self, file: &RemoteFile) {
        self.set(
            &CacheKey::File(file.file_id.clone()),
            CachedValue::File(file.clone()),
        );
    }

    pub fn invalidate_file(&self, file_id: &str) -> bool {
        self.delete(&CacheKey::File(file_id.to_string()))
    }

    pub fn path(&self, file_id: &str) -> Option<String> {
        match self.get(&CacheKey::Path(file_id.to_string())) {
            Some(CachedValue::Path(p)) => Some(p),
            _ => None,
        }
    }

    pub fn set_path(&self, file_id: &str, path: String) {
        self.set(&CacheKey::Path(file_id.to_string()), CachedValue::Path(path));
    }

    pub fn search(&self, parent_id: &str, name: &str) -> Option<Arc<Vec<RemoteFile>>> {
        let key = CacheKey::Search {
            parent: parent_id.to_string(),
            name: name.to_string(),
        };
        match self.get(&key) {
            Some(CachedValue::Search(items)) => Some(items),
            _ => None,
        }
    }

    pub fn set_search(&self, parent_id: &str, name: &str, items: Vec<RemoteFile>) {
        let key = CacheKey::Search {
            parent: parent_id.to_string(),
            name: name.to_string(),
        };
        self.set(&key, CachedValue::Search(Arc::new(items)));
    }

    pub fn invalidate_search(&self, parent_id: &str, name: &str) -> bool {
        self.delete(&CacheKey::Search {
            parent: parent_id.to_string(),
            name: name.to_string(),
        })
    }

    pub fn path_index(&self, rel: &str) -> Option<String> {
        match self.get(&CacheKey::PathIndex(rel.to_string())) {
            Some(CachedValue::FileId(id)) => Some(id),
            _ => None,
        }
    }

    pub fn set_path_index(&self, rel: &str, file_id: &str) {
        self.set(
            &CacheKey::PathIndex(rel.to_string()),
            CachedValue::FileId(file_id.to_string()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FileKind;

    fn file(id: &str, name: &str) -> RemoteFile {
        RemoteFile {
            file_id: id.to_string(),
            parent_file_id: "root".to_string(),
            name: name.to_string(),
            kind: FileKind::File,
            size: 3,
            created_at: None,
            updated_at: None,
            content_hash: None,
            download_url: None,
        }
    }

    // ====== Key rendering ======

    #[test]
    fn test_key_strings() {
        assert_eq!(CacheKey::Listing("root".into()).to_string(), "root");
        assert_eq!(CacheKey::File("f1".into()).to_string(), "file:f1");
        assert_eq!(CacheKey::Path("f1".into()).to_string(), "path:f1");
        assert_eq!(
            CacheKey::Search {
                parent: "p".into(),
                name: "a.txt".into()
            }
            .to_string(),
            "search:pa.txt"
        );
        assert_eq!(CacheKey::PathIndex("a/b".into()).to_string(), "fid:a/b");
    }

    // ====== Get / set / delete ======

    #[test]
    fn test_listing_roundtrip_and_invalidate() {
        let cache = MetadataCache::unbounded();
        assert!(cache.listing("root").is_none());

        cache.set_listing("root", vec![file("f1", "a"), file("f2", "b")]);
        let listing = cache.listing("root").unwrap();
        assert_eq!(listing.len(), 2);

        assert!(cache.invalidate_listing("root"));
        assert!(cache.listing("root").is_none());
        assert!(!cache.invalidate_listing("root"));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.invalidations, 1);
        assert_eq!(stats.entries, 0);
    }

    #[test]
    fn test_empty_listing_is_cached() {
        let cache = MetadataCache::unbounded();
        cache.set_listing("d1", Vec::new());
        let listing = cache.listing("d1").unwrap();
        assert!(listing.is_empty());
    }

    #[test]
    fn test_typed_get_ignores_other_variants() {
        let cache = MetadataCache::unbounded();
        cache.set(&CacheKey::File("x".into()), CachedValue::Path("/a/".into()));
        assert!(cache.file("x").is_none());
    }

    #[test]
    fn test_file_path_search_and_index() {
        let cache = MetadataCache::unbounded();
        cache.set_file(&file("f1", "a"));
        cache.set_path("f1", "/docs/".to_string());
        cache.set_search("root", "a", vec![file("f1", "a")]);
        cache.set_path_index("docs/a", "f1");

        assert_eq!(cache.file("f1").unwrap().name, "a");
        assert_eq!(cache.path("f1").as_deref(), Some("/docs/"));
        assert_eq!(cache.search("root", "a").unwrap().len(), 1);
        assert_eq!(cache.path_index("docs/a").as_deref(), Some("f1"));

        assert!(cache.invalidate_search("root", "a"));
        assert!(cache.search("root", "a").is_none());
    }

    #[test]
    fn test_disabled_cache_stores_nothing() {
        let cache = MetadataCache::new(false, None);
        cache.set_file(&file("f1", "a"));
        assert!(cache.file("f1").is_none());
        assert!(!cache.contains(&CacheKey::File("f1".into())));
    }

    #[test]
    fn test_clear_counts_invalidations() {
        let cache = MetadataCache::unbounded();
        cache.set_file(&file("f1", "a"));
        cache.set_file(&file("f2", "b"));
        cache.clear();
        let stats = cache.stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.invalidations, 2);
    }

    // ====== TTL ceiling ======

    #[test]
    fn test_ttl_expires_entries() {
        let cache = MetadataCache::new(true, Some(Duration::from_millis(20)));
        cache.set_file(&file("f1", "a"));
        assert!(cache.file("f1").is_some());

        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.file("f1").is_none());
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn test_prune_expired() {
        let cache = MetadataCache::new(true, Some(Duration::from_millis(20)));
        cache.set_file(&file("f1", "a"));
        cache.set_file(&file("f2", "b"));
        std::thread::sleep(Duration::from_millis(40));
        cache.set_file(&file("f3", "c"));

        assert_eq!(cache.prune_expired(), 2);
        assert!(cache.contains(&CacheKey::File("f3".into())));
        assert_eq!(cache.stats().entries, 1);
    }

    #[test]
    fn test_prune_without_ttl_is_noop() {
        let cache = MetadataCache::unbounded();
        cache.set_file(&file("f1", "a"));
        assert_eq!(cache.prune_expired(), 0);
    }

    #[test]
    fn test_hit_rate() {
        let cache = MetadataCache::unbounded();
        assert_eq!(cache.stats().hit_rate(), 0.0);
        cache.set_file(&file("f1", "a"));
        cache.file("f1");
        cache.file("nope");
        assert!((cache.stats().hit_rate() - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_create_cache_from_config() {
        let config = drivefs_config::CacheConfig::default();
        let cache = create_cache(&config);
        cache.set_path("x", "/".to_string());
        assert!(cache.path("x").is_some());
    }

    #[test]
    fn test_concurrent_access() {
        let cache: SharedCache = Arc::new(MetadataCache::unbounded());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let id = format!("{}-{}", t, i);
                        cache.set_file(&file(&id, "n"));
                        assert!(cache.file(&id).is_some());
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.stats().entries, 800);
    }
}
