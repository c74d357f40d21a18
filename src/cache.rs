use crate::options::ExtractOptions;
use crate::Metadata;
use lru::LruCache;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;
use url::Url;

pub const DEFAULT_CACHE_MAX_SIZE: usize = 100;
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_millis(300_000);

/// Called once for every entry dropped to make room for a new one.
pub type EvictionListener<V> = Arc<dyn Fn(&str, &V) + Send + Sync>;

pub struct CacheOptions<V = Metadata> {
    pub max_size: usize,
    pub ttl: Duration,
    pub on_eviction: Option<EvictionListener<V>>,
}

impl<V> Default for CacheOptions<V> {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_CACHE_MAX_SIZE,
            ttl: DEFAULT_CACHE_TTL,
            on_eviction: None,
        }
    }
}

impl<V> CacheOptions<V> {
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_on_eviction(mut self, listener: impl Fn(&str, &V) + Send + Sync + 'static) -> Self {
        self.on_eviction = Some(Arc::new(listener));
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) > self.ttl
    }

    fn remaining(&self, now: Instant) -> Duration {
        self.ttl.saturating_sub(now.duration_since(self.inserted_at))
    }
}

struct CacheState<V> {
    entries: LruCache<String, CacheEntry<V>>,
    stats: CacheStats,
}

/// Bounded LRU cache with per-entry TTL.
///
/// Clones share the same underlying store, so a handle can be passed to many
/// concurrent extractions.
pub struct Cache<V = Metadata> {
    state: Arc<Mutex<CacheState<V>>>,
    ttl: Duration,
    on_eviction: Option<EvictionListener<V>>,
}

impl<V> Clone for Cache<V> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            ttl: self.ttl,
            on_eviction: self.on_eviction.clone(),
        }
    }
}

impl<V> fmt::Debug for Cache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("size", &self.size())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl<V: Clone> Default for Cache<V> {
    fn default() -> Self {
        Self::new(CacheOptions::default())
    }
}

impl<V> Cache<V> {
    pub fn new(options: CacheOptions<V>) -> Self {
        let capacity = NonZeroUsize::new(options.max_size)
            .or(NonZeroUsize::new(DEFAULT_CACHE_MAX_SIZE))
            .unwrap_or(NonZeroUsize::MIN);
        debug!(max_size = capacity.get(), ttl_ms = options.ttl.as_millis() as u64, "Creating cache");

        Self {
            state: Arc::new(Mutex::new(CacheState {
                entries: LruCache::new(capacity),
                stats: CacheStats::default(),
            })),
            ttl: options.ttl,
            on_eviction: options.on_eviction,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<V>> {
        // A panicking eviction listener runs outside the lock, so the state
        // behind a poisoned mutex is still consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, self.ttl);
    }

    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        let entry = CacheEntry {
            value,
            inserted_at: Instant::now(),
            ttl,
        };

        let evicted = {
            let mut state = self.lock();
            match state.entries.push(key.clone(), entry) {
                Some((old_key, old)) if old_key != key => {
                    state.stats.evictions += 1;
                    Some((old_key, old))
                }
                _ => None,
            }
        };

        if let Some((old_key, old)) = evicted {
            debug!(key = %old_key, "Evicted least recently used cache entry");
            if let Some(listener) = &self.on_eviction {
                listener(&old_key, &old.value);
            }
        }
    }

    /// Returns true if `key` holds a live entry. Does not refresh recency.
    pub fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut state = self.lock();
        let expired = state.entries.peek(key).map(|e| e.is_expired(now));
        match expired {
            Some(false) => true,
            Some(true) => {
                state.entries.pop(key);
                false
            }
            None => false,
        }
    }

    /// Removes `key`, returning whether it was present and live.
    pub fn delete(&self, key: &str) -> bool {
        let now = Instant::now();
        self.lock()
            .entries
            .pop(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    /// Time left before `key` expires, or `None` if it is absent or expired.
    pub fn expires_in(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let mut state = self.lock();
        let remaining = state
            .entries
            .peek(key)
            .map(|entry| (!entry.is_expired(now)).then(|| entry.remaining(now)))?;
        if remaining.is_none() {
            state.entries.pop(key);
        }
        remaining
    }

    /// Number of stored entries, including expired ones not yet reclaimed.
    pub fn size(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn capacity(&self) -> usize {
        self.lock().entries.cap().get()
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.lock();
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            state.entries.pop(key);
        }
        expired.len()
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats
    }
}

impl<V: Clone> Cache<V> {
    /// Returns a clone of the live value for `key` and marks it most recently used.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut state = self.lock();

        let Some(expired) = state.entries.peek(key).map(|e| e.is_expired(now)) else {
            state.stats.misses += 1;
            return None;
        };
        if expired {
            state.entries.pop(key);
            state.stats.misses += 1;
            return None;
        }

        let value = state.entries.get(key).map(|entry| entry.value.clone());
        state.stats.hits += 1;
        value
    }
}

/// Builds a metadata cache handle.
pub fn create_cache(options: CacheOptions<Metadata>) -> Cache<Metadata> {
    Cache::new(options)
}

/// Normalizes a URL for cache identity: lower-cased scheme and host, no
/// fragment, and no bare trailing slash.
pub fn normalize_url(url: &str) -> String {
    let trimmed = url.trim();
    let Ok(mut parsed) = Url::parse(trimmed) else {
        return trimmed.to_lowercase();
    };
    parsed.set_fragment(None);

    let mut normalized = parsed.to_string();
    if parsed.query().is_none() && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

/// Derives the cache key for `url` under `options`.
///
/// Only options that change the extracted result take part in the key, always
/// in the same order.
pub fn generate_cache_key(url: &str, options: &ExtractOptions) -> String {
    format!(
        "{}|convert_charset={}|fetch_oembed={}|only_open_graph={}",
        normalize_url(url),
        options.convert_charset,
        options.fetch_oembed,
        options.only_open_graph,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread::sleep;

    fn small_cache(max_size: usize) -> Cache<String> {
        Cache::new(CacheOptions::default().with_max_size(max_size))
    }

    #[test]
    fn test_set_get_has_delete() {
        let cache = small_cache(10);
        cache.set("a", "1".to_string());

        assert_eq!(cache.get("a").as_deref(), Some("1"));
        assert!(cache.has("a"));
        assert!(cache.delete("a"));
        assert!(!cache.has("a"));
        assert!(!cache.delete("a"));
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn test_ttl_expiry() {
        let cache: Cache<String> = Cache::new(CacheOptions::default().with_ttl(Duration::from_millis(50)));
        cache.set("k", "v".to_string());
        assert_eq!(cache.get("k").as_deref(), Some("v"));
        assert!(cache.expires_in("k").is_some_and(|d| d <= Duration::from_millis(50)));

        sleep(Duration::from_millis(80));
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.expires_in("k"), None);
    }

    #[test]
    fn test_per_entry_ttl() {
        let cache = small_cache(10);
        cache.set_with_ttl("short", "s".to_string(), Duration::from_millis(20));
        cache.set("long", "l".to_string());

        sleep(Duration::from_millis(40));
        assert!(!cache.has("short"));
        assert!(cache.has("long"));
    }

    #[test]
    fn test_lru_eviction_and_listener() {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&evicted);
        let cache: Cache<u32> = Cache::new(
            CacheOptions::default()
                .with_max_size(3)
                .with_on_eviction(move |key, value| sink.lock().unwrap().push((key.to_string(), *value))),
        );

        cache.set("a", 1);
        cache.set("b", 2);
        cache.set("c", 3);
        // Touch "a" so "b" becomes least recently used.
        assert_eq!(cache.get("a"), Some(1));
        cache.set("d", 4);

        assert_eq!(cache.size(), 3);
        assert!(!cache.has("b"));
        assert!(cache.has("a") && cache.has("c") && cache.has("d"));
        assert_eq!(*evicted.lock().unwrap(), vec![("b".to_string(), 2)]);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_listener_not_called_for_replace_delete_or_clear() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let cache: Cache<u32> = Cache::new(
            CacheOptions::default()
                .with_max_size(2)
                .with_on_eviction(move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
        );

        cache.set("a", 1);
        cache.set("a", 2);
        cache.delete("a");
        cache.set("b", 1);
        cache.clear();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_size_stays_bounded() {
        let cache = small_cache(10);
        for i in 0..1000 {
            cache.set(format!("key-{i}"), i.to_string());
            assert!(cache.size() <= 10);
        }
        assert_eq!(cache.get("key-999").as_deref(), Some("999"));
        assert_eq!(cache.get("key-0"), None);
    }

    #[test]
    fn test_zero_max_size_uses_default() {
        let cache = small_cache(0);
        assert_eq!(cache.capacity(), DEFAULT_CACHE_MAX_SIZE);
    }

    #[test]
    fn test_purge_expired() {
        let cache = small_cache(10);
        cache.set_with_ttl("a", "1".to_string(), Duration::from_millis(1));
        cache.set_with_ttl("b", "2".to_string(), Duration::from_millis(1));
        cache.set("c", "3".to_string());
        sleep(Duration::from_millis(20));

        assert_eq!(cache.purge_expired(), 2);
        assert_eq!(cache.size(), 1);
    }

    #[test]
    fn test_stats_track_hits_and_misses() {
        let cache = small_cache(10);
        cache.set("a", "1".to_string());
        cache.get("a");
        cache.get("missing");

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(normalize_url("https://example.com/"), "https://example.com");
        assert_eq!(normalize_url("HTTPS://Example.COM"), "https://example.com");
        assert_eq!(normalize_url("https://example.com/a/#frag"), "https://example.com/a");
        assert_eq!(normalize_url("https://example.com/?q=1"), "https://example.com/?q=1");
        assert_eq!(normalize_url("  Not A Url "), "not a url");
    }

    #[test]
    fn test_cache_key_options() {
        let base = ExtractOptions::default();
        let key = generate_cache_key("https://example.com/", &base);
        assert_eq!(key, generate_cache_key("https://example.com", &base));
        assert_eq!(key, generate_cache_key("HTTPS://EXAMPLE.com", &base));

        let timeout_only = ExtractOptions::default()
            .with_timeout(Duration::from_secs(1))
            .with_max_redirects(1)
            .with_user_agent("other")
            .with_header("X-Test", "1");
        assert_eq!(key, generate_cache_key("https://example.com", &timeout_only));

        for changed in [
            ExtractOptions::default().with_only_open_graph(true),
            ExtractOptions::default().with_fetch_oembed(true),
            ExtractOptions::default().with_convert_charset(true),
        ] {
            assert_ne!(key, generate_cache_key("https://example.com", &changed));
        }
    }
}
