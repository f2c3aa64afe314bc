//! Adaptive response cache.
//!
//! Results are memoized under a caller-produced fingerprint. Each entry's TTL
//! is either supplied explicitly or derived from how often the key is read:
//! hot keys live longer, cold keys expire sooner. Entries expire lazily on
//! read and proactively on [`AdaptiveCache::sweep`]; capacity overflow evicts
//! the least-recently-accessed entry. Tag and regex invalidation remove
//! related entries in bulk, and [`AdaptiveCache::warm`] pre-populates the
//! cache in bounded-parallel batches.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::errors::GatewayResult;
use crate::observability::{metric_names, MetricsCollector, NoopMetricsCollector};

/// Configuration for the adaptive cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Capacity; inserting beyond it evicts the LRU entry
    pub max_entries: usize,
    /// TTL for keys with no meaningful access history
    pub base_ttl: Duration,
    /// Floor for adaptively-computed TTLs
    pub min_ttl: Duration,
    /// Ceiling for adaptively-computed TTLs
    pub max_ttl: Duration,
    /// How often the owning context should call [`AdaptiveCache::sweep`]
    pub sweep_interval: Duration,
    /// Fetchers run in parallel during a warm pass
    pub warm_concurrency: usize,
    /// How long an idle access pattern is remembered
    pub pattern_retention: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: crate::DEFAULT_CACHE_CAPACITY,
            base_ttl: Duration::from_secs(300),
            min_ttl: Duration::from_secs(30),
            max_ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
            warm_concurrency: 4,
            pattern_retention: Duration::from_secs(3600),
        }
    }
}

impl CacheConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the entry capacity.
    pub fn max_entries(mut self, n: usize) -> Self {
        self.max_entries = n;
        self
    }

    /// Sets the base TTL.
    pub fn base_ttl(mut self, ttl: Duration) -> Self {
        self.base_ttl = ttl;
        self
    }

    /// Sets the adaptive TTL bounds.
    pub fn ttl_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.min_ttl = min;
        self.max_ttl = max;
        self
    }

    /// Sets the sweep interval.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// Options applied when storing a value.
#[derive(Debug, Clone, Default)]
pub struct CacheWriteOptions {
    /// Explicit TTL; when absent the adaptive policy decides
    pub ttl: Option<Duration>,
    /// Labels enabling bulk invalidation
    pub tags: Vec<String>,
}

impl CacheWriteOptions {
    /// Options with adaptive TTL and no tags.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets an explicit TTL.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the tag list.
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// Fetcher used by [`AdaptiveCache::warm`].
pub type WarmFetcher<V> = Box<dyn FnOnce() -> BoxFuture<'static, GatewayResult<V>> + Send>;

/// One entry of a warm pass.
pub struct WarmEntry<V> {
    /// Cache key to populate
    pub key: String,
    /// Produces the value to store
    pub fetcher: WarmFetcher<V>,
    /// Explicit TTL for the stored value
    pub ttl: Option<Duration>,
    /// Tags for the stored value
    pub tags: Vec<String>,
    /// Higher priorities are fetched first
    pub priority: u8,
}

impl<V> WarmEntry<V> {
    /// Creates a warm entry with no TTL override, no tags, priority 0.
    pub fn new(key: impl Into<String>, fetcher: WarmFetcher<V>) -> Self {
        Self {
            key: key.into(),
            fetcher,
            ttl: None,
            tags: Vec::new(),
            priority: 0,
        }
    }

    /// Sets an explicit TTL.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the fetch priority.
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}

/// Read-only snapshot of cache activity.
#[derive(Debug, Clone, Serialize)]
pub struct CacheMetrics {
    /// Lookups that returned a stored value
    pub hits: u64,
    /// Lookups that found nothing, or an expired entry
    pub misses: u64,
    /// Entries removed by capacity pressure
    pub evictions: u64,
    /// Entries removed because their TTL elapsed
    pub expirations: u64,
    /// Entries currently stored
    pub size: usize,
    /// hits / (hits + misses), 0 when nothing was looked up
    pub hit_rate: f64,
}

struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    last_accessed: Instant,
    access_count: u64,
    ttl: Duration,
    tags: Vec<String>,
}

struct AccessPattern {
    access_count: u64,
    first_seen: Instant,
    last_access: Instant,
    average_interval: Duration,
}

/// TTL cache keyed by request fingerprint.
pub struct AdaptiveCache<V> {
    config: CacheConfig,
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
    patterns: Mutex<HashMap<String, AccessPattern>>,
    metrics: Arc<dyn MetricsCollector>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl<V: Clone> AdaptiveCache<V> {
    /// Creates a cache with the given configuration and no metrics sink.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
            patterns: Mutex::new(HashMap::new()),
            metrics: Arc::new(NoopMetricsCollector),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Attaches a metrics collector.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    /// The configuration this cache runs under.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Looks up a key. An entry whose TTL has elapsed is removed and reported
    /// as a miss; a returned value always satisfies `age < ttl`.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        self.record_access(key, now);

        let value = {
            let mut entries = self.entries.lock();
            match entries.get_mut(key) {
                Some(entry) => {
                    if now.duration_since(entry.created_at) >= entry.ttl {
                        entries.remove(key);
                        self.expirations.fetch_add(1, Ordering::Relaxed);
                        None
                    } else {
                        entry.last_accessed = now;
                        entry.access_count += 1;
                        Some(entry.value.clone())
                    }
                }
                None => None,
            }
        };

        match &value {
            Some(_) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .increment_counter(metric_names::CACHE_HITS, 1, &[]);
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .increment_counter(metric_names::CACHE_MISSES, 1, &[]);
            }
        }
        value
    }

    /// Stores a value. Without an explicit TTL, the key's access history
    /// decides how long the entry lives. At capacity, the
    /// least-recently-accessed entry is evicted first.
    pub fn set(&self, key: &str, value: V, options: CacheWriteOptions) {
        let now = Instant::now();
        let ttl = options.ttl.unwrap_or_else(|| self.adaptive_ttl(key, now));

        let mut entries = self.entries.lock();
        if !entries.contains_key(key) && entries.len() >= self.config.max_entries {
            if let Some((lru_key, accesses)) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_accessed)
                .map(|(key, entry)| (key.clone(), entry.access_count))
            {
                entries.remove(&lru_key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(key = %lru_key, accesses, "Evicted least-recently-accessed entry");
            }
        }
        entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                created_at: now,
                last_accessed: now,
                access_count: 0,
                ttl,
                tags: options.tags,
            },
        );
    }

    /// Returns the cached value, or fetches, stores and returns it.
    ///
    /// Two callers racing on a cold key may both observe a miss and both
    /// invoke the fetcher; the later `set` wins. This is a documented
    /// approximation, not an exclusivity guarantee.
    pub async fn get_or_set<F, Fut>(
        &self,
        key: &str,
        fetcher: F,
        options: CacheWriteOptions,
    ) -> GatewayResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<V>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }
        let value = fetcher().await?;
        self.set(key, value.clone(), options);
        Ok(value)
    }

    /// Removes a key. Returns whether an entry was present.
    pub fn delete(&self, key: &str) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    /// Removes every entry whose tag set contains `tag`; returns the count.
    pub fn invalidate_by_tag(&self, tag: &str) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.tags.iter().any(|t| t == tag));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(tag, removed, "Invalidated entries by tag");
        }
        removed
    }

    /// Removes every entry whose key matches `pattern`; returns the count.
    pub fn invalidate_by_pattern(&self, pattern: &Regex) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|key, _| !pattern.is_match(key));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(pattern = %pattern, removed, "Invalidated entries by pattern");
        }
        removed
    }

    /// Pre-populates the cache. Entries are fetched highest-priority first in
    /// batches of `warm_concurrency`; a failed fetch is logged and skipped,
    /// never aborting the rest of the pass.
    pub async fn warm(&self, mut entries: Vec<WarmEntry<V>>) {
        entries.sort_by(|a, b| b.priority.cmp(&a.priority));
        let chunk = self.config.warm_concurrency.max(1);

        while !entries.is_empty() {
            let take = chunk.min(entries.len());
            let batch: Vec<WarmEntry<V>> = entries.drain(..take).collect();
            join_all(batch.into_iter().map(|entry| async move {
                let WarmEntry {
                    key,
                    fetcher,
                    ttl,
                    tags,
                    ..
                } = entry;
                match fetcher().await {
                    Ok(value) => {
                        self.set(&key, value, CacheWriteOptions { ttl, tags });
                    }
                    Err(error) => {
                        warn!(key = %key, error = %error, "Warm fetch failed; skipping entry");
                    }
                }
            }))
            .await;
        }
    }

    /// Removes every expired entry and prunes idle access patterns. Returns
    /// how many entries were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let removed = {
            let mut entries = self.entries.lock();
            let before = entries.len();
            entries.retain(|_, entry| now.duration_since(entry.created_at) < entry.ttl);
            before - entries.len()
        };
        self.expirations.fetch_add(removed as u64, Ordering::Relaxed);

        // Patterns age out on their own schedule, independent of the entries
        // they describe.
        self.patterns.lock().retain(|_, pattern| {
            now.duration_since(pattern.last_access) <= self.config.pattern_retention
        });

        if removed > 0 {
            debug!(removed, "Swept expired cache entries");
        }
        removed
    }

    /// Takes a snapshot of cache activity.
    pub fn metrics(&self) -> CacheMetrics {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheMetrics {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            size: self.entries.lock().len(),
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    // Access rate is measured per minute since the pattern was first seen;
    // the elapsed floor keeps a brand-new key from looking infinitely hot.
    fn adaptive_ttl(&self, key: &str, now: Instant) -> Duration {
        let patterns = self.patterns.lock();
        let Some(pattern) = patterns.get(key) else {
            return self.config.base_ttl;
        };
        let elapsed = now
            .duration_since(pattern.first_seen)
            .max(Duration::from_secs(1));
        let per_minute = pattern.access_count as f64 * 60.0 / elapsed.as_secs_f64();

        let base = self.config.base_ttl;
        if per_minute > 10.0 {
            self.config.max_ttl
        } else if per_minute > 5.0 {
            (base * 4).min(self.config.max_ttl)
        } else if per_minute > 1.0 {
            (base * 2).min(self.config.max_ttl)
        } else if per_minute < 0.1 {
            (base / 2).max(self.config.min_ttl)
        } else {
            base
        }
    }

    fn record_access(&self, key: &str, now: Instant) {
        let mut patterns = self.patterns.lock();
        match patterns.get_mut(key) {
            Some(pattern) => {
                let interval = now.duration_since(pattern.last_access);
                // The first access has no interval; average over the rest.
                let observed = pattern.access_count.saturating_sub(1) as u32;
                pattern.average_interval =
                    (pattern.average_interval * observed + interval) / (observed + 1);
                pattern.access_count += 1;
                pattern.last_access = now;
            }
            None => {
                patterns.insert(
                    key.to_string(),
                    AccessPattern {
                        access_count: 1,
                        first_seen: now,
                        last_access: now,
                        average_interval: Duration::ZERO,
                    },
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cache() -> AdaptiveCache<String> {
        AdaptiveCache::new(CacheConfig::default())
    }

    // Seeds a pattern first-seen at `base`; evaluate TTLs at `base + over`.
    fn seed_pattern(cache: &AdaptiveCache<String>, key: &str, accesses: u64, base: Instant) {
        cache.patterns.lock().insert(
            key.to_string(),
            AccessPattern {
                access_count: accesses,
                first_seen: base,
                last_access: base,
                average_interval: Duration::ZERO,
            },
        );
    }

    #[tokio::test]
    async fn ttl_expiry_scenario() {
        let cache = cache();
        cache.set(
            "k",
            "v".to_string(),
            CacheWriteOptions::new().ttl(Duration::from_millis(50)),
        );
        assert_eq!(cache.get("k"), Some("v".to_string()));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.get("k"), None);
        // The expired entry was physically removed, not just hidden.
        assert_eq!(cache.metrics().size, 0);
    }

    #[test]
    fn tag_invalidation_is_exact() {
        let cache = cache();
        cache.set(
            "a",
            "1".to_string(),
            CacheWriteOptions::new().tags(["contacts"]),
        );
        cache.set(
            "b",
            "2".to_string(),
            CacheWriteOptions::new().tags(["contacts", "hot"]),
        );
        cache.set("c", "3".to_string(), CacheWriteOptions::new().tags(["deals"]));

        assert_eq!(cache.invalidate_by_tag("contacts"), 2);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("c"), Some("3".to_string()));
    }

    #[test]
    fn pattern_invalidation() {
        let cache = cache();
        cache.set("contacts:1", "x".to_string(), CacheWriteOptions::new());
        cache.set("contacts:2", "y".to_string(), CacheWriteOptions::new());
        cache.set("deals:1", "z".to_string(), CacheWriteOptions::new());

        let pattern = Regex::new("^contacts:").unwrap();
        assert_eq!(cache.invalidate_by_pattern(&pattern), 2);
        assert_eq!(cache.metrics().size, 1);
    }

    #[test]
    fn lru_eviction_by_last_access() {
        let cache = AdaptiveCache::new(CacheConfig::default().max_entries(2));
        cache.set("a", "1".to_string(), CacheWriteOptions::new());
        std::thread::sleep(Duration::from_millis(2));
        cache.set("b", "2".to_string(), CacheWriteOptions::new());
        std::thread::sleep(Duration::from_millis(2));

        // Touch "a" so "b" becomes the LRU entry despite later insertion.
        assert!(cache.get("a").is_some());
        std::thread::sleep(Duration::from_millis(2));

        cache.set("c", "3".to_string(), CacheWriteOptions::new());
        assert_eq!(cache.get("b"), None);
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.metrics().evictions, 1);
    }

    #[test]
    fn adaptive_ttl_tiers() {
        let config = CacheConfig::default()
            .base_ttl(Duration::from_secs(100))
            .ttl_bounds(Duration::from_secs(60), Duration::from_secs(1000));
        let cache: AdaptiveCache<String> = AdaptiveCache::new(config);
        let base = Instant::now();
        let minute = base + Duration::from_secs(60);

        // No history: base.
        assert_eq!(cache.adaptive_ttl("cold", base), Duration::from_secs(100));

        // > 10/min: max.
        seed_pattern(&cache, "hot", 20, base);
        assert_eq!(cache.adaptive_ttl("hot", minute), Duration::from_secs(1000));

        // (5, 10]/min: 4x base.
        seed_pattern(&cache, "warm", 8, base);
        assert_eq!(cache.adaptive_ttl("warm", minute), Duration::from_secs(400));

        // (1, 5]/min: 2x base.
        seed_pattern(&cache, "mild", 3, base);
        assert_eq!(cache.adaptive_ttl("mild", minute), Duration::from_secs(200));

        // < 0.1/min: half base, floored at min.
        seed_pattern(&cache, "rare", 3, base);
        assert_eq!(
            cache.adaptive_ttl("rare", base + Duration::from_secs(3600)),
            Duration::from_secs(60)
        );

        // In between: base.
        seed_pattern(&cache, "steady", 1, base);
        assert_eq!(
            cache.adaptive_ttl("steady", base + Duration::from_secs(120)),
            Duration::from_secs(100)
        );
    }

    #[tokio::test]
    async fn get_or_set_fetches_once_when_warm() {
        let cache = cache();
        let fetches = AtomicU64::new(0);

        let first = cache
            .get_or_set(
                "k",
                || {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    async { Ok("fetched".to_string()) }
                },
                CacheWriteOptions::new(),
            )
            .await
            .unwrap();
        assert_eq!(first, "fetched");

        let second = cache
            .get_or_set(
                "k",
                || {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    async { Ok("refetched".to_string()) }
                },
                CacheWriteOptions::new(),
            )
            .await
            .unwrap();
        assert_eq!(second, "fetched");
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn get_or_set_race_is_last_write_wins() {
        let cache = cache();
        let fetches = AtomicU64::new(0);

        let fetch = |label: &'static str| {
            let fetches = &fetches;
            cache.get_or_set(
                "cold",
                move || {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    async move {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(label.to_string())
                    }
                },
                CacheWriteOptions::new(),
            )
        };

        let (a, b) = tokio::join!(fetch("first"), fetch("second"));
        assert!(a.is_ok() && b.is_ok());
        // Both racers observed the miss; the accepted, documented race.
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
        assert!(cache.get("cold").is_some());
    }

    #[tokio::test]
    async fn warm_skips_failures() {
        let cache = cache();
        let entries = vec![
            WarmEntry::new(
                "good",
                Box::new(|| {
                    Box::pin(async { Ok("warmed".to_string()) }) as BoxFuture<'static, _>
                }) as WarmFetcher<String>,
            ),
            WarmEntry::new(
                "bad",
                Box::new(|| {
                    Box::pin(async {
                        Err(crate::errors::GatewayError::Network {
                            message: "connection refused".to_string(),
                        })
                    }) as BoxFuture<'static, _>
                }) as WarmFetcher<String>,
            )
            .priority(9),
        ];

        cache.warm(entries).await;
        assert_eq!(cache.get("good"), Some("warmed".to_string()));
        assert_eq!(cache.get("bad"), None);
    }

    #[tokio::test]
    async fn sweep_removes_expired_and_prunes_patterns() {
        // A zero retention horizon prunes any pattern older than "now".
        let config = CacheConfig {
            pattern_retention: Duration::ZERO,
            ..CacheConfig::default()
        };
        let cache: AdaptiveCache<String> = AdaptiveCache::new(config);
        cache.set(
            "soon",
            "x".to_string(),
            CacheWriteOptions::new().ttl(Duration::from_millis(10)),
        );
        cache.set(
            "later",
            "y".to_string(),
            CacheWriteOptions::new().ttl(Duration::from_secs(60)),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.metrics().size, 1);

        // Idle patterns beyond the retention horizon are dropped.
        seed_pattern(&cache, "stale", 1, Instant::now());
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.sweep();
        assert!(!cache.patterns.lock().contains_key("stale"));
    }

    #[test]
    fn delete_and_metrics() {
        let cache = cache();
        cache.set("k", "v".to_string(), CacheWriteOptions::new());
        assert!(cache.delete("k"));
        assert!(!cache.delete("k"));

        let _ = cache.get("k");
        let metrics = cache.metrics();
        assert_eq!(metrics.misses, 1);
        assert_eq!(metrics.hits, 0);
        assert_eq!(metrics.hit_rate, 0.0);
    }

    #[test]
    fn access_pattern_tracks_average_interval() {
        let cache = cache();
        let start = Instant::now();
        cache.record_access("k", start);
        cache.record_access("k", start + Duration::from_millis(100));
        cache.record_access("k", start + Duration::from_millis(300));

        let patterns = cache.patterns.lock();
        let pattern = patterns.get("k").unwrap();
        assert_eq!(pattern.access_count, 3);
        // Intervals of 100ms and 200ms average to 150ms.
        assert_eq!(pattern.average_interval, Duration::from_millis(150));
    }
}
