//! Process-local configuration cache
//!
//! TTL-bounded cache over config lookups with three properties the hot
//! path depends on:
//!
//! - **Negative entries**: "entity E has no custom config for resource R"
//!   is remembered with the same TTL as positive entries, otherwise every
//!   acquire for an unconfigured entity pays a full miss.
//! - **Singleflight**: concurrent misses for one key result in one
//!   back-end fetch; late arrivals wait on a per-key lock and read the
//!   freshly inserted entry.
//! - **Coarse invalidation**: configuration mutations clear the whole
//!   cache. Config changes are rare relative to acquires, so precision
//!   is not worth the bookkeeping.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::models::{Entity, FailureMode, Limit};

/// Default entry lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Cache observability counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Entries served from cache.
    pub hits: u64,
    /// Lookups that went to the store.
    pub misses: u64,
    /// Live entries (including expired-but-unswept).
    pub size: usize,
    /// Configured TTL in seconds.
    pub ttl_seconds: u64,
}

/// Cache key, sharded by lookup shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheKey {
    System,
    Resource(String),
    EntityLimits(String, Option<String>),
    Entity(String),
}

/// Cached payloads. Empty vectors and `None` entities are the negative
/// entries.
#[derive(Debug, Clone)]
enum CachedValue {
    System(Vec<Limit>, Option<FailureMode>),
    Limits(Vec<Limit>),
    Entity(Option<Entity>),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: CachedValue,
    expires_at: Instant,
}

/// TTL config cache with singleflight. `ttl = 0` disables caching
/// entirely: every lookup fetches.
pub struct ConfigCache {
    ttl: Duration,
    entries: DashMap<CacheKey, CacheEntry>,
    inflight: DashMap<CacheKey, Arc<Mutex<()>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for ConfigCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl ConfigCache {
    /// Cache with the given TTL. `Duration::ZERO` disables caching.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
            inflight: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Whether entries are being cached at all.
    pub fn enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    /// Drop every entry. Called on any configuration mutation.
    pub fn invalidate(&self) {
        self.entries.clear();
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.entries.len(),
            ttl_seconds: self.ttl.as_secs(),
        }
    }

    fn lookup(&self, key: &CacheKey) -> Option<CachedValue> {
        let entry = self.entries.get(key)?;
        if entry.expires_at <= Instant::now() {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    /// Singleflight get-or-fetch.
    async fn get_or_fetch<F, Fut>(&self, key: CacheKey, fetch: F) -> Result<CachedValue>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CachedValue>>,
    {
        if !self.enabled() {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return fetch().await;
        }

        if let Some(value) = self.lookup(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }

        let lock = self
            .inflight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // A concurrent fetch may have landed while we waited for the lock.
        if let Some(value) = self.lookup(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let result = fetch().await;
        if let Ok(value) = &result {
            self.entries.insert(
                key.clone(),
                CacheEntry {
                    value: value.clone(),
                    expires_at: Instant::now() + self.ttl,
                },
            );
        }
        drop(_guard);
        self.inflight.remove(&key);
        result
    }

    /// System defaults and unavailability policy.
    pub async fn get_system<F, Fut>(&self, fetch: F) -> Result<(Vec<Limit>, Option<FailureMode>)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(Vec<Limit>, Option<FailureMode>)>>,
    {
        let value = self
            .get_or_fetch(CacheKey::System, || async {
                let (limits, mode) = fetch().await?;
                Ok(CachedValue::System(limits, mode))
            })
            .await?;
        match value {
            CachedValue::System(limits, mode) => Ok((limits, mode)),
            _ => unreachable!("system key always holds a system value"),
        }
    }

    /// Resource-level defaults. An empty vector is cached as the negative
    /// entry.
    pub async fn get_resource_limits<F, Fut>(&self, resource: &str, fetch: F) -> Result<Vec<Limit>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<Limit>>>,
    {
        let value = self
            .get_or_fetch(CacheKey::Resource(resource.to_string()), || async {
                Ok(CachedValue::Limits(fetch().await?))
            })
            .await?;
        match value {
            CachedValue::Limits(limits) => Ok(limits),
            _ => unreachable!("resource key always holds limits"),
        }
    }

    /// Entity-level limits for an (entity, optional resource) pair.
    pub async fn get_entity_limits<F, Fut>(
        &self,
        entity_id: &str,
        resource: Option<&str>,
        fetch: F,
    ) -> Result<Vec<Limit>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<Limit>>>,
    {
        let key = CacheKey::EntityLimits(entity_id.to_string(), resource.map(str::to_string));
        let value = self
            .get_or_fetch(key, || async { Ok(CachedValue::Limits(fetch().await?)) })
            .await?;
        match value {
            CachedValue::Limits(limits) => Ok(limits),
            _ => unreachable!("entity-limits key always holds limits"),
        }
    }

    /// Entity metadata, cached for cascade-chain resolution. `None` (no
    /// such entity) is a negative entry.
    pub async fn get_entity<F, Fut>(&self, entity_id: &str, fetch: F) -> Result<Option<Entity>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<Entity>>>,
    {
        let value = self
            .get_or_fetch(CacheKey::Entity(entity_id.to_string()), || async {
                Ok(CachedValue::Entity(fetch().await?))
            })
            .await?;
        match value {
            CachedValue::Entity(entity) => Ok(entity),
            _ => unreachable!("entity key always holds an entity"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_cache_enabled_by_default() {
        let cache = ConfigCache::default();
        assert!(cache.enabled());
        assert_eq!(cache.stats().ttl_seconds, 60);
    }

    #[tokio::test]
    async fn test_zero_ttl_disables_caching() {
        let cache = ConfigCache::new(Duration::ZERO);
        assert!(!cache.enabled());

        let calls = AtomicUsize::new(0);
        for _ in 0..2 {
            cache
                .get_system(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok((vec![Limit::per_minute("tpm", 10_000)], None))
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_system_hit_and_miss() {
        let cache = ConfigCache::default();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let (limits, mode) = cache
                .get_system(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok((vec![Limit::per_minute("tpm", 10_000)], Some(FailureMode::Allow)))
                })
                .await
                .unwrap();
            assert_eq!(limits.len(), 1);
            assert_eq!(mode, Some(FailureMode::Allow));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.size, 1);
    }

    #[tokio::test]
    async fn test_negative_entry_for_entity_limits() {
        let cache = ConfigCache::default();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let limits = cache
                .get_entity_limits("user-1", Some("gpt-4"), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Vec::new())
                })
                .await
                .unwrap();
            assert!(limits.is_empty());
        }
        // absence was cached too
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_separate_entries_per_key_shape() {
        let cache = ConfigCache::default();

        cache
            .get_resource_limits("gpt-4", || async { Ok(vec![Limit::per_minute("tpm", 1)]) })
            .await
            .unwrap();
        cache
            .get_resource_limits("gpt-3.5", || async { Ok(vec![Limit::per_minute("tpm", 2)]) })
            .await
            .unwrap();
        cache
            .get_entity_limits("user-1", Some("gpt-4"), || async { Ok(Vec::new()) })
            .await
            .unwrap();
        cache
            .get_entity_limits("user-1", None, || async { Ok(Vec::new()) })
            .await
            .unwrap();

        assert_eq!(cache.stats().size, 4);

        let again = cache
            .get_resource_limits("gpt-4", || async { panic!("must be cached") })
            .await
            .unwrap();
        assert_eq!(again[0].capacity, 1);
    }

    #[tokio::test]
    async fn test_invalidate_clears_everything() {
        let cache = ConfigCache::default();
        cache.get_system(|| async { Ok((Vec::new(), None)) }).await.unwrap();
        cache
            .get_entity("e1", || async { Ok(Some(Entity::new("e1"))) })
            .await
            .unwrap();
        assert_eq!(cache.stats().size, 2);

        cache.invalidate();
        assert_eq!(cache.stats().size, 0);

        let calls = AtomicUsize::new(0);
        cache
            .get_system(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok((Vec::new(), None))
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_entry_refetches() {
        let cache = ConfigCache::new(Duration::from_millis(20));
        let calls = AtomicUsize::new(0);

        let fetch = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![Limit::per_minute("rpm", 10)])
        };
        cache.get_resource_limits("gpt-4", fetch).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        cache.get_resource_limits("gpt-4", fetch).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_singleflight_coalesces_concurrent_misses() {
        let cache = Arc::new(ConfigCache::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    cache
                        .get_system(move || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            Ok((vec![Limit::per_minute("tpm", 10_000)], None))
                        })
                        .await
                        .unwrap()
                })
            })
            .collect();

        for task in tasks {
            let (limits, _) = task.await.unwrap();
            assert_eq!(limits.len(), 1);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_entity_negative_caching() {
        let cache = ConfigCache::default();
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            let entity = cache
                .get_entity("ghost", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                })
                .await
                .unwrap();
            assert!(entity.is_none());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
