//! Bounded in-memory cache with LRU eviction and expiries.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use depot_core::{Cache, MemoryPolicy, StoreKey, StoreValue};
use tokio::time::Instant;

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses, expired entries included.
    pub misses: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
    /// Number of evictions due to capacity.
    pub evictions: u64,
    /// Number of entries dropped because they expired.
    pub expirations: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Slot<V> {
    value: V,
    written_at: Instant,
    accessed_at: Instant,
    /// Position in the recency index.
    tick: u64,
}

struct Inner<K, V> {
    slots: HashMap<K, Slot<V>>,
    /// Recency index: lowest tick is least recently used.
    recency: BTreeMap<u64, K>,
    next_tick: u64,
    stats: CacheStats,
}

impl<K: StoreKey, V> Inner<K, V> {
    fn touch(&mut self, key: &K) {
        let tick = self.next_tick;
        self.next_tick += 1;
        if let Some(slot) = self.slots.get_mut(key) {
            self.recency.remove(&slot.tick);
            slot.tick = tick;
            self.recency.insert(tick, key.clone());
        }
    }

    fn remove(&mut self, key: &K) -> Option<Slot<V>> {
        let slot = self.slots.remove(key)?;
        self.recency.remove(&slot.tick);
        Some(slot)
    }
}

/// [`Cache`] implementation driven by a [`MemoryPolicy`].
///
/// Expiry is checked lazily on access; capacity is enforced on insert.
pub struct MemoryCache<K, V> {
    inner: Mutex<Inner<K, V>>,
    max_size: Option<u64>,
    expire_after_write: Option<Duration>,
    expire_after_access: Option<Duration>,
}

impl<K: StoreKey, V: StoreValue> MemoryCache<K, V> {
    pub fn new(policy: &MemoryPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: HashMap::new(),
                recency: BTreeMap::new(),
                next_tick: 0,
                stats: CacheStats::default(),
            }),
            max_size: policy.max_size,
            expire_after_write: policy.expire_after_write(),
            expire_after_access: policy.expire_after_access(),
        }
    }

    /// A cache with no bound and no expiry.
    pub fn unbounded() -> Self {
        Self::new(&MemoryPolicy::default())
    }

    fn inner(&self) -> MutexGuard<'_, Inner<K, V>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_expired(&self, slot: &Slot<V>, now: Instant) -> bool {
        let written = self
            .expire_after_write
            .is_some_and(|ttl| now.duration_since(slot.written_at) >= ttl);
        let accessed = self
            .expire_after_access
            .is_some_and(|ttl| now.duration_since(slot.accessed_at) >= ttl);
        written || accessed
    }

    pub fn len(&self) -> usize {
        self.inner().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner();
        CacheStats {
            entry_count: inner.slots.len() as u64,
            ..inner.stats.clone()
        }
    }
}

impl<K: StoreKey, V: StoreValue> Cache<K, V> for MemoryCache<K, V> {
    fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.inner();

        let expired = inner.slots.get(key).map(|slot| self.is_expired(slot, now));
        let Some(expired) = expired else {
            inner.stats.misses += 1;
            return None;
        };
        if expired {
            inner.remove(key);
            inner.stats.expirations += 1;
            inner.stats.misses += 1;
            return None;
        }

        inner.touch(key);
        inner.stats.hits += 1;
        let slot = inner.slots.get_mut(key)?;
        slot.accessed_at = now;
        Some(slot.value.clone())
    }

    fn put(&self, key: K, value: V) {
        let now = Instant::now();
        let mut inner = self.inner();
        inner.remove(&key);

        let tick = inner.next_tick;
        inner.next_tick += 1;
        inner.recency.insert(tick, key.clone());
        inner.slots.insert(
            key,
            Slot {
                value,
                written_at: now,
                accessed_at: now,
                tick,
            },
        );

        if let Some(max_size) = self.max_size {
            while inner.slots.len() as u64 > max_size {
                let Some((_, oldest)) = inner.recency.pop_first() else {
                    break;
                };
                inner.slots.remove(&oldest);
                inner.stats.evictions += 1;
            }
        }
    }

    fn invalidate(&self, key: &K) {
        self.inner().remove(key);
    }

    fn invalidate_all(&self) {
        let mut inner = self.inner();
        inner.slots.clear();
        inner.recency.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_invalidate() {
        let cache: MemoryCache<u32, String> = MemoryCache::unbounded();
        assert_eq!(cache.get(&1), None);

        cache.put(1, "one".to_string());
        cache.put(2, "two".to_string());
        assert_eq!(cache.get(&1), Some("one".to_string()));
        assert_eq!(cache.len(), 2);

        cache.invalidate(&1);
        assert_eq!(cache.get(&1), None);
        cache.invalidate_all();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lru_eviction_respects_access_order() {
        let cache: MemoryCache<u32, &str> =
            MemoryCache::new(&MemoryPolicy::new().with_max_size(2));
        cache.put(1, "one");
        cache.put(2, "two");
        // Touch 1 so that 2 becomes least recently used.
        assert_eq!(cache.get(&1), Some("one"));
        cache.put(3, "three");

        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&1), Some("one"));
        assert_eq!(cache.get(&3), Some("three"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_replacing_value_does_not_evict() {
        let cache: MemoryCache<u32, &str> =
            MemoryCache::new(&MemoryPolicy::new().with_max_size(1));
        cache.put(1, "a");
        cache.put(1, "b");
        assert_eq!(cache.get(&1), Some("b"));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_after_write() {
        let cache: MemoryCache<u32, &str> = MemoryCache::new(
            &MemoryPolicy::new().with_expire_after_write(Duration::from_secs(10)),
        );
        cache.put(1, "one");

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.get(&1), Some("one"));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_after_access_is_refreshed_by_reads() {
        let cache: MemoryCache<u32, &str> = MemoryCache::new(
            &MemoryPolicy::new().with_expire_after_access(Duration::from_secs(10)),
        );
        cache.put(1, "one");

        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(6)).await;
            assert_eq!(cache.get(&1), Some("one"));
        }

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.get(&1), None);
    }

    #[test]
    fn test_stats_hit_rate() {
        let cache: MemoryCache<u32, &str> = MemoryCache::unbounded();
        cache.put(1, "one");
        cache.get(&1);
        cache.get(&1);
        cache.get(&1);
        cache.get(&2);

        let stats = cache.stats();
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entry_count, 1);
        assert!((stats.hit_rate() - 0.75).abs() < 0.001);
        assert!((CacheStats::default().hit_rate() - 0.0).abs() < 0.001);
    }
}
