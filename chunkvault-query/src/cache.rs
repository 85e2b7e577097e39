//! TTL cache for query results.
//!
//! Entries expire on age alone. Nothing here listens to writes, so a cached
//! result can be up to one TTL behind the repository.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

type SharedValue = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub data: T,
    pub timestamp: Instant,
    pub hit_count: u64,
}

impl<T> CacheEntry<T> {
    fn new(data: T) -> Self {
        Self { data, timestamp: Instant::now(), hit_count: 0 }
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        self.timestamp.elapsed() < ttl
    }
}

pub struct QueryCache {
    entries: Mutex<HashMap<String, CacheEntry<SharedValue>>>,
    ttl: Duration,
}

impl QueryCache {
    pub fn new(ttl: Duration) -> Self {
        Self { entries: Mutex::new(HashMap::new()), ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry<SharedValue>>> {
        // entries are plain values, a panic elsewhere can't leave them half written
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fresh value for `key`, counting the hit. Expired entries are dropped.
    /// A value stored under `key` with another type is treated as a miss.
    pub fn get<T>(&self, key: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let mut entries = self.lock();
        let entry = entries.get_mut(key)?;
        if !entry.is_fresh(self.ttl) {
            entries.remove(key);
            return None;
        }
        let value = entry.data.clone().downcast::<T>().ok()?;
        entry.hit_count += 1;
        Some(value)
    }

    /// Store with a fresh timestamp and a zero hit count.
    pub fn insert<T>(&self, key: impl Into<String>, value: Arc<T>)
    where
        T: Any + Send + Sync,
    {
        self.lock().insert(key.into(), CacheEntry::new(value as SharedValue));
    }

    pub fn hit_count(&self, key: &str) -> Option<u64> {
        self.lock().get(key).map(|e| e.hit_count)
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Drop every expired entry. Returns how many went.
    pub fn evict_expired(&self) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, e| e.is_fresh(self.ttl));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_hit_within_ttl_then_expiry() {
        let cache = QueryCache::new(Duration::from_secs(10));
        cache.insert("radius_0_0_1", Arc::new(vec![1, 2, 3]));

        assert_eq!(cache.get::<Vec<i32>>("radius_0_0_1").as_deref(), Some(&vec![1, 2, 3]));
        assert_eq!(cache.get::<Vec<i32>>("radius_0_0_1").as_deref(), Some(&vec![1, 2, 3]));
        assert_eq!(cache.hit_count("radius_0_0_1"), Some(2));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.get::<Vec<i32>>("radius_0_0_1").is_none());
        assert_eq!(cache.hit_count("radius_0_0_1"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_expired_keeps_fresh_entries() {
        let cache = QueryCache::new(Duration::from_secs(10));
        cache.insert("old", Arc::new(1u32));
        tokio::time::advance(Duration::from_secs(6)).await;
        cache.insert("new", Arc::new(2u32));
        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(cache.evict_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get::<u32>("new").as_deref(), Some(&2));
    }

    #[test]
    fn test_type_mismatch_is_a_miss() {
        let cache = QueryCache::default();
        cache.insert("biome_plains", Arc::new(String::from("x")));
        assert!(cache.get::<u64>("biome_plains").is_none());
        assert_eq!(cache.hit_count("biome_plains"), Some(0));
        cache.clear();
        assert!(cache.is_empty());
    }
}
