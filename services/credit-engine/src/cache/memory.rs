use super::{CacheStore, Decrement};
use crate::errors::CacheError;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct CachedBalance {
    value: i64,
    expires_at: Instant,
}

impl CachedBalance {
    fn new(value: i64, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// In-process balance cache.
///
/// Read-modify-write sequences run under the shard lock of the key's entry,
/// never a map-wide lock.
#[derive(Clone, Default)]
pub struct InMemoryCache {
    entries: Arc<DashMap<String, CachedBalance>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle a simulated transport failure
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Live entry count
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_live()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), CacheError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::StorageUnavailable(
                "simulated cache outage".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<i64>, CacheError> {
        self.check_available()?;

        let cached = self.entries.get(key).map(|entry| *entry);
        match cached {
            Some(entry) if entry.is_live() => Ok(Some(entry.value)),
            Some(_) => {
                self.entries.remove_if(key, |_, entry| !entry.is_live());
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<(), CacheError> {
        self.check_available()?;
        self.entries
            .insert(key.to_string(), CachedBalance::new(value, ttl));
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        self.check_available()?;
        self.entries.remove(key);
        Ok(())
    }

    async fn decrement_if_at_least(
        &self,
        key: &str,
        cost: i64,
        ttl: Duration,
    ) -> Result<Decrement, CacheError> {
        self.check_available()?;

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let current = *entry.get();
                if !current.is_live() {
                    entry.remove();
                    return Ok(Decrement::Missing);
                }
                if current.value < cost {
                    return Ok(Decrement::Insufficient(current.value));
                }

                let updated = current.value - cost;
                entry.insert(CachedBalance::new(updated, ttl));
                Ok(Decrement::Applied(updated))
            }
            Entry::Vacant(_) => Ok(Decrement::Missing),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_set_overwrites_and_get_returns_value() {
        let cache = InMemoryCache::new();
        cache.set("k", 10, TTL).await.unwrap();
        cache.set("k", 7, TTL).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(7));
        assert_eq!(cache.get("other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let cache = InMemoryCache::new();
        cache.set("k", 10, Duration::from_millis(20)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(cache.get("k").await.unwrap(), None);
        assert_eq!(
            cache.decrement_if_at_least("k", 1, TTL).await.unwrap(),
            Decrement::Missing
        );
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_decrement_respects_floor() {
        let cache = InMemoryCache::new();
        cache.set("k", 2, TTL).await.unwrap();

        assert_eq!(cache.decrement_if_at_least("k", 1, TTL).await.unwrap(), Decrement::Applied(1));
        assert_eq!(cache.decrement_if_at_least("k", 1, TTL).await.unwrap(), Decrement::Applied(0));
        assert_eq!(
            cache.decrement_if_at_least("k", 1, TTL).await.unwrap(),
            Decrement::Insufficient(0)
        );
        assert_eq!(cache.get("k").await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_concurrent_decrements_never_overdraw() {
        let cache = InMemoryCache::new();
        cache.set("k", 50, TTL).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..200 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.decrement_if_at_least("k", 1, TTL).await.unwrap()
            }));
        }

        let mut applied = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), Decrement::Applied(_)) {
                applied += 1;
            }
        }

        assert_eq!(applied, 50);
        assert_eq!(cache.get("k").await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_simulated_outage() {
        let cache = InMemoryCache::new();
        cache.set_unavailable(true);
        assert!(cache.get("k").await.is_err());
        assert!(cache.set("k", 1, TTL).await.is_err());
    }
}
