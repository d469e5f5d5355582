//! In-process cache backend on a concurrent map.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::cache::traits::{CacheStore, CacheStream};
use crate::error::AppError;

#[derive(Debug, Clone)]
struct Stamped<V> {
    value: V,
    written_at: DateTime<Utc>,
}

/// A [`CacheStore`] keeping every entry in memory.
///
/// Entries are keyed by `(scope, key)`. Reads of one key never block writes
/// to another; `get_all` streams a point-in-time snapshot of the scope.
#[derive(Debug)]
pub struct MemoryCache<V> {
    name: String,
    entries: DashMap<(String, String), Stamped<V>>,
}

impl<V> MemoryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: DashMap::new(),
        }
    }

    /// Writes an entry with an explicit timestamp.
    pub fn insert_at(&self, scope: &str, key: &str, value: V, written_at: DateTime<Utc>) {
        self.entries.insert(
            (scope.to_string(), key.to_string()),
            Stamped { value, written_at },
        );
    }

    /// Write timestamp of an entry.
    pub fn written_at(&self, scope: &str, key: &str) -> Option<DateTime<Utc>> {
        self.entries
            .get(&(scope.to_string(), key.to_string()))
            .map(|entry| entry.written_at)
    }

    /// Keys present in the scope, sorted.
    pub fn keys(&self, scope: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().0 == scope)
            .map(|entry| entry.key().1.clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl<V> CacheStore<V> for MemoryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn try_get(&self, scope: &str, key: &str) -> Result<Option<V>, AppError> {
        Ok(self
            .entries
            .get(&(scope.to_string(), key.to_string()))
            .map(|entry| entry.value.clone()))
    }

    async fn add_or_update(&self, scope: &str, key: &str, value: V) -> Result<(), AppError> {
        self.insert_at(scope, key, value, Utc::now());
        Ok(())
    }

    async fn get_all(&self, scope: &str) -> Result<CacheStream<'_, V>, AppError> {
        let values: Vec<Result<V, AppError>> = self
            .entries
            .iter()
            .filter(|entry| entry.key().0 == scope)
            .map(|entry| Ok(entry.value().value.clone()))
            .collect();
        Ok(Box::pin(futures::stream::iter(values)))
    }

    async fn count(&self, scope: &str) -> Result<usize, AppError> {
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().0 == scope)
            .count())
    }

    async fn remove(&self, scope: &str, key: &str) -> Result<bool, AppError> {
        Ok(self
            .entries
            .remove(&(scope.to_string(), key.to_string()))
            .is_some())
    }

    async fn remove_older_than(
        &self,
        scope: &str,
        epoch: DateTime<Utc>,
    ) -> Result<usize, AppError> {
        let mut evicted = 0;
        self.entries.retain(|(entry_scope, _), entry| {
            let stale = entry_scope == scope && entry.written_at < epoch;
            if stale {
                evicted += 1;
            }
            !stale
        });
        tracing::debug!(cache = %self.name, scope, evicted, "evicted stale entries");
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheExt;
    use chrono::Duration;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn test_add_get_remove() {
        let cache: MemoryCache<u32> = MemoryCache::new("test");
        cache.add_or_update("s", "k", 1u32).await.unwrap();
        assert_eq!(cache.try_get("s", "k").await.unwrap(), Some(1));
        assert_eq!(cache.try_get("other", "k").await.unwrap(), None);

        cache.add_or_update("s", "k", 2).await.unwrap();
        assert_eq!(cache.try_get("s", "k").await.unwrap(), Some(2));
        assert_eq!(cache.count("s").await.unwrap(), 1);

        assert!(cache.remove("s", "k").await.unwrap());
        assert!(!cache.remove("s", "k").await.unwrap());
    }

    #[tokio::test]
    async fn test_get_all_is_scoped() {
        let cache: MemoryCache<u32> = MemoryCache::new("test");
        cache.add_or_update("a", "1", 1u32).await.unwrap();
        cache.add_or_update("a", "2", 2).await.unwrap();
        cache.add_or_update("b", "3", 3).await.unwrap();

        let mut values: Vec<u32> = cache.get_all("a").await.unwrap().try_collect().await.unwrap();
        values.sort();
        assert_eq!(values, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_remove_older_than_keeps_fresh_and_other_scopes() {
        let cache: MemoryCache<u32> = MemoryCache::new("test");
        let epoch = Utc::now();
        cache.insert_at("s", "stale", 1u32, epoch - Duration::hours(1));
        cache.insert_at("s", "fresh", 2, epoch);
        cache.insert_at("other", "stale", 3, epoch - Duration::hours(1));

        let evicted = cache.remove_older_than("s", epoch).await.unwrap();
        assert_eq!(evicted, 1);
        assert_eq!(cache.keys("s"), vec!["fresh".to_string()]);
        assert_eq!(cache.count("other").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_get_or_create_computes_once() {
        let cache: MemoryCache<u32> = MemoryCache::new("test");
        let first = cache
            .get_or_create("s", "k", || async { Ok::<_, AppError>(7u32) })
            .await
            .unwrap();
        let second = cache
            .get_or_create("s", "k", || async { Ok::<_, AppError>(99u32) })
            .await
            .unwrap();
        assert_eq!(first, 7);
        assert_eq!(second, 7);
    }
}
