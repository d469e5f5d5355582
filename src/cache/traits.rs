//! Cache store traits.
//!
//! - [`CacheStore`] - Required for every cache backend
//! - [`CacheExt`] - `get_or_create`, implemented for every store

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;

use crate::error::AppError;

/// A stream of cached values.
///
/// Backends may yield lazily; callers should not assume the whole scope is
/// in memory.
pub type CacheStream<'a, V> = Pin<Box<dyn Stream<Item = Result<V, AppError>> + Send + 'a>>;

/// A keyed, scoped value store with per-entry write timestamps.
///
/// Every write stamps the entry with the time it happened. Staleness
/// eviction ([`remove_older_than`](CacheStore::remove_older_than)) is the only
/// bulk deletion path.
#[async_trait]
pub trait CacheStore<V>: Send + Sync
where
    V: Clone + Send + Sync + 'static,
{
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Returns the value under `(scope, key)`, if present.
    async fn try_get(&self, scope: &str, key: &str) -> Result<Option<V>, AppError>;

    /// Inserts or overwrites the value and refreshes its write timestamp.
    async fn add_or_update(&self, scope: &str, key: &str, value: V) -> Result<(), AppError>;

    /// Streams every value in the scope.
    async fn get_all(&self, scope: &str) -> Result<CacheStream<'_, V>, AppError>;

    /// Number of entries in the scope.
    async fn count(&self, scope: &str) -> Result<usize, AppError>;

    /// Removes one entry. Returns whether it existed.
    async fn remove(&self, scope: &str, key: &str) -> Result<bool, AppError>;

    /// Removes every entry in the scope last written before `epoch`.
    ///
    /// Returns the number of evicted entries.
    async fn remove_older_than(
        &self,
        scope: &str,
        epoch: DateTime<Utc>,
    ) -> Result<usize, AppError>;
}

/// Extension trait providing read-through access.
#[async_trait]
pub trait CacheExt<V>: CacheStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Returns the cached value or computes, stores and returns it.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let graph = caches
    ///     .system_graphs
    ///     .get_or_create(scope, &key, || extractor.compute(seeds))
    ///     .await?;
    /// ```
    async fn get_or_create<F, Fut>(&self, scope: &str, key: &str, factory: F) -> Result<V, AppError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<V, AppError>> + Send,
    {
        if let Some(value) = self.try_get(scope, key).await? {
            return Ok(value);
        }
        let value = factory().await?;
        self.add_or_update(scope, key, value.clone()).await?;
        Ok(value)
    }
}

// Blanket implementation for all CacheStore types
impl<V, C> CacheExt<V> for C
where
    C: CacheStore<V> + ?Sized,
    V: Clone + Send + Sync + 'static,
{
}
