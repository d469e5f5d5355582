//! Retry with exponential backoff and single-flight de-duplication.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};

use crate::config::RetryConfig;
use crate::error::AppError;
use crate::models::TypeNode;
use crate::source::health::HealthRegistry;
use crate::source::traits::{EntityStream, GraphSource, RelationshipStream};

/// Bounded exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    /// Delay before the retry following failed attempt `attempt` (0-based),
    /// or `None` when the error is not retryable or attempts are used up.
    pub fn next_delay(&self, attempt: u32, err: &AppError) -> Option<Duration> {
        if !err.is_retryable() || attempt + 1 >= self.max_attempts {
            return None;
        }
        let factor = 2u32.saturating_pow(attempt);
        Some(self.base_delay.saturating_mul(factor).min(self.max_delay))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Everything a retried call needs, detached from the wrapper's lifetime.
#[derive(Clone)]
struct RetryContext {
    source: String,
    policy: RetryPolicy,
    health: HealthRegistry,
}

impl RetryContext {
    async fn run<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) => match self.policy.next_delay(attempt, &err) {
                    Some(delay) => {
                        tracing::warn!(
                            source = %self.source,
                            op,
                            attempt,
                            ?delay,
                            error = %err,
                            "source call failed, retrying"
                        );
                        self.health.mark_degraded(&self.source, &err);
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => return Err(err),
                },
            }
        }
    }
}

type SharedCall<T> = Shared<BoxFuture<'static, Result<T, Arc<AppError>>>>;

/// At most one in-flight call per key; concurrent callers share its result.
pub struct SingleFlight<T> {
    inflight: DashMap<String, SharedCall<T>>,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: DashMap::new(),
        }
    }

    /// Runs `call` unless a call for `key` is already in flight, in which
    /// case its outcome is awaited instead.
    pub async fn run<F>(&self, key: &str, call: F) -> Result<T, AppError>
    where
        F: Future<Output = Result<T, AppError>> + Send + 'static,
    {
        let shared = self
            .inflight
            .entry(key.to_string())
            .or_insert_with(|| call.map(|result| result.map_err(Arc::new)).boxed().shared())
            .clone();

        let result = shared.clone().await;
        self.inflight
            .remove_if(key, |_, current| current.ptr_eq(&shared));
        result.map_err(AppError::Shared)
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// A [`GraphSource`] wrapper adding backoff retries and single-flight
/// de-duplication of the bounded queries (types and counts).
///
/// Streams are retried only while opening; a stream that fails midway is
/// handed to the caller as is. Backoff sleeps are plain awaits: callers
/// racing a call against [`CancellationToken::guard`] abandon the sleep
/// with the call.
///
/// [`CancellationToken::guard`]: crate::pipeline::CancellationToken::guard
pub struct RetryingSource {
    inner: Arc<dyn GraphSource>,
    context: RetryContext,
    types: SingleFlight<Vec<TypeNode>>,
    counts: SingleFlight<u64>,
}

impl RetryingSource {
    pub fn new(inner: Arc<dyn GraphSource>, policy: RetryPolicy, health: HealthRegistry) -> Self {
        let context = RetryContext {
            source: inner.name().to_string(),
            policy,
            health,
        };
        Self {
            inner,
            context,
            types: SingleFlight::new(),
            counts: SingleFlight::new(),
        }
    }
}

#[async_trait]
impl GraphSource for RetryingSource {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn list_types(&self, scope: &str) -> Result<Vec<TypeNode>, AppError> {
        let inner = self.inner.clone();
        let context = self.context.clone();
        let scope_owned = scope.to_string();
        let call = async move {
            context
                .run("list_types", || {
                    let inner = inner.clone();
                    let scope = scope_owned.clone();
                    async move { inner.list_types(&scope).await }
                })
                .await
        };
        self.types.run(&format!("types:{scope}"), call).await
    }

    async fn list_entities(&self, scope: &str) -> Result<EntityStream<'_>, AppError> {
        self.context
            .run("list_entities", || self.inner.list_entities(scope))
            .await
    }

    async fn list_relationships(&self, scope: &str) -> Result<RelationshipStream<'_>, AppError> {
        self.context
            .run("list_relationships", || self.inner.list_relationships(scope))
            .await
    }

    async fn entity_count(&self, scope: &str) -> Result<u64, AppError> {
        let inner = self.inner.clone();
        let context = self.context.clone();
        let scope_owned = scope.to_string();
        let call = async move {
            context
                .run("entity_count", || {
                    let inner = inner.clone();
                    let scope = scope_owned.clone();
                    async move { inner.entity_count(&scope).await }
                })
                .await
        };
        self.counts.run(&format!("entities:{scope}"), call).await
    }

    async fn relationship_count(&self, scope: &str) -> Result<u64, AppError> {
        let inner = self.inner.clone();
        let context = self.context.clone();
        let scope_owned = scope.to_string();
        let call = async move {
            context
                .run("relationship_count", || {
                    let inner = inner.clone();
                    let scope = scope_owned.clone();
                    async move { inner.relationship_count(&scope).await }
                })
                .await
        };
        self.counts.run(&format!("relationships:{scope}"), call).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceFault;
    use crate::source::backends::memory::MemorySource;
    use crate::source::health::SourceHealth;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(4))
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(6, Duration::from_millis(100), Duration::from_millis(300));
        let err = AppError::source_failure("s", SourceFault::Transient, "x");
        assert_eq!(policy.next_delay(0, &err), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_delay(1, &err), Some(Duration::from_millis(200)));
        assert_eq!(policy.next_delay(2, &err), Some(Duration::from_millis(300)));
        assert_eq!(policy.next_delay(5, &err), None);

        let fatal = AppError::source_failure("s", SourceFault::Fatal, "x");
        assert_eq!(policy.next_delay(0, &fatal), None);
    }

    #[tokio::test]
    async fn test_retries_transient_failures_and_marks_degraded() {
        let source = MemorySource::new("flaky")
            .with_types(vec![TypeNode::new("Room")])
            .fail_first(2, SourceFault::RateLimited);
        let health = HealthRegistry::new();
        let retrying = RetryingSource::new(Arc::new(source), fast_policy(5), health.clone());

        let types = retrying.list_types("s").await.unwrap();
        assert_eq!(types.len(), 1);
        assert!(matches!(health.get("flaky"), SourceHealth::Degraded { .. }));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_backoff() {
        use crate::pipeline::CancellationToken;

        let source = MemorySource::new("flaky")
            .with_types(vec![TypeNode::new("Room")])
            .fail_first(1, SourceFault::Transient);
        let slow = RetryPolicy::new(3, Duration::from_secs(10), Duration::from_secs(10));
        let retrying = RetryingSource::new(Arc::new(source), slow, HealthRegistry::new());
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let result = cancel.guard(retrying.list_types("s")).await;
        assert!(matches!(result, Err(AppError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let source = MemorySource::new("flaky").fail_first(10, SourceFault::Transient);
        let retrying = RetryingSource::new(Arc::new(source), fast_policy(3), HealthRegistry::new());
        let err = retrying.entity_count("s").await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_does_not_retry_fatal() {
        let source = Arc::new(MemorySource::new("broken").fail_first(1, SourceFault::Fatal));
        let retrying = RetryingSource::new(source.clone(), fast_policy(5), HealthRegistry::new());
        assert!(retrying.list_entities("s").await.is_err());
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_single_flight_shares_one_call() {
        let flight: Arc<SingleFlight<u64>> = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let flight = flight.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                flight
                    .run("key", async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(42)
                    })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(flight.in_flight(), 0);
    }
}
