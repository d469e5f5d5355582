//! In-process graph source, populated programmatically.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use crate::error::{AppError, SourceFault};
use crate::models::{Entity, Relationship, TypeNode};
use crate::source::traits::{EntityStream, GraphSource, RelationshipStream};

/// A [`GraphSource`] serving fixed in-memory data.
///
/// Fault injection (`fail_first`, `fail_on`, `unavailable`) and latency
/// injection (`with_call_delay`, `with_row_delay`) make it usable for
/// exercising retry, cancellation and per-source failure handling.
#[derive(Debug, Default)]
pub struct MemorySource {
    name: String,
    types: Vec<TypeNode>,
    entities: Vec<Entity>,
    relationships: Vec<Relationship>,
    /// Raw rows yielded as validation failures among the entities.
    malformed_entities: usize,
    failures_left: AtomicUsize,
    fault: Option<SourceFault>,
    /// Operation that fails on every call, whatever `failures_left` says.
    failing_op: Option<(String, SourceFault)>,
    call_delay: Duration,
    row_delay: Duration,
    calls: AtomicUsize,
}

impl MemorySource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_types(mut self, types: Vec<TypeNode>) -> Self {
        self.types = types;
        self
    }

    pub fn with_entities(mut self, entities: Vec<Entity>) -> Self {
        self.entities = entities;
        self
    }

    pub fn with_relationships(mut self, relationships: Vec<Relationship>) -> Self {
        self.relationships = relationships;
        self
    }

    /// Appends `count` rows that fail validation to the entity stream.
    pub fn with_malformed_entities(mut self, count: usize) -> Self {
        self.malformed_entities = count;
        self
    }

    /// The first `count` calls fail with `fault`.
    pub fn fail_first(mut self, count: usize, fault: SourceFault) -> Self {
        self.failures_left = AtomicUsize::new(count);
        self.fault = Some(fault);
        self
    }

    /// Every call of `op` (e.g. `"list_relationships"`) fails with `fault`.
    pub fn fail_on(mut self, op: impl Into<String>, fault: SourceFault) -> Self {
        self.failing_op = Some((op.into(), fault));
        self
    }

    /// Each call waits `delay` before answering.
    pub fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = delay;
        self
    }

    /// Each relationship row waits `delay` before being yielded.
    pub fn with_row_delay(mut self, delay: Duration) -> Self {
        self.row_delay = delay;
        self
    }

    /// Every call fails as unreachable.
    pub fn unavailable(self) -> Self {
        self.fail_first(usize::MAX, SourceFault::Unavailable)
    }

    /// Number of calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn enter(&self, op: &str) -> Result<(), AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.call_delay.is_zero() {
            tokio::time::sleep(self.call_delay).await;
        }
        if let Some((failing, fault)) = &self.failing_op {
            if failing == op {
                return Err(AppError::source_failure(
                    &self.name,
                    *fault,
                    format!("{op} failed"),
                ));
            }
        }
        let Some(fault) = self.fault else {
            return Ok(());
        };
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            Err(AppError::source_failure(
                &self.name,
                fault,
                format!("{op} failed"),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl GraphSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_types(&self, _scope: &str) -> Result<Vec<TypeNode>, AppError> {
        self.enter("list_types").await?;
        Ok(self.types.clone())
    }

    async fn list_entities(&self, _scope: &str) -> Result<EntityStream<'_>, AppError> {
        self.enter("list_entities").await?;
        let valid = self.entities.iter().cloned().map(Ok);
        let malformed = (0..self.malformed_entities).map(|n| {
            Err(AppError::Validation(format!("malformed entity row {n}")))
        });
        Ok(Box::pin(futures::stream::iter(valid.chain(malformed))))
    }

    async fn list_relationships(&self, _scope: &str) -> Result<RelationshipStream<'_>, AppError> {
        self.enter("list_relationships").await?;
        let delay = self.row_delay;
        let rows = futures::stream::iter(self.relationships.iter().cloned()).then(
            move |row| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok::<_, AppError>(row)
            },
        );
        Ok(Box::pin(rows))
    }

    async fn entity_count(&self, _scope: &str) -> Result<u64, AppError> {
        self.enter("entity_count").await?;
        Ok((self.entities.len() + self.malformed_entities) as u64)
    }

    async fn relationship_count(&self, _scope: &str) -> Result<u64, AppError> {
        self.enter("relationship_count").await?;
        Ok(self.relationships.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn test_serves_data() {
        let source = MemorySource::new("m")
            .with_entities(vec![Entity::new("A", "Room")])
            .with_relationships(vec![Relationship::new("A", "isPartOf", "B")]);
        let entities: Vec<Entity> = source
            .list_entities("s")
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(source.relationship_count("s").await.unwrap(), 1);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_fail_first_then_recover() {
        let source = MemorySource::new("m").fail_first(1, SourceFault::Transient);
        assert!(source.entity_count("s").await.is_err());
        assert!(source.entity_count("s").await.is_ok());
    }

    #[tokio::test]
    async fn test_fail_on_targets_one_operation() {
        let source = MemorySource::new("m")
            .with_relationships(vec![Relationship::new("A", "isPartOf", "B")])
            .fail_on("list_relationships", SourceFault::Unavailable);
        assert_eq!(source.relationship_count("s").await.unwrap(), 1);
        assert!(source.list_relationships("s").await.is_err());
        assert!(source.list_relationships("s").await.is_err());
    }

    #[tokio::test]
    async fn test_row_delay_paces_relationships() {
        let source = MemorySource::new("m")
            .with_relationships(vec![
                Relationship::new("A", "isPartOf", "B"),
                Relationship::new("B", "isPartOf", "C"),
            ])
            .with_row_delay(Duration::from_millis(20));
        let started = std::time::Instant::now();
        let rows: Vec<Relationship> = source
            .list_relationships("s")
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_unavailable_always_fails() {
        let source = MemorySource::new("m").unavailable();
        for _ in 0..3 {
            let err = source.list_types("s").await.unwrap_err();
            assert!(!err.is_retryable());
        }
    }
}
