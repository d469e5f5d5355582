//! External graph source trait.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::AppError;
use crate::models::{Entity, Relationship, TypeNode};

/// A stream of entities read from a source.
pub type EntityStream<'a> = Pin<Box<dyn Stream<Item = Result<Entity, AppError>> + Send + 'a>>;

/// A stream of relationships read from a source.
pub type RelationshipStream<'a> =
    Pin<Box<dyn Stream<Item = Result<Relationship, AppError>> + Send + 'a>>;

/// Read access to one external twin graph.
///
/// Implementations report failures as [`AppError::Source`] with a fault
/// classification so callers can decide whether to retry. Malformed rows
/// may be yielded as [`AppError::Validation`] items; consumers skip those
/// and keep reading.
#[async_trait]
pub trait GraphSource: Send + Sync {
    /// Name used in logs, health and summaries.
    fn name(&self) -> &str;

    /// All type definitions of the scope.
    async fn list_types(&self, scope: &str) -> Result<Vec<TypeNode>, AppError>;

    /// Streams every entity of the scope.
    async fn list_entities(&self, scope: &str) -> Result<EntityStream<'_>, AppError>;

    /// Streams every relationship of the scope.
    async fn list_relationships(&self, scope: &str) -> Result<RelationshipStream<'_>, AppError>;

    /// Number of entities, used for progress totals.
    async fn entity_count(&self, scope: &str) -> Result<u64, AppError>;

    /// Number of relationships, used for progress totals.
    async fn relationship_count(&self, scope: &str) -> Result<u64, AppError>;
}
