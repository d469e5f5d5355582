//! Graph source backed by a JSON snapshot file.
//!
//! The file holds one object with three arrays:
//!
//! ```json
//! {
//!   "types": [{ "id": "Room", "parents": ["Space"] }],
//!   "entities": [{ "id": "Room1", "type_id": "Room", "name": "Room 1" }],
//!   "relationships": [{ "source_id": "Room1", "relation": "isPartOf", "target_id": "Floor1" }]
//! }
//! ```
//!
//! Entity and relationship rows are decoded one at a time, so a single
//! malformed row surfaces as one failed stream item instead of failing the
//! whole file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;

use crate::error::{AppError, SourceFault};
use crate::models::{Entity, Relationship, TypeNode};
use crate::source::traits::{EntityStream, GraphSource, RelationshipStream};

#[derive(Debug, Default, Deserialize)]
struct Snapshot {
    #[serde(default)]
    types: Vec<TypeNode>,
    #[serde(default)]
    entities: Vec<JsonValue>,
    #[serde(default)]
    relationships: Vec<JsonValue>,
}

/// A [`GraphSource`] reading a snapshot file.
///
/// The file is re-read at the start of every refresh (on `list_types`), so
/// edits between refreshes are picked up. The other calls reuse the copy
/// read last, or read the file if none is loaded yet.
#[derive(Debug)]
pub struct SnapshotSource {
    name: String,
    path: PathBuf,
    snapshot: RwLock<Option<Arc<Snapshot>>>,
}

impl SnapshotSource {
    pub fn new(name: impl Into<String>, path: impl AsRef<Path>) -> Self {
        Self {
            name: name.into(),
            path: path.as_ref().to_path_buf(),
            snapshot: RwLock::new(None),
        }
    }

    /// The loaded snapshot, reading the file on first use.
    async fn current(&self) -> Result<Arc<Snapshot>, AppError> {
        if let Some(snapshot) = self.snapshot.read().await.as_ref() {
            return Ok(snapshot.clone());
        }
        self.reload().await
    }

    /// Reads the file and replaces the loaded snapshot.
    async fn reload(&self) -> Result<Arc<Snapshot>, AppError> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|err| {
            let fault = match err.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    SourceFault::Unavailable
                }
                _ => SourceFault::Transient,
            };
            AppError::source_failure(
                &self.name,
                fault,
                format!("cannot read {}: {}", self.path.display(), err),
            )
        })?;
        let snapshot: Snapshot = serde_json::from_slice(&bytes).map_err(|err| {
            AppError::source_failure(
                &self.name,
                SourceFault::Fatal,
                format!("invalid snapshot {}: {}", self.path.display(), err),
            )
        })?;
        tracing::info!(
            source = %self.name,
            types = snapshot.types.len(),
            entities = snapshot.entities.len(),
            relationships = snapshot.relationships.len(),
            "snapshot loaded"
        );
        let snapshot = Arc::new(snapshot);
        *self.snapshot.write().await = Some(snapshot.clone());
        Ok(snapshot)
    }
}

#[async_trait]
impl GraphSource for SnapshotSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_types(&self, _scope: &str) -> Result<Vec<TypeNode>, AppError> {
        Ok(self.reload().await?.types.clone())
    }

    async fn list_entities(&self, _scope: &str) -> Result<EntityStream<'_>, AppError> {
        let snapshot = self.current().await?;
        Ok(Box::pin(stream! {
            for row in snapshot.entities.iter() {
                yield serde_json::from_value::<Entity>(row.clone()).map_err(AppError::from);
            }
        }))
    }

    async fn list_relationships(&self, _scope: &str) -> Result<RelationshipStream<'_>, AppError> {
        let snapshot = self.current().await?;
        Ok(Box::pin(stream! {
            for row in snapshot.relationships.iter() {
                yield serde_json::from_value::<Relationship>(row.clone()).map_err(AppError::from);
            }
        }))
    }

    async fn entity_count(&self, _scope: &str) -> Result<u64, AppError> {
        Ok(self.current().await?.entities.len() as u64)
    }

    async fn relationship_count(&self, _scope: &str) -> Result<u64, AppError> {
        Ok(self.current().await?.relationships.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::io::Write;

    fn write_snapshot(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn test_reads_rows_and_flags_malformed() {
        let file = write_snapshot(
            r#"{
                "types": [{ "id": "Room" }, { "id": "Floor" }],
                "entities": [
                    { "id": "Room1", "type_id": "Room", "name": "Room 1" },
                    { "name": "no ids" }
                ],
                "relationships": [
                    { "source_id": "Room1", "relation": "isPartOf", "target_id": "Floor1" }
                ]
            }"#,
        );
        let source = SnapshotSource::new("snap", file.path());

        assert_eq!(source.list_types("s").await.unwrap().len(), 2);
        assert_eq!(source.entity_count("s").await.unwrap(), 2);

        let rows: Vec<Result<Entity, AppError>> =
            source.list_entities("s").await.unwrap().collect().await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].as_ref().unwrap().id, "Room1");
        assert!(matches!(rows[1], Err(AppError::Serialization(_))));

        let rels: Vec<Result<Relationship, AppError>> =
            source.list_relationships("s").await.unwrap().collect().await;
        assert_eq!(rels[0].as_ref().unwrap().relation, "isPartOf");
    }

    #[tokio::test]
    async fn test_list_types_rereads_edited_file() {
        let file = write_snapshot(
            r#"{ "types": [{ "id": "Room" }], "entities": [{ "id": "Room1", "type_id": "Room" }] }"#,
        );
        let source = SnapshotSource::new("snap", file.path());
        assert_eq!(source.list_types("s").await.unwrap().len(), 1);
        assert_eq!(source.entity_count("s").await.unwrap(), 1);

        std::fs::write(
            file.path(),
            r#"{
                "types": [{ "id": "Room" }, { "id": "Floor" }],
                "entities": [
                    { "id": "Room1", "type_id": "Room" },
                    { "id": "Floor1", "type_id": "Floor" }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(source.entity_count("s").await.unwrap(), 1);
        assert_eq!(source.list_types("s").await.unwrap().len(), 2);
        assert_eq!(source.entity_count("s").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_missing_file_is_unavailable() {
        let source = SnapshotSource::new("snap", "/definitely/not/here.json");
        let err = source.list_types("s").await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Source {
                fault: SourceFault::Unavailable,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_invalid_json_is_fatal() {
        let file = write_snapshot("{ not json");
        let source = SnapshotSource::new("snap", file.path());
        let err = source.entity_count("s").await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Source {
                fault: SourceFault::Fatal,
                ..
            }
        ));
    }
}
