//! External graph sources the cache mirror is refreshed from.
//!
//! - [`GraphSource`] - Read access to one source (types, entity and
//!   relationship streams, counts)
//! - [`RetryingSource`] - Backoff retries plus single-flight for any source
//! - [`HealthRegistry`] - Per-source health as of the last refresh
//!
//! # Usage
//!
//! ```ignore
//! use twingraph::source::{from_config, HealthRegistry};
//!
//! let health = HealthRegistry::new();
//! let sources = from_config(&config, &health)?;
//! for source in &sources {
//!     let types = source.list_types(&config.scope).await?;
//! }
//! ```

mod health;
mod retry;
mod traits;

pub mod backends;

pub use health::{HealthRegistry, SourceHealth};
pub use retry::{RetryPolicy, RetryingSource, SingleFlight};
pub use traits::{EntityStream, GraphSource, RelationshipStream};

use std::sync::Arc;

use crate::config::{Config, SourceKind};
use crate::error::AppError;
use backends::memory::MemorySource;
use backends::snapshot::SnapshotSource;

/// Builds every configured source, each wrapped in a [`RetryingSource`].
pub fn from_config(
    config: &Config,
    health: &HealthRegistry,
) -> Result<Vec<Arc<dyn GraphSource>>, AppError> {
    let policy = RetryPolicy::from_config(&config.retry);
    let mut sources: Vec<Arc<dyn GraphSource>> = Vec::with_capacity(config.sources.len());

    for source in &config.sources {
        let inner: Arc<dyn GraphSource> = match source.kind {
            SourceKind::Snapshot => {
                let path = source.path.as_ref().ok_or_else(|| {
                    AppError::Validation(format!(
                        "source '{}' is a snapshot but has no path",
                        source.name
                    ))
                })?;
                Arc::new(SnapshotSource::new(&source.name, path))
            }
            SourceKind::Memory => Arc::new(MemorySource::new(&source.name)),
        };
        sources.push(Arc::new(RetryingSource::new(
            inner,
            policy.clone(),
            health.clone(),
        )));
    }

    Ok(sources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;

    #[test]
    fn test_snapshot_without_path_rejected() {
        let config = Config {
            sources: vec![SourceConfig {
                name: "broken".to_string(),
                kind: SourceKind::Snapshot,
                path: None,
            }],
            ..Config::default()
        };
        assert!(matches!(
            from_config(&config, &HealthRegistry::new()),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_builds_named_sources() {
        let config = Config {
            sources: vec![
                SourceConfig {
                    name: "a".to_string(),
                    kind: SourceKind::Memory,
                    path: None,
                },
                SourceConfig {
                    name: "b".to_string(),
                    kind: SourceKind::Snapshot,
                    path: Some("twins.json".into()),
                },
            ],
            ..Config::default()
        };
        let sources = from_config(&config, &HealthRegistry::new()).unwrap();
        let names: Vec<&str> = sources.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
