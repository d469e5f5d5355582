//! Per-source health tracking.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use crate::error::AppError;

/// Health of one source as of its last refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceHealth {
    /// Not refreshed yet, or a refresh is in progress.
    Unknown,
    Healthy { entities: u64, relationships: u64 },
    /// Calls needed retries but the source delivered.
    Degraded { reason: String },
    /// The source contributed nothing to the last refresh.
    Unavailable { reason: String },
}

/// Shared registry of source health, cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    states: Arc<DashMap<String, SourceHealth>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the start of a refresh for `source`.
    pub fn begin(&self, source: &str) {
        self.states.insert(source.to_string(), SourceHealth::Unknown);
    }

    pub fn mark_degraded(&self, source: &str, err: &AppError) {
        tracing::warn!(%source, error = %err, "source degraded");
        self.states.insert(
            source.to_string(),
            SourceHealth::Degraded {
                reason: err.to_string(),
            },
        );
    }

    pub fn mark_unavailable(&self, source: &str, err: &AppError) {
        tracing::error!(%source, error = %err, "source unavailable");
        self.states.insert(
            source.to_string(),
            SourceHealth::Unavailable {
                reason: err.to_string(),
            },
        );
    }

    /// Records a delivered refresh. A degradation seen during the same
    /// refresh is kept.
    pub fn finish(&self, source: &str, entities: u64, relationships: u64) {
        let mut entry = self
            .states
            .entry(source.to_string())
            .or_insert(SourceHealth::Unknown);
        if !matches!(*entry, SourceHealth::Degraded { .. }) {
            *entry = SourceHealth::Healthy {
                entities,
                relationships,
            };
        }
    }

    pub fn get(&self, source: &str) -> SourceHealth {
        self.states
            .get(source)
            .map(|state| state.clone())
            .unwrap_or(SourceHealth::Unknown)
    }

    /// All known sources, ordered by name.
    pub fn snapshot(&self) -> BTreeMap<String, SourceHealth> {
        self.states
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceFault;

    #[test]
    fn test_lifecycle() {
        let registry = HealthRegistry::new();
        assert_eq!(registry.get("a"), SourceHealth::Unknown);

        registry.begin("a");
        registry.finish("a", 10, 4);
        assert_eq!(
            registry.get("a"),
            SourceHealth::Healthy {
                entities: 10,
                relationships: 4
            }
        );
    }

    #[test]
    fn test_degradation_survives_finish() {
        let registry = HealthRegistry::new();
        registry.begin("a");
        registry.mark_degraded(
            "a",
            &AppError::source_failure("a", SourceFault::RateLimited, "429"),
        );
        registry.finish("a", 1, 1);
        assert!(matches!(registry.get("a"), SourceHealth::Degraded { .. }));

        registry.begin("a");
        registry.finish("a", 1, 1);
        assert!(matches!(registry.get("a"), SourceHealth::Healthy { .. }));
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let registry = HealthRegistry::new();
        registry.begin("b");
        registry.mark_unavailable(
            "a",
            &AppError::source_failure("a", SourceFault::Unavailable, "down"),
        );
        let names: Vec<String> = registry.snapshot().into_keys().collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }
}
