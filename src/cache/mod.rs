//! Cache layer for the mirrored graph and its derived graphs.
//!
//! All caches share one [`CacheStore`] contract: keyed by `(scope, key)`,
//! every write stamped with its time, and staleness eviction by epoch as the
//! only bulk deletion. [`CacheSet`] bundles the named caches the services use.
//!
//! # Usage
//!
//! ```ignore
//! use twingraph::cache::{CacheExt, CacheSet, CacheStore};
//!
//! let caches = CacheSet::in_memory();
//! caches.entities.add_or_update("default", "AHU1", entity).await?;
//! let found = caches.entities.try_get("default", "AHU1").await?;
//! ```

mod traits;

pub mod backends;

pub use traits::{CacheExt, CacheStore, CacheStream};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::models::{
    AdjacencyEntry, Entity, MetaGraph, OntologyGraph, Relationship, SystemGraph, TypeNode,
    TypeTemplate,
};
use backends::memory::MemoryCache;

/// Adjacency list value: one node's forward or backward edges.
pub type Adjacency = Vec<AdjacencyEntry>;

/// Every named cache used by the services.
#[derive(Clone)]
pub struct CacheSet {
    pub entities: Arc<dyn CacheStore<Entity>>,
    pub relationships: Arc<dyn CacheStore<Relationship>>,
    /// Node id → outgoing edges.
    pub forward: Arc<dyn CacheStore<Adjacency>>,
    /// Node id → incoming edges.
    pub backward: Arc<dyn CacheStore<Adjacency>>,
    pub types: Arc<dyn CacheStore<TypeNode>>,
    /// Sorted seed key → extracted system graph.
    pub system_graphs: Arc<dyn CacheStore<SystemGraph>>,
    pub meta_graph: Arc<dyn CacheStore<MetaGraph>>,
    /// Type id → system-graph template.
    pub templates: Arc<dyn CacheStore<TypeTemplate>>,
    pub ontology: Arc<dyn CacheStore<OntologyGraph>>,
    /// Raised while a refresh is writing the mirror.
    pub refresh: RefreshGate,
}

impl CacheSet {
    /// All caches backed by [`MemoryCache`].
    pub fn in_memory() -> Self {
        Self {
            entities: Arc::new(MemoryCache::new("entities")),
            relationships: Arc::new(MemoryCache::new("relationships")),
            forward: Arc::new(MemoryCache::new("forward")),
            backward: Arc::new(MemoryCache::new("backward")),
            types: Arc::new(MemoryCache::new("types")),
            system_graphs: Arc::new(MemoryCache::new("system_graphs")),
            meta_graph: Arc::new(MemoryCache::new("meta_graph")),
            templates: Arc::new(MemoryCache::new("templates")),
            ontology: Arc::new(MemoryCache::new("ontology")),
            refresh: RefreshGate::default(),
        }
    }
}

/// Tracks refreshes in flight over a [`CacheSet`].
///
/// Derived graphs computed while the gate is raised read a half-written
/// mirror, and their cache entries would be stamped after the refresh's
/// epoch and outlive its eviction. Readers consult [`RefreshGate::is_active`]
/// and skip their cache writes while it is raised.
#[derive(Debug, Clone, Default)]
pub struct RefreshGate {
    active: Arc<AtomicUsize>,
}

impl RefreshGate {
    /// Raises the gate until the returned guard is dropped.
    pub fn enter(&self) -> RefreshGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        RefreshGuard {
            active: Arc::clone(&self.active),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) > 0
    }
}

/// Lowers its [`RefreshGate`] on drop.
#[derive(Debug)]
pub struct RefreshGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_gate_follows_guards() {
        let caches = CacheSet::in_memory();
        let shared = caches.clone();
        assert!(!caches.refresh.is_active());

        let first = caches.refresh.enter();
        let second = shared.refresh.enter();
        assert!(caches.refresh.is_active());
        drop(first);
        assert!(shared.refresh.is_active());
        drop(second);
        assert!(!caches.refresh.is_active());
    }
}
