//! Services over the cache mirror.
//!
//! | Service | Role |
//! |---------|------|
//! | [`OntologyService`] / [`ModelGraph`] | Type inheritance and schema DAG |
//! | [`TwinCacheIngestor`] | Refreshes the caches from the graph sources |
//! | [`SystemGraphExtractor`] | Instance-level system graphs and location paths |
//! | [`MetaGraphBuilder`] | Type-level meta graph, templates, ontology counts |
//!
//! The extractor and the meta-graph templates share one traversal state
//! machine, see [`traversal`].

mod ingest;
mod meta_graph;
mod ontology;
mod system_graph;

pub mod traversal;

pub use ingest::{RefreshSummary, SourceSummary, TwinCacheIngestor};
pub use meta_graph::MetaGraphBuilder;
pub use ontology::{ModelGraph, OntologyService, SchemaLink};
pub use system_graph::{CachedTopology, SystemGraphExtractor, ALL_SEEDS};
pub use traversal::{TraversalPolicy, TraversalSource};
