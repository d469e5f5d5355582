//! Domain models for the mirrored twin graph and its derived graphs.

mod entity;
mod graph;
mod ontology;

pub use entity::{Entity, LocationSegment, Relationship};
pub use graph::{
    AdjacencyEntry, EdgeLabel, MetaEdge, MetaGraph, MetaNode, SystemEdge, SystemGraph,
    SystemNode, TypeTemplate,
};
pub use ontology::{local_name, OntologyGraph, OntologyNode, RelationshipSchema, TypeNode};
