//! Adjacency records and derived graph outputs.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// One entry of a node's forward or backward adjacency list.
///
/// In a forward list `neighbor` is the relationship target, in a backward
/// list it is the relationship source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjacencyEntry {
    pub relation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub substance: Option<String>,
    pub neighbor: String,
}

/// Predicate carried by derived graph edges.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeLabel {
    pub relation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub substance: Option<String>,
}

impl EdgeLabel {
    pub fn new(relation: impl Into<String>, substance: Option<String>) -> Self {
        Self {
            relation: relation.into(),
            substance,
        }
    }
}

// ============================================================================
// System graph (instance level)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemNode {
    pub id: String,
    pub name: String,
    pub type_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemEdge {
    pub source: String,
    pub target: String,
    pub relation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub substance: Option<String>,
}

/// Bounded subgraph surrounding one or more seed entities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemGraph {
    pub seeds: Vec<String>,
    pub nodes: Vec<SystemNode>,
    pub edges: Vec<SystemEdge>,
    /// Set when the step budget cut the traversal short.
    pub truncated: bool,
}

impl SystemGraph {
    pub fn node_ids(&self) -> BTreeSet<&str> {
        self.nodes.iter().map(|n| n.id.as_str()).collect()
    }

    pub fn has_edge(&self, source: &str, relation: &str, target: &str) -> bool {
        self.edges
            .iter()
            .any(|e| e.source == source && e.relation == relation && e.target == target)
    }
}

// ============================================================================
// Meta graph (type level)
// ============================================================================

/// Aggregate of all entities of one type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaNode {
    pub type_id: String,
    pub name: String,
    pub count: u64,
    pub units: BTreeSet<String>,
}

impl MetaNode {
    pub fn new(type_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            type_id: type_id.into(),
            name: name.into(),
            count: 0,
            units: BTreeSet::new(),
        }
    }
}

/// All instance edges sharing `(start type, end type, relation, substance)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaEdge {
    pub start: String,
    pub end: String,
    pub relation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub substance: Option<String>,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaGraph {
    pub nodes: Vec<MetaNode>,
    pub edges: Vec<MetaEdge>,
}

impl MetaGraph {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, type_id: &str) -> Option<&MetaNode> {
        self.nodes.iter().find(|n| n.type_id == type_id)
    }

    pub fn edge(&self, start: &str, relation: &str, end: &str) -> Option<&MetaEdge> {
        self.edges
            .iter()
            .find(|e| e.start == start && e.relation == relation && e.end == end)
    }
}

/// System-graph template for one type, extracted from the meta graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeTemplate {
    pub type_id: String,
    pub nodes: Vec<MetaNode>,
    pub edges: Vec<MetaEdge>,
    pub truncated: bool,
}

impl TypeTemplate {
    pub fn has_edge(&self, start: &str, relation: &str, end: &str) -> bool {
        self.edges
            .iter()
            .any(|e| e.start == start && e.relation == relation && e.end == end)
    }
}
