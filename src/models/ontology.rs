//! Type (model) definitions and the ontology-with-counts output.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A named edge of a type's relationship schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipSchema {
    pub name: String,
    /// Target type id; `None` means any type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// An entity type from the source ontology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeNode {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Direct parent type ids.
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub relationships: Vec<RelationshipSchema>,
}

impl TypeNode {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: local_name(&id).to_string(),
            id,
            parents: Vec::new(),
            relationships: Vec::new(),
        }
    }

    pub fn extends(mut self, parent: impl Into<String>) -> Self {
        self.parents.push(parent.into());
        self
    }

    pub fn relation(mut self, name: impl Into<String>, target: Option<&str>) -> Self {
        self.relationships.push(RelationshipSchema {
            name: name.into(),
            target: target.map(str::to_string),
        });
        self
    }
}

/// The local part of a DTMI: `dtmi:com:example:HVACZone;1` → `HVACZone`.
///
/// Plain ids are returned unchanged.
pub fn local_name(type_id: &str) -> &str {
    let without_version = type_id.split(';').next().unwrap_or(type_id);
    without_version
        .rsplit(':')
        .next()
        .unwrap_or(without_version)
}

/// One type in the ontology-with-counts graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OntologyNode {
    pub type_id: String,
    pub name: String,
    pub parents: Vec<String>,
    /// Entities of exactly this type.
    pub count: u64,
    /// Entities of proper descendant types.
    pub count_inherited: u64,
    /// Units observed on this type and its descendants.
    pub units: BTreeSet<String>,
    pub is_capability: bool,
}

/// Inheritance DAG annotated with instance counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OntologyGraph {
    pub nodes: Vec<OntologyNode>,
}

impl OntologyGraph {
    pub fn node(&self, type_id: &str) -> Option<&OntologyNode> {
        self.nodes.iter().find(|n| n.type_id == type_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_name() {
        assert_eq!(local_name("dtmi:com:example:HVACZone;1"), "HVACZone");
        assert_eq!(local_name("dtmi:com:example:HVACZone"), "HVACZone");
        assert_eq!(local_name("Room"), "Room");
    }
}
