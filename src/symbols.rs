//! Relation symbol table and type-set matching.
//!
//! The relation table is built once from the built-in relation kinds plus the
//! configured exclusions and is read-only afterwards.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;

use crate::config::TraversalConfig;
use crate::models::local_name;
use crate::services::ModelGraph;

pub const FEEDS: &str = "feeds";
pub const IS_FED_BY: &str = "isFedBy";
pub const IS_PART_OF: &str = "isPartOf";
pub const LOCATED_IN: &str = "locatedIn";
pub const HOSTED_BY: &str = "hostedBy";
pub const IS_CAPABILITY_OF: &str = "isCapabilityOf";
pub const IS_MEASURE_OF: &str = "isMeasureOf";
pub const HAS_DOCUMENT: &str = "hasDocument";

/// How the traversal treats a relation name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    /// `feeds*` and `isFedBy`: directed supply chains.
    Flow,
    /// Physical or organisational "is inside / belongs to" links.
    Containment,
    /// A point, sensor or setpoint attached to its owner.
    Capability,
    /// Never ingested and never traversed.
    Excluded,
    Other,
}

static BUILTIN: Lazy<HashMap<&'static str, RelationKind>> = Lazy::new(|| {
    use RelationKind::*;
    [
        (FEEDS, Flow),
        (IS_FED_BY, Flow),
        (LOCATED_IN, Containment),
        (IS_PART_OF, Containment),
        ("includedIn", Containment),
        ("isHeldBy", Containment),
        ("ownedBy", Containment),
        (HOSTED_BY, Containment),
        ("hasLocation", Containment),
        ("servedBy", Containment),
        (IS_CAPABILITY_OF, Capability),
        (HAS_DOCUMENT, Excluded),
    ]
    .into_iter()
    .collect()
});

/// Immutable relation name → kind lookup.
#[derive(Debug, Clone)]
pub struct RelationTable {
    kinds: HashMap<String, RelationKind>,
}

impl RelationTable {
    /// Built-in kinds with `excluded` relations overriding them.
    pub fn new<I, S>(excluded: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut kinds: HashMap<String, RelationKind> = BUILTIN
            .iter()
            .map(|(name, kind)| (name.to_string(), *kind))
            .collect();
        for name in excluded {
            kinds.insert(name.into(), RelationKind::Excluded);
        }
        Self { kinds }
    }

    pub fn from_config(config: &TraversalConfig) -> Self {
        Self::new(config.excluded_relations.iter().cloned())
    }

    pub fn kind(&self, relation: &str) -> RelationKind {
        match self.kinds.get(relation) {
            Some(kind) => *kind,
            None if relation.starts_with(FEEDS) || relation.starts_with(IS_FED_BY) => {
                RelationKind::Flow
            }
            None => RelationKind::Other,
        }
    }

    pub fn is_excluded(&self, relation: &str) -> bool {
        self.kind(relation) == RelationKind::Excluded
    }

    /// Flow relations stored downstream → upstream.
    pub fn is_reverse_flow(relation: &str) -> bool {
        relation.starts_with(IS_FED_BY)
    }
}

impl Default for RelationTable {
    fn default() -> Self {
        Self::from_config(&TraversalConfig::default())
    }
}

/// A set of type names matched exactly, by DTMI local name, or through
/// inheritance when an ontology is available.
#[derive(Debug, Clone, Default)]
pub struct TypeSet {
    names: HashSet<String>,
}

impl TypeSet {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = HashSet::new();
        for name in names {
            let name = name.as_ref();
            set.insert(name.to_string());
            set.insert(local_name(name).to_string());
        }
        Self { names: set }
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn matches_exact(&self, type_id: &str) -> bool {
        self.names.contains(type_id) || self.names.contains(local_name(type_id))
    }

    pub fn matches(&self, type_id: &str, model: Option<&ModelGraph>) -> bool {
        if self.matches_exact(type_id) {
            return true;
        }
        match model {
            Some(model) => model
                .ancestor_ids(type_id)
                .iter()
                .any(|ancestor| self.matches_exact(ancestor)),
            None => false,
        }
    }
}
