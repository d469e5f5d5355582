//! Type ontology: the inheritance and relationship-schema DAG.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;
use futures::TryStreamExt;
use tokio::sync::RwLock;

use crate::cache::CacheStore;
use crate::error::AppError;
use crate::graph::Graph;
use crate::models::TypeNode;

/// Edge kinds of the ontology graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SchemaLink {
    /// Child type → parent type.
    Extends,
    /// Source type → target type, labeled by relation name.
    Relation(String),
}

/// In-memory ontology DAG with memoized closure queries.
///
/// Built once from the full list of type definitions. Parents or schema
/// targets that name unknown types are logged and dropped. Every walk keeps a
/// visited set, so a malformed cyclic ontology cannot loop forever.
#[derive(Debug, Default)]
pub struct ModelGraph {
    graph: Graph<TypeNode, SchemaLink>,
    ancestors: DashMap<String, Arc<Vec<String>>>,
    descendants: DashMap<String, Arc<Vec<String>>>,
}

impl ModelGraph {
    pub fn build(types: Vec<TypeNode>) -> Self {
        let mut graph: Graph<TypeNode, SchemaLink> = Graph::new();
        for node in types {
            let id = node.id.clone();
            if !graph.add_node(id.clone(), node) {
                tracing::debug!(type_id = %id, "duplicate type definition ignored");
            }
        }

        let links: Vec<(String, SchemaLink, String)> = graph
            .nodes()
            .flat_map(|(id, node)| {
                let parents = node
                    .parents
                    .iter()
                    .map(move |parent| (id.to_string(), SchemaLink::Extends, parent.clone()));
                let relations = node.relationships.iter().filter_map(move |rel| {
                    rel.target.as_ref().map(|target| {
                        (
                            id.to_string(),
                            SchemaLink::Relation(rel.name.clone()),
                            target.clone(),
                        )
                    })
                });
                parents.chain(relations)
            })
            .collect();

        let mut dropped = 0usize;
        for (start, link, end) in links {
            if graph.contains_node(&end) {
                graph.add_statement(&start, link, &end);
            } else {
                dropped += 1;
                tracing::warn!(type_id = %start, target = %end, ?link, "unknown target type, link dropped");
            }
        }

        tracing::info!(
            types = graph.node_count(),
            links = graph.statement_count(),
            dropped,
            "ontology loaded"
        );

        Self {
            graph,
            ancestors: DashMap::new(),
            descendants: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.is_empty()
    }

    pub fn get(&self, type_id: &str) -> Option<&TypeNode> {
        self.graph.node(type_id)
    }

    pub fn contains(&self, type_id: &str) -> bool {
        self.graph.contains_node(type_id)
    }

    pub fn types(&self) -> impl Iterator<Item = &TypeNode> {
        self.graph.nodes().map(|(_, node)| node)
    }

    /// True when `type_id` is `ancestor` or inherits from it.
    pub fn inherits_from_or_equal(&self, type_id: &str, ancestor: &str) -> bool {
        type_id == ancestor || self.ancestor_ids(type_id).iter().any(|a| a == ancestor)
    }

    /// Proper ancestors, nearest first.
    pub fn ancestor_ids(&self, type_id: &str) -> Arc<Vec<String>> {
        if let Some(found) = self.ancestors.get(type_id) {
            return found.clone();
        }
        let computed = Arc::new(self.closure(type_id, |id| self.graph.follow(id)));
        self.ancestors
            .insert(type_id.to_string(), computed.clone());
        computed
    }

    /// Proper descendants, nearest first.
    pub fn descendant_ids(&self, type_id: &str) -> Arc<Vec<String>> {
        if let Some(found) = self.descendants.get(type_id) {
            return found.clone();
        }
        let computed = Arc::new(self.closure(type_id, |id| self.graph.back(id)));
        self.descendants
            .insert(type_id.to_string(), computed.clone());
        computed
    }

    pub fn ancestors(&self, type_id: &str) -> Vec<&TypeNode> {
        self.resolve(&self.ancestor_ids(type_id))
    }

    pub fn descendants(&self, type_id: &str) -> Vec<&TypeNode> {
        self.resolve(&self.descendant_ids(type_id))
    }

    /// Whether `relation` is declared on the type or any ancestor.
    pub fn declares_relationship(&self, type_id: &str, relation: &str) -> bool {
        let declares = |id: &str| {
            self.get(id)
                .map(|node| node.relationships.iter().any(|r| r.name == relation))
                .unwrap_or(false)
        };
        declares(type_id) || self.ancestor_ids(type_id).iter().any(|id| declares(id.as_str()))
    }

    /// Schema edges leaving a type: `(relation, target type)`.
    pub fn schema_targets(&self, type_id: &str) -> Vec<(&str, &str)> {
        self.graph
            .follow(type_id)
            .iter()
            .filter_map(|(link, target)| match link {
                SchemaLink::Relation(name) => Some((name.as_str(), target.as_str())),
                SchemaLink::Extends => None,
            })
            .collect()
    }

    fn closure<'a, F>(&'a self, start: &str, next: F) -> Vec<String>
    where
        F: Fn(&str) -> &'a [(SchemaLink, String)],
    {
        let mut seen: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        let mut result = Vec::new();
        seen.insert(start.to_string());
        queue.push_back(start.to_string());

        while let Some(current) = queue.pop_front() {
            for (link, neighbor) in next(&current) {
                if *link != SchemaLink::Extends || !seen.insert(neighbor.clone()) {
                    continue;
                }
                result.push(neighbor.clone());
                queue.push_back(neighbor.clone());
            }
        }
        result
    }

    fn resolve(&self, ids: &[String]) -> Vec<&TypeNode> {
        ids.iter().filter_map(|id| self.get(id)).collect()
    }
}

/// Lazily loaded, process-wide ontology.
///
/// The first caller builds the [`ModelGraph`] from the types cache; later
/// callers share it. A refresh swaps in a freshly built graph.
#[derive(Clone)]
pub struct OntologyService {
    types: Arc<dyn CacheStore<TypeNode>>,
    scope: String,
    current: Arc<RwLock<Option<Arc<ModelGraph>>>>,
}

impl OntologyService {
    pub fn new(types: Arc<dyn CacheStore<TypeNode>>, scope: impl Into<String>) -> Self {
        Self {
            types,
            scope: scope.into(),
            current: Arc::new(RwLock::new(None)),
        }
    }

    /// The loaded ontology, building it from the types cache on first use.
    pub async fn model_graph(&self) -> Result<Arc<ModelGraph>, AppError> {
        if let Some(graph) = self.current.read().await.as_ref() {
            return Ok(graph.clone());
        }

        let mut slot = self.current.write().await;
        if let Some(graph) = slot.as_ref() {
            return Ok(graph.clone());
        }

        let types: Vec<TypeNode> = self
            .types
            .get_all(&self.scope)
            .await?
            .try_collect()
            .await?;
        let graph = Arc::new(ModelGraph::build(types));
        *slot = Some(graph.clone());
        Ok(graph)
    }

    /// The ontology if it has been loaded, without triggering a load.
    pub async fn loaded(&self) -> Option<Arc<ModelGraph>> {
        self.current.read().await.clone()
    }

    /// Replaces the ontology with one built from `types`.
    pub async fn replace(&self, types: Vec<TypeNode>) -> Arc<ModelGraph> {
        let graph = Arc::new(ModelGraph::build(types));
        *self.current.write().await = Some(graph.clone());
        graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backends::memory::MemoryCache;

    fn sample() -> ModelGraph {
        ModelGraph::build(vec![
            TypeNode::new("Asset").relation("isPartOf", Some("Space")),
            TypeNode::new("Space"),
            TypeNode::new("Room").extends("Space"),
            TypeNode::new("Equipment")
                .extends("Asset")
                .relation("feeds", Some("Equipment")),
            TypeNode::new("AirHandlingUnit").extends("Equipment"),
            TypeNode::new("VAV").extends("Equipment"),
            TypeNode::new("Broken")
                .extends("Missing")
                .relation("feeds", Some("Nowhere")),
        ])
    }

    #[test]
    fn test_inherits_from_or_equal() {
        let model = sample();
        assert!(model.inherits_from_or_equal("VAV", "VAV"));
        assert!(model.inherits_from_or_equal("VAV", "Equipment"));
        assert!(model.inherits_from_or_equal("VAV", "Asset"));
        assert!(!model.inherits_from_or_equal("VAV", "Space"));
        assert!(!model.inherits_from_or_equal("Asset", "VAV"));
    }

    #[test]
    fn test_ancestors_and_descendants() {
        let model = sample();
        let ancestors: Vec<&str> = model
            .ancestors("AirHandlingUnit")
            .iter()
            .map(|t| t.id.as_str())
            .collect();
        assert_eq!(ancestors, vec!["Equipment", "Asset"]);

        let mut descendants: Vec<String> = model.descendant_ids("Asset").to_vec();
        descendants.sort();
        assert_eq!(descendants, vec!["AirHandlingUnit", "Equipment", "VAV"]);

        // memoized value is shared
        assert!(Arc::ptr_eq(
            &model.descendant_ids("Asset"),
            &model.descendant_ids("Asset")
        ));
    }

    #[test]
    fn test_unknown_targets_dropped() {
        let model = sample();
        assert!(model.contains("Broken"));
        assert!(model.ancestor_ids("Broken").is_empty());
        assert!(model.schema_targets("Broken").is_empty());
        assert_eq!(model.schema_targets("Equipment"), vec![("feeds", "Equipment")]);
    }

    #[test]
    fn test_declares_relationship_through_inheritance() {
        let model = sample();
        assert!(model.declares_relationship("VAV", "feeds"));
        assert!(model.declares_relationship("VAV", "isPartOf"));
        assert!(!model.declares_relationship("Room", "feeds"));
    }

    #[test]
    fn test_cycle_safe() {
        let model = ModelGraph::build(vec![
            TypeNode::new("A").extends("B"),
            TypeNode::new("B").extends("A"),
        ]);
        assert_eq!(model.ancestor_ids("A").as_slice(), &["B".to_string()]);
        assert_eq!(model.descendant_ids("A").as_slice(), &["B".to_string()]);
    }

    #[tokio::test]
    async fn test_service_loads_lazily_and_replaces() {
        let cache: Arc<MemoryCache<TypeNode>> = Arc::new(MemoryCache::new("types"));
        cache
            .add_or_update("s", "Room", TypeNode::new("Room"))
            .await
            .unwrap();
        let service = OntologyService::new(cache.clone(), "s");
        assert!(service.loaded().await.is_none());

        let graph = service.model_graph().await.unwrap();
        assert_eq!(graph.len(), 1);
        assert!(Arc::ptr_eq(&graph, &service.model_graph().await.unwrap()));

        let replaced = service
            .replace(vec![TypeNode::new("Room"), TypeNode::new("Floor")])
            .await;
        assert_eq!(replaced.len(), 2);
        assert_eq!(service.model_graph().await.unwrap().len(), 2);
    }
}
