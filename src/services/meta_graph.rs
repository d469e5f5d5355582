//! Type-level aggregation of the cached graph.
//!
//! | Operation | Cache | Key |
//! |-----------|-------|-----|
//! | [`MetaGraphBuilder::build_meta_graph`] | `meta_graph` | `meta` (never stored empty) |
//! | [`MetaGraphBuilder::template`] | `templates` | type id |
//! | [`MetaGraphBuilder::ontology_with_counts`] | `ontology` | filter type id or `*` |
//!
//! The meta graph is built in two streaming passes over the caches: entities
//! are counted per type, then every relationship is resolved to its endpoint
//! types on the worker lanes and counted per
//! `(start type, relation, substance, end type)`.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::cache::{CacheExt, CacheSet};
use crate::config::IngestConfig;
use crate::error::AppError;
use crate::graph::Graph;
use crate::models::{
    local_name, AdjacencyEntry, EdgeLabel, Entity, MetaEdge, MetaGraph, MetaNode, OntologyGraph,
    OntologyNode, Relationship, TypeTemplate,
};
use crate::pipeline::{fan_out, produce, CancellationToken};
use crate::progress::{notify, Phase, ProgressEvent, ProgressSink, Throttle};
use crate::services::ontology::{ModelGraph, OntologyService};
use crate::services::traversal::{normalize, traverse, TraversalPolicy, TraversalSource};
use crate::symbols::{TypeSet, IS_CAPABILITY_OF, IS_MEASURE_OF};

const META_KEY: &str = "meta";
const ALL_TYPES_KEY: &str = "*";

type EdgeKey = (String, EdgeLabel, String);

/// Builds and caches the meta graph, per-type templates and the ontology
/// with instance counts.
#[derive(Clone)]
pub struct MetaGraphBuilder {
    caches: CacheSet,
    scope: String,
    ontology: OntologyService,
    policy: TraversalPolicy,
    capability_types: TypeSet,
    lanes: usize,
    queue_capacity: usize,
    progress: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
}

impl MetaGraphBuilder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        caches: CacheSet,
        scope: impl Into<String>,
        ontology: OntologyService,
        policy: TraversalPolicy,
        capability_types: TypeSet,
        ingest: &IngestConfig,
        progress: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            caches,
            scope: scope.into(),
            ontology,
            policy,
            capability_types,
            lanes: ingest.lanes,
            queue_capacity: ingest.queue_capacity,
            progress,
            cancel,
        }
    }

    // ========================================================================
    // Meta graph
    // ========================================================================

    /// The cached meta graph, building it on a miss.
    ///
    /// Empty graphs, and graphs built while a refresh runs, are not cached.
    pub async fn build_meta_graph(&self) -> Result<MetaGraph, AppError> {
        if let Some(graph) = self.caches.meta_graph.try_get(&self.scope, META_KEY).await? {
            return Ok(graph);
        }
        let graph = self.aggregate().await?;
        if graph.is_empty() {
            tracing::info!(scope = %self.scope, "meta graph is empty, not cached");
        } else if self.caches.refresh.is_active() {
            tracing::debug!(scope = %self.scope, "refresh in progress, meta graph not cached");
        } else {
            self.caches
                .meta_graph
                .add_or_update(&self.scope, META_KEY, graph.clone())
                .await?;
        }
        Ok(graph)
    }

    /// Aggregates the entity and relationship caches, bypassing the meta
    /// graph cache.
    pub async fn aggregate(&self) -> Result<MetaGraph, AppError> {
        let started = Instant::now();
        notify(self.progress.as_ref(), ProgressEvent::PhaseStarted(Phase::MetaGraph));
        let model = self.ontology.model_graph().await?;

        let nodes = self.count_entities(&model).await?;
        self.cancel.check()?;
        let counts = self.count_relationships(&model).await?;
        self.cancel.check()?;

        let mut edges: Vec<MetaEdge> = counts
            .into_iter()
            .map(|((start, label, end), count)| MetaEdge {
                start,
                end,
                relation: label.relation,
                substance: label.substance,
                count,
            })
            .collect();
        edges.sort_by(|a, b| {
            (&a.start, &a.relation, &a.end, &a.substance).cmp(&(
                &b.start,
                &b.relation,
                &b.end,
                &b.substance,
            ))
        });

        let nodes: Vec<MetaNode> = nodes.nodes().map(|(_, node)| node.clone()).collect();
        let elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            scope = %self.scope,
            types = nodes.len(),
            edges = edges.len(),
            elapsed_ms,
            "meta graph built"
        );
        notify(
            self.progress.as_ref(),
            ProgressEvent::PhaseCompleted {
                phase: Phase::MetaGraph,
                elapsed_ms,
            },
        );
        Ok(MetaGraph { nodes, edges })
    }

    async fn count_entities(&self, model: &ModelGraph) -> Result<Graph<MetaNode, EdgeLabel>, AppError> {
        let mut nodes: Graph<MetaNode, EdgeLabel> = Graph::new();
        let mut unknown = 0u64;
        let throttle = Throttle::default();
        let mut entities = self.caches.entities.get_all(&self.scope).await?;

        while let Some(entity) = entities.next().await {
            let entity: Entity = match entity {
                Ok(entity) => entity,
                Err(err) => {
                    tracing::debug!(error = %err, "unreadable cached entity skipped");
                    continue;
                }
            };
            if !model.is_empty() && !model.contains(&entity.type_id) {
                unknown += 1;
                if throttle.ready() {
                    tracing::warn!(
                        entity = %entity.id,
                        type_id = %entity.type_id,
                        unknown,
                        "entity of unknown type skipped"
                    );
                }
                continue;
            }
            let node = nodes.get_or_add_node(&entity.type_id, || {
                let name = model
                    .get(&entity.type_id)
                    .map(|t| t.name.clone())
                    .unwrap_or_else(|| local_name(&entity.type_id).to_string());
                MetaNode::new(entity.type_id.clone(), name)
            });
            node.count += 1;
            if let Some(unit) = entity.unit {
                node.units.insert(unit);
            }
        }

        if unknown > 0 {
            tracing::warn!(unknown, "entities of unknown type left out of the meta graph");
        }
        Ok(nodes)
    }

    async fn count_relationships(&self, model: &ModelGraph) -> Result<HashMap<EdgeKey, u64>, AppError> {
        let (sender, receiver) = mpsc::channel::<Relationship>(self.queue_capacity.max(1));
        let entities = self.caches.entities.clone();
        let scope = self.scope.clone();
        let relations = self.policy.relations.clone();

        let mut resolved = fan_out(
            receiver,
            self.lanes,
            self.queue_capacity,
            |rel: &Relationship| format!("{}|{}", rel.source_id, rel.target_id),
            move |rel: Relationship| {
                let entities = entities.clone();
                let scope = scope.clone();
                let excluded = relations.is_excluded(&rel.relation);
                async move {
                    if excluded {
                        return None;
                    }
                    let Ok(Some(start)) = entities.try_get(&scope, &rel.source_id).await else {
                        return None;
                    };
                    let Ok(Some(end)) = entities.try_get(&scope, &rel.target_id).await else {
                        return None;
                    };
                    Some((
                        start.type_id,
                        EdgeLabel::new(rel.relation, rel.substance),
                        end.type_id,
                    ))
                }
            },
            self.cancel.clone(),
        );

        let stream = self.caches.relationships.get_all(&self.scope).await?;
        let producer = produce("meta relationships", stream, sender, &self.cancel);
        let consumer = async {
            let mut counts: HashMap<EdgeKey, u64> = HashMap::new();
            let mut schema_faults = 0u64;
            while let Some((start, label, end)) = resolved.recv().await {
                if !model.is_empty() && !(model.contains(&start) && model.contains(&end)) {
                    schema_faults += 1;
                    continue;
                }
                *counts.entry((start, label, end)).or_insert(0) += 1;
            }
            if schema_faults > 0 {
                tracing::warn!(schema_faults, "edges between unknown types dropped");
            }
            counts
        };

        let (stats, counts) = tokio::join!(producer, consumer);
        let stats = stats?;
        tracing::debug!(
            sent = stats.sent,
            skipped = stats.skipped,
            distinct = counts.len(),
            "relationships aggregated"
        );
        Ok(counts)
    }

    // ========================================================================
    // Per-type template
    // ========================================================================

    /// System-graph template of one type, cached per type id.
    pub async fn template(&self, type_id: &str) -> Result<TypeTemplate, AppError> {
        if self.caches.refresh.is_active() {
            return self.compute_template(type_id).await;
        }
        self.caches
            .templates
            .get_or_create(&self.scope, type_id, || self.compute_template(type_id))
            .await
    }

    async fn compute_template(&self, type_id: &str) -> Result<TypeTemplate, AppError> {
        let model = self.ontology.model_graph().await?;
        let meta = self.build_meta_graph().await?;
        if meta.node(type_id).is_none() && !model.contains(type_id) {
            return Err(AppError::TypeNotFound(type_id.to_string()));
        }

        let topology = MetaTopology::new(&meta);
        let traversal = traverse(
            &topology,
            &self.policy,
            Some(model),
            &[type_id.to_string()],
            true,
        )
        .await?;

        let nodes = traversal
            .graph
            .nodes()
            .map(|(_, node)| node.clone())
            .collect();
        let edges = traversal
            .graph
            .statements()
            .iter()
            .map(|statement| MetaEdge {
                start: statement.start.clone(),
                end: statement.end.clone(),
                relation: statement.predicate.relation.clone(),
                substance: statement.predicate.substance.clone(),
                count: topology.count(&statement.start, &statement.predicate, &statement.end),
            })
            .collect();

        Ok(TypeTemplate {
            type_id: type_id.to_string(),
            nodes,
            edges,
            truncated: traversal.truncated,
        })
    }

    // ========================================================================
    // Ontology with counts
    // ========================================================================

    /// Every ontology type with its instance count, the count rolled up from
    /// its descendants and the union of observed units.
    ///
    /// With `filter`, only the type, its ancestors and its descendants are
    /// returned.
    pub async fn ontology_with_counts(&self, filter: Option<&str>) -> Result<OntologyGraph, AppError> {
        if self.caches.refresh.is_active() {
            return self.compute_ontology(filter).await;
        }
        let key = filter.unwrap_or(ALL_TYPES_KEY);
        self.caches
            .ontology
            .get_or_create(&self.scope, key, || self.compute_ontology(filter))
            .await
    }

    async fn compute_ontology(&self, filter: Option<&str>) -> Result<OntologyGraph, AppError> {
        let model = self.ontology.model_graph().await?;
        let keep: Option<HashSet<String>> = match filter {
            Some(type_id) => {
                if !model.contains(type_id) {
                    return Err(AppError::TypeNotFound(type_id.to_string()));
                }
                let mut keep: HashSet<String> = HashSet::from([type_id.to_string()]);
                keep.extend(model.ancestor_ids(type_id).iter().cloned());
                keep.extend(model.descendant_ids(type_id).iter().cloned());
                Some(keep)
            }
            None => None,
        };

        let meta = self.build_meta_graph().await?;
        let own: HashMap<&str, &MetaNode> = meta
            .nodes
            .iter()
            .map(|node| (node.type_id.as_str(), node))
            .collect();

        let nodes = model
            .types()
            .filter(|t| keep.as_ref().map_or(true, |keep| keep.contains(&t.id)))
            .map(|t| {
                let count = own.get(t.id.as_str()).map_or(0, |n| n.count);
                let mut units: BTreeSet<String> = own
                    .get(t.id.as_str())
                    .map(|n| n.units.clone())
                    .unwrap_or_default();
                let mut count_inherited = 0;
                for descendant in model.descendant_ids(&t.id).iter() {
                    if let Some(node) = own.get(descendant.as_str()) {
                        count_inherited += node.count;
                        units.extend(node.units.iter().cloned());
                    }
                }
                OntologyNode {
                    type_id: t.id.clone(),
                    name: t.name.clone(),
                    parents: t.parents.clone(),
                    count,
                    count_inherited,
                    units,
                    is_capability: self.capability_types.matches(&t.id, Some(model.as_ref())),
                }
            })
            .collect();

        Ok(OntologyGraph { nodes })
    }
}

/// The meta graph seen as a traversal source.
struct MetaTopology<'a> {
    nodes: HashMap<&'a str, &'a MetaNode>,
    forward: HashMap<&'a str, Vec<AdjacencyEntry>>,
    backward: HashMap<&'a str, Vec<AdjacencyEntry>>,
    /// Edge counts keyed the way traversal results are written.
    counts: HashMap<EdgeKey, u64>,
}

impl<'a> MetaTopology<'a> {
    fn new(meta: &'a MetaGraph) -> Self {
        let mut topology = Self {
            nodes: meta.nodes.iter().map(|n| (n.type_id.as_str(), n)).collect(),
            forward: HashMap::new(),
            backward: HashMap::new(),
            counts: HashMap::new(),
        };
        for edge in &meta.edges {
            topology
                .forward
                .entry(edge.start.as_str())
                .or_default()
                .push(AdjacencyEntry {
                    relation: edge.relation.clone(),
                    substance: edge.substance.clone(),
                    neighbor: edge.end.clone(),
                });
            topology
                .backward
                .entry(edge.end.as_str())
                .or_default()
                .push(AdjacencyEntry {
                    relation: edge.relation.clone(),
                    substance: edge.substance.clone(),
                    neighbor: edge.start.clone(),
                });
            let (start, relation, end) = normalize(&edge.start, &edge.relation, &edge.end);
            *topology
                .counts
                .entry((start, EdgeLabel::new(relation, edge.substance.clone()), end))
                .or_insert(0) += edge.count;
        }
        topology
    }

    fn count(&self, start: &str, label: &EdgeLabel, end: &str) -> u64 {
        let lookup = |label: EdgeLabel| {
            self.counts
                .get(&(start.to_string(), label, end.to_string()))
                .copied()
        };
        lookup(label.clone())
            .or_else(|| {
                (label.relation == IS_MEASURE_OF)
                    .then(|| lookup(EdgeLabel::new(IS_CAPABILITY_OF, label.substance.clone())))
                    .flatten()
            })
            .unwrap_or(0)
    }
}

#[async_trait]
impl TraversalSource for MetaTopology<'_> {
    type Node = MetaNode;

    async fn node(&self, id: &str) -> Result<Option<MetaNode>, AppError> {
        Ok(self.nodes.get(id).map(|node| (*node).clone()))
    }

    fn type_of(node: &MetaNode) -> &str {
        &node.type_id
    }

    async fn forward(&self, id: &str) -> Result<Vec<AdjacencyEntry>, AppError> {
        Ok(self.forward.get(id).cloned().unwrap_or_default())
    }

    async fn backward(&self, id: &str) -> Result<Vec<AdjacencyEntry>, AppError> {
        Ok(self.backward.get(id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TraversalConfig;
    use crate::progress::NoopProgress;

    const SCOPE: &str = "test";

    async fn builder(types: Vec<crate::models::TypeNode>) -> (CacheSet, MetaGraphBuilder) {
        let caches = CacheSet::in_memory();
        let ontology = OntologyService::new(caches.types.clone(), SCOPE);
        ontology.replace(types).await;
        let traversal = TraversalConfig::default();
        let builder = MetaGraphBuilder::new(
            caches.clone(),
            SCOPE,
            ontology,
            TraversalPolicy::from_config(&traversal),
            TypeSet::new(&traversal.capability_types),
            &IngestConfig::default(),
            Arc::new(NoopProgress),
            CancellationToken::new(),
        );
        (caches, builder)
    }

    async fn put_entity(caches: &CacheSet, entity: Entity) {
        caches
            .entities
            .add_or_update(SCOPE, &entity.id.clone(), entity)
            .await
            .unwrap();
    }

    async fn put_rel(caches: &CacheSet, rel: Relationship) {
        caches
            .relationships
            .add_or_update(SCOPE, &rel.key(), rel)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_empty_meta_graph_not_cached() {
        let (caches, builder) = builder(vec![]).await;
        let graph = builder.build_meta_graph().await.unwrap();
        assert!(graph.is_empty());
        assert!(caches.meta_graph.try_get(SCOPE, META_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_derived_graphs_not_cached_while_refresh_active() {
        use crate::models::TypeNode;
        let (caches, builder) = builder(vec![TypeNode::new("VAV"), TypeNode::new("Room")]).await;
        put_entity(&caches, Entity::new("VAV1", "VAV")).await;
        put_entity(&caches, Entity::new("Room1", "Room")).await;
        put_rel(&caches, Relationship::new("VAV1", "feeds", "Room1")).await;

        let refreshing = caches.refresh.enter();
        assert!(!builder.build_meta_graph().await.unwrap().is_empty());
        builder.template("VAV").await.unwrap();
        builder.ontology_with_counts(None).await.unwrap();
        assert_eq!(caches.meta_graph.count(SCOPE).await.unwrap(), 0);
        assert_eq!(caches.templates.count(SCOPE).await.unwrap(), 0);
        assert_eq!(caches.ontology.count(SCOPE).await.unwrap(), 0);

        drop(refreshing);
        builder.build_meta_graph().await.unwrap();
        assert_eq!(caches.meta_graph.count(SCOPE).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_counts_and_edge_collapse() {
        use crate::models::TypeNode;
        let (caches, builder) = builder(vec![
            TypeNode::new("VAV"),
            TypeNode::new("Room"),
            TypeNode::new("Sensor"),
        ])
        .await;
        put_entity(&caches, Entity::new("VAV1", "VAV")).await;
        put_entity(&caches, Entity::new("VAV2", "VAV")).await;
        put_entity(&caches, Entity::new("Room1", "Room")).await;
        put_entity(&caches, Entity::new("T1", "Sensor").with_unit("degC")).await;
        put_entity(&caches, Entity::new("T2", "Sensor").with_unit("degF")).await;
        put_entity(&caches, Entity::new("X1", "Unknown")).await;
        put_rel(&caches, Relationship::new("VAV1", "feeds", "Room1")).await;
        put_rel(&caches, Relationship::new("VAV2", "feeds", "Room1")).await;
        put_rel(&caches, Relationship::new("T1", "hasDocument", "Room1")).await;
        put_rel(&caches, Relationship::new("X1", "feeds", "Room1")).await;

        let graph = builder.build_meta_graph().await.unwrap();
        assert_eq!(graph.node("VAV").unwrap().count, 2);
        assert_eq!(graph.node("Sensor").unwrap().units.len(), 2);
        assert!(graph.node("Unknown").is_none());
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.edge("VAV", "feeds", "Room").unwrap().count, 2);
        assert!(caches.meta_graph.try_get(SCOPE, META_KEY).await.unwrap().is_some());
    }

    #[test]
    fn test_topology_counts_follow_result_form() {
        let meta = MetaGraph {
            nodes: vec![
                MetaNode::new("AHU", "AHU"),
                MetaNode::new("VAV", "VAV"),
                MetaNode::new("Sensor", "Sensor"),
                MetaNode::new("Building", "Building"),
            ],
            edges: vec![
                MetaEdge {
                    start: "VAV".to_string(),
                    end: "AHU".to_string(),
                    relation: "isFedBy".to_string(),
                    substance: None,
                    count: 3,
                },
                MetaEdge {
                    start: "Sensor".to_string(),
                    end: "Building".to_string(),
                    relation: "isCapabilityOf".to_string(),
                    substance: None,
                    count: 4,
                },
            ],
        };
        let topology = MetaTopology::new(&meta);
        assert_eq!(topology.count("AHU", &EdgeLabel::new("feeds", None), "VAV"), 3);
        assert_eq!(
            topology.count("Sensor", &EdgeLabel::new("isMeasureOf", None), "Building"),
            4
        );
        assert_eq!(topology.count("VAV", &EdgeLabel::new("feeds", None), "AHU"), 0);
    }
}
