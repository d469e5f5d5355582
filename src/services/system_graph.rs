//! Instance-level system graphs over the cached adjacency index.

use std::collections::{BTreeSet, HashSet};

use async_trait::async_trait;
use futures::TryStreamExt;

use crate::cache::{CacheExt, CacheSet};
use crate::error::AppError;
use crate::models::{AdjacencyEntry, LocationSegment, SystemEdge, SystemGraph, SystemNode};
use crate::services::ontology::OntologyService;
use crate::services::traversal::{traverse, TraversalPolicy, TraversalSource};
use crate::symbols::{IS_CAPABILITY_OF, IS_PART_OF, LOCATED_IN};

/// Seed that expands to every top-level entity.
pub const ALL_SEEDS: &str = "all";

/// Relations followed by [`SystemGraphExtractor::locations`], in preference order.
const LOCATION_RELATIONS: [&str; 3] = [IS_CAPABILITY_OF, LOCATED_IN, IS_PART_OF];

/// Entity and adjacency caches seen as a traversal source. Never queries a
/// graph source.
pub struct CachedTopology<'a> {
    caches: &'a CacheSet,
    scope: &'a str,
}

impl<'a> CachedTopology<'a> {
    pub fn new(caches: &'a CacheSet, scope: &'a str) -> Self {
        Self { caches, scope }
    }
}

#[async_trait]
impl TraversalSource for CachedTopology<'_> {
    type Node = SystemNode;

    async fn node(&self, id: &str) -> Result<Option<SystemNode>, AppError> {
        Ok(self
            .caches
            .entities
            .try_get(self.scope, id)
            .await?
            .map(|entity| SystemNode {
                id: entity.id,
                name: entity.name,
                type_id: entity.type_id,
            }))
    }

    fn type_of(node: &SystemNode) -> &str {
        &node.type_id
    }

    async fn forward(&self, id: &str) -> Result<Vec<AdjacencyEntry>, AppError> {
        Ok(self
            .caches
            .forward
            .try_get(self.scope, id)
            .await?
            .unwrap_or_default())
    }

    async fn backward(&self, id: &str) -> Result<Vec<AdjacencyEntry>, AppError> {
        Ok(self
            .caches
            .backward
            .try_get(self.scope, id)
            .await?
            .unwrap_or_default())
    }
}

/// Extracts bounded subsystems around seed entities.
#[derive(Clone)]
pub struct SystemGraphExtractor {
    caches: CacheSet,
    scope: String,
    ontology: OntologyService,
    policy: TraversalPolicy,
}

impl SystemGraphExtractor {
    pub fn new(
        caches: CacheSet,
        scope: impl Into<String>,
        ontology: OntologyService,
        policy: TraversalPolicy,
    ) -> Self {
        Self {
            caches,
            scope: scope.into(),
            ontology,
            policy,
        }
    }

    /// System graph around `seeds`, cached per sorted seed set.
    ///
    /// The seed `all` expands to every top-level entity. While a refresh is
    /// writing the mirror the graph is computed but not cached.
    pub async fn extract_system_graph(&self, seeds: &[String]) -> Result<SystemGraph, AppError> {
        let seeds = self.expand_seeds(seeds).await?;
        if seeds.is_empty() {
            return Err(AppError::Validation("no seed entities given".to_string()));
        }
        if self.caches.refresh.is_active() {
            tracing::debug!(seeds = seeds.len(), "refresh in progress, system graph not cached");
            return self.compute(seeds).await;
        }
        // JSON array, so ids containing the separator cannot collide.
        let key = serde_json::to_string(&seeds)?;
        self.caches
            .system_graphs
            .get_or_create(&self.scope, &key, || self.compute(seeds))
            .await
    }

    /// Runs the traversal without consulting the system-graph cache.
    pub async fn compute(&self, seeds: Vec<String>) -> Result<SystemGraph, AppError> {
        let started = std::time::Instant::now();
        let model = self.ontology.model_graph().await?;
        let topology = CachedTopology::new(&self.caches, &self.scope);
        let traversal = traverse(
            &topology,
            &self.policy,
            Some(model),
            &seeds,
            self.policy.instance_second_chance,
        )
        .await?;

        let nodes: Vec<SystemNode> = traversal
            .graph
            .nodes()
            .map(|(_, node)| node.clone())
            .collect();
        let edges: Vec<SystemEdge> = traversal
            .graph
            .statements()
            .iter()
            .map(|statement| SystemEdge {
                source: statement.start.clone(),
                target: statement.end.clone(),
                relation: statement.predicate.relation.clone(),
                substance: statement.predicate.substance.clone(),
            })
            .collect();

        tracing::debug!(
            seeds = seeds.len(),
            nodes = nodes.len(),
            edges = edges.len(),
            steps = traversal.steps,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "system graph extracted"
        );

        Ok(SystemGraph {
            seeds,
            nodes,
            edges,
            truncated: traversal.truncated,
        })
    }

    /// Ids of every cached entity whose type is a top-level container type.
    pub async fn top_level_entities(&self) -> Result<Vec<String>, AppError> {
        let model = self.ontology.model_graph().await?;
        let top_level = &self.policy.top_level;
        let mut ids: Vec<String> = self
            .caches
            .entities
            .get_all(&self.scope)
            .await?
            .try_filter_map(|entity| {
                let keep = top_level.matches(&entity.type_id, Some(model.as_ref()));
                futures::future::ready(Ok(keep.then_some(entity.id)))
            })
            .try_collect()
            .await?;
        ids.sort();
        Ok(ids)
    }

    /// Ordered location path of an entity, nearest container first.
    ///
    /// Follows outgoing `isCapabilityOf`, `locatedIn` and `isPartOf` edges
    /// (first match in that order) until none is left or a cycle closes.
    pub async fn locations(&self, entity_id: &str) -> Result<Vec<LocationSegment>, AppError> {
        if self
            .caches
            .entities
            .try_get(&self.scope, entity_id)
            .await?
            .is_none()
        {
            return Err(AppError::EntityNotFound(entity_id.to_string()));
        }

        let mut path = Vec::new();
        let mut seen: HashSet<String> = HashSet::from([entity_id.to_string()]);
        let mut current = entity_id.to_string();

        loop {
            let forward = self
                .caches
                .forward
                .try_get(&self.scope, &current)
                .await?
                .unwrap_or_default();
            let next = LOCATION_RELATIONS.iter().find_map(|relation| {
                forward
                    .iter()
                    .find(|entry| entry.relation == *relation && !seen.contains(&entry.neighbor))
            });
            let Some(next) = next else { break };

            let Some(entity) = self.caches.entities.try_get(&self.scope, &next.neighbor).await?
            else {
                break;
            };
            seen.insert(entity.id.clone());
            current = entity.id.clone();
            path.push(LocationSegment {
                id: entity.id,
                name: entity.name,
                type_id: entity.type_id,
                via: next.relation.clone(),
            });
        }

        Ok(path)
    }

    async fn expand_seeds(&self, seeds: &[String]) -> Result<Vec<String>, AppError> {
        let mut expanded: BTreeSet<String> = BTreeSet::new();
        for seed in seeds {
            let seed = seed.trim();
            if seed.eq_ignore_ascii_case(ALL_SEEDS) {
                expanded.extend(self.top_level_entities().await?);
            } else if !seed.is_empty() {
                expanded.insert(seed.to_string());
            }
        }
        Ok(expanded.into_iter().collect())
    }
}
