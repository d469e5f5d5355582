//! Cache refresh from the configured graph sources.
//!
//! A refresh runs in phases; every phase reads all available sources
//! concurrently and a source that fails is dropped from the later phases.
//!
//! | Phase | Writes | Notes |
//! |-------|--------|-------|
//! | Types | `types`, ontology | merged by type id, first source wins |
//! | Entities | `entities` | validated, bad rows skipped |
//! | Relationships | `relationships`, in-memory adjacency | bounded queue, K lanes |
//! | Adjacency | `forward`, `backward` | one write per node list, empty lists for edgeless entities |
//! | Eviction | - | entries written before the refresh epoch |
//!
//! A source that fails after the types phase contributes nothing: the
//! entities only it wrote, and every edge touching them, are withdrawn
//! before the adjacency lists are written.
//!
//! Every source call races the cancellation token. Cancellation stops
//! streaming and persistence between items. Nothing already written is
//! rolled back, and no adjacency list is written partially.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::Instrument;
use ulid::Ulid;

use crate::cache::{Adjacency, CacheSet, CacheStore};
use crate::config::{Config, IngestConfig};
use crate::error::{AppError, SourceFault};
use crate::models::{AdjacencyEntry, Entity, Relationship, TypeNode};
use crate::pipeline::{fan_out, CancellationToken};
use crate::progress::{notify, Phase, ProgressEvent, ProgressSink, Throttle};
use crate::services::ontology::{ModelGraph, OntologyService};
use crate::source::{GraphSource, HealthRegistry};
use crate::symbols::{RelationTable, TypeSet, HOSTED_BY};

/// Rows between two progress reports.
const REPORT_EVERY: u64 = 1_000;

// ============================================================================
// Summary
// ============================================================================

/// Per-source outcome of one refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceSummary {
    pub name: String,
    pub available: bool,
    pub entities: u64,
    pub skipped_entities: u64,
    pub relationships: u64,
    /// Malformed, excluded or dangling relationships.
    pub skipped_relationships: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of [`TwinCacheIngestor::refresh_all`].
#[derive(Debug, Clone, Serialize)]
pub struct RefreshSummary {
    pub run_id: String,
    pub scope: String,
    /// Refresh start; entries written before it were evicted.
    pub epoch: DateTime<Utc>,
    pub types: usize,
    pub sources: Vec<SourceSummary>,
    /// Relationships whose name is not declared on the source type.
    pub undeclared: u64,
    pub adjacency_written: u64,
    /// Evicted entries per cache name.
    pub evicted: BTreeMap<String, usize>,
    pub cancelled: bool,
    pub elapsed_ms: u64,
}

impl RefreshSummary {
    pub fn entities(&self) -> u64 {
        self.sources.iter().map(|s| s.entities).sum()
    }

    pub fn relationships(&self) -> u64 {
        self.sources.iter().map(|s| s.relationships).sum()
    }

    pub fn skipped(&self) -> u64 {
        self.sources
            .iter()
            .map(|s| s.skipped_entities + s.skipped_relationships)
            .sum()
    }

    pub fn evicted_total(&self) -> usize {
        self.evicted.values().sum()
    }
}

// ============================================================================
// Ingestor
// ============================================================================

/// Refreshes the entity, relationship and adjacency caches.
pub struct TwinCacheIngestor {
    caches: CacheSet,
    scope: String,
    sources: Vec<Arc<dyn GraphSource>>,
    health: HealthRegistry,
    ontology: OntologyService,
    relations: RelationTable,
    hosted_by_targets: TypeSet,
    ingest: IngestConfig,
    progress: Arc<dyn ProgressSink>,
}

impl TwinCacheIngestor {
    pub fn new(
        config: &Config,
        caches: CacheSet,
        sources: Vec<Arc<dyn GraphSource>>,
        health: HealthRegistry,
        ontology: OntologyService,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            caches,
            scope: config.scope.clone(),
            sources,
            health,
            ontology,
            relations: RelationTable::from_config(&config.traversal),
            hosted_by_targets: TypeSet::new(&config.ingest.hosted_by_targets),
            ingest: config.ingest.clone(),
            progress,
        }
    }

    /// Refreshes every cache from all sources, then evicts stale entries.
    ///
    /// Fails only when no source is configured or none is reachable.
    /// Cancellation is reported through [`RefreshSummary::cancelled`].
    pub async fn refresh_all(&self, cancel: &CancellationToken) -> Result<RefreshSummary, AppError> {
        if self.sources.is_empty() {
            return Err(AppError::Validation("no graph sources configured".to_string()));
        }

        let run_id = Ulid::new().to_string();
        let span = tracing::info_span!("refresh", run_id = %run_id, scope = %self.scope);
        self.run(run_id, cancel).instrument(span).await
    }

    async fn run(&self, run_id: String, cancel: &CancellationToken) -> Result<RefreshSummary, AppError> {
        let _refreshing = self.caches.refresh.enter();
        let started = Instant::now();
        let epoch = Utc::now();
        tracing::info!(sources = self.sources.len(), %epoch, "refresh started");

        let mut summary = RefreshSummary {
            run_id,
            scope: self.scope.clone(),
            epoch,
            types: 0,
            sources: self
                .sources
                .iter()
                .map(|source| SourceSummary {
                    name: source.name().to_string(),
                    available: true,
                    ..SourceSummary::default()
                })
                .collect(),
            undeclared: 0,
            adjacency_written: 0,
            evicted: BTreeMap::new(),
            cancelled: false,
            elapsed_ms: 0,
        };
        for source in &self.sources {
            self.health.begin(source.name());
        }

        if let Some(model) = self.refresh_types(&mut summary, cancel).await? {
            self.refresh_data(&model, &mut summary, cancel).await;
        }

        if cancel.is_cancelled() {
            summary.cancelled = true;
            tracing::warn!("refresh cancelled, eviction skipped");
        } else {
            summary.evicted = self.evict(epoch).await;
        }

        for source in summary.sources.iter().filter(|s| s.available) {
            self.health
                .finish(&source.name, source.entities, source.relationships);
        }

        summary.elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            entities = summary.entities(),
            relationships = summary.relationships(),
            skipped = summary.skipped(),
            undeclared = summary.undeclared,
            adjacency = summary.adjacency_written,
            evicted = summary.evicted_total(),
            cancelled = summary.cancelled,
            elapsed_ms = summary.elapsed_ms,
            "refresh finished"
        );
        Ok(summary)
    }

    /// Entity, relationship and adjacency phases, with failed sources
    /// withdrawn after each of them.
    async fn refresh_data(
        &self,
        model: &Arc<ModelGraph>,
        summary: &mut RefreshSummary,
        cancel: &CancellationToken,
    ) {
        let mut owned = Ownership::new(self.sources.len());

        if self.ingest.refresh_entities && !cancel.is_cancelled() {
            self.refresh_entities(model, summary, &mut owned, cancel).await;
            self.withdraw_entities(summary, &mut owned).await;
        }

        if !self.ingest.refresh_relationships || cancel.is_cancelled() {
            return;
        }
        let batches = self.refresh_relationships(model, summary, cancel).await;
        let withdrawn = self.withdraw_entities(summary, &mut owned).await;
        let merged = self.withdraw_edges(summary, batches, &withdrawn).await;

        if cancel.is_cancelled() {
            return;
        }
        let known = if self.ingest.refresh_entities {
            owned.all()
        } else {
            self.cached_entity_ids().await
        };
        summary.adjacency_written = self.flush_adjacency(&merged, &known, cancel).await;
    }

    fn available(&self, summary: &RefreshSummary) -> Vec<(usize, Arc<dyn GraphSource>)> {
        self.sources
            .iter()
            .cloned()
            .enumerate()
            .filter(|(index, _)| summary.sources[*index].available)
            .collect()
    }

    /// Drops the source from later phases and zeroes what it contributed.
    fn mark_failed(&self, summary: &mut RefreshSummary, index: usize, err: &AppError) {
        let source = &mut summary.sources[index];
        source.available = false;
        source.entities = 0;
        source.skipped_entities = 0;
        source.relationships = 0;
        source.skipped_relationships = 0;
        source.error = Some(err.to_string());
        self.health.mark_unavailable(&source.name, err);
    }

    // ========================================================================
    // Types
    // ========================================================================

    /// Loads and merges the type definitions. `None` when cancelled.
    async fn refresh_types(
        &self,
        summary: &mut RefreshSummary,
        cancel: &CancellationToken,
    ) -> Result<Option<Arc<ModelGraph>>, AppError> {
        let phase = PhaseTimer::start(self.progress.as_ref(), Phase::Types);
        let scope = self.scope.as_str();
        let results = join_all(
            self.sources
                .iter()
                .map(|source| cancel.guard(source.list_types(scope))),
        )
        .await;
        if cancel.is_cancelled() {
            tracing::warn!("type loading cancelled");
            phase.finish(self.progress.as_ref());
            return Ok(None);
        }

        let mut merged: BTreeMap<String, TypeNode> = BTreeMap::new();
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(types) => {
                    for node in types {
                        merged.entry(node.id.clone()).or_insert(node);
                    }
                }
                Err(err) => self.mark_failed(summary, index, &err),
            }
        }

        if summary.sources.iter().all(|s| !s.available) {
            return Err(AppError::source_failure(
                "*",
                SourceFault::Unavailable,
                "every configured graph source is unavailable",
            ));
        }

        let mut written = 0;
        for (id, node) in &merged {
            match self.caches.types.add_or_update(&self.scope, id, node.clone()).await {
                Ok(()) => written += 1,
                Err(err) => tracing::error!(type_id = %id, error = %err, "type write failed, skipped"),
            }
        }
        summary.types = written;
        let model = self.ontology.replace(merged.into_values().collect()).await;
        phase.finish(self.progress.as_ref());
        Ok(Some(model))
    }

    // ========================================================================
    // Entities
    // ========================================================================

    async fn refresh_entities(
        &self,
        model: &ModelGraph,
        summary: &mut RefreshSummary,
        owned: &mut Ownership,
        cancel: &CancellationToken,
    ) {
        let phase = PhaseTimer::start(self.progress.as_ref(), Phase::Entities);
        if model.is_empty() {
            tracing::warn!("no type definitions loaded, entity types are not checked");
        }

        let available = self.available(summary);
        let mut stats: Vec<EntityStats> = available.iter().map(|_| EntityStats::default()).collect();
        let results = join_all(
            available
                .iter()
                .zip(stats.iter_mut())
                .map(|((_, source), stats)| self.ingest_entities(source.as_ref(), model, stats, cancel)),
        )
        .await;

        for (((index, _), result), stats) in available.into_iter().zip(results).zip(stats) {
            summary.sources[index].entities = stats.written;
            summary.sources[index].skipped_entities = stats.skipped;
            owned.record(index, stats.ids);
            match result {
                Ok(()) => {}
                Err(err) if err.is_cancelled() => {}
                Err(err) => self.mark_failed(summary, index, &err),
            }
        }
        phase.finish(self.progress.as_ref());
    }

    /// Streams one source's entities into the cache. `stats` holds what was
    /// written even when an error is returned.
    async fn ingest_entities(
        &self,
        source: &dyn GraphSource,
        model: &ModelGraph,
        stats: &mut EntityStats,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        let name = source.name();
        let total = cancel.guard(source.entity_count(&self.scope)).await.ok();
        let mut stream = cancel.guard(source.list_entities(&self.scope)).await?;
        let throttle = Throttle::default();

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = stream.next() => next,
            };
            let entity = match next {
                Some(Ok(entity)) => entity,
                Some(Err(err @ (AppError::Validation(_) | AppError::Serialization(_)))) => {
                    stats.skipped += 1;
                    if throttle.ready() {
                        tracing::warn!(source = %name, error = %err, skipped = stats.skipped, "malformed entity skipped");
                    }
                    continue;
                }
                Some(Err(err)) => return Err(err),
                None => break,
            };

            if let Err(err) = check_entity(&entity, model) {
                stats.skipped += 1;
                if throttle.ready() {
                    tracing::warn!(source = %name, error = %err, skipped = stats.skipped, "invalid entity skipped");
                }
                continue;
            }

            let id = entity.id.clone();
            if let Err(err) = self.caches.entities.add_or_update(&self.scope, &id, entity).await {
                stats.skipped += 1;
                tracing::error!(source = %name, entity = %id, error = %err, "entity write failed, skipped");
                continue;
            }
            stats.ids.insert(id);
            stats.written += 1;

            if stats.written % REPORT_EVERY == 0 {
                notify(
                    self.progress.as_ref(),
                    ProgressEvent::Entities {
                        source: name.to_string(),
                        processed: stats.written,
                        total,
                    },
                );
            }
        }

        notify(
            self.progress.as_ref(),
            ProgressEvent::Entities {
                source: name.to_string(),
                processed: stats.written,
                total,
            },
        );
        tracing::info!(source = %name, written = stats.written, skipped = stats.skipped, "entities ingested");
        Ok(())
    }

    /// Removes the entities written this pass by failed sources and not by
    /// any available one. Returns the removed ids.
    async fn withdraw_entities(&self, summary: &RefreshSummary, owned: &mut Ownership) -> HashSet<String> {
        let failed: Vec<usize> = (0..summary.sources.len())
            .filter(|index| !summary.sources[*index].available)
            .collect();
        let withdrawn = owned.release(&failed);

        for id in &withdrawn {
            if let Err(err) = self.caches.entities.remove(&self.scope, id).await {
                tracing::error!(entity = %id, error = %err, "entity withdrawal failed");
            }
        }
        if !withdrawn.is_empty() {
            tracing::warn!(withdrawn = withdrawn.len(), "entities of failed sources withdrawn");
        }
        withdrawn
    }

    async fn cached_entity_ids(&self) -> HashSet<String> {
        let mut ids = HashSet::new();
        let mut entities = match self.caches.entities.get_all(&self.scope).await {
            Ok(entities) => entities,
            Err(err) => {
                tracing::error!(error = %err, "cached entities unreadable, no empty adjacency lists written");
                return ids;
            }
        };
        while let Some(entity) = entities.next().await {
            match entity {
                Ok(entity) => {
                    ids.insert(entity.id);
                }
                Err(err) => tracing::debug!(error = %err, "unreadable cached entity skipped"),
            }
        }
        ids
    }

    // ========================================================================
    // Relationships
    // ========================================================================

    /// Streams every available source's relationships. Returns one adjacency
    /// batch per source that entered the phase.
    async fn refresh_relationships(
        &self,
        model: &Arc<ModelGraph>,
        summary: &mut RefreshSummary,
        cancel: &CancellationToken,
    ) -> Vec<(usize, AdjacencyAccumulator)> {
        let phase = PhaseTimer::start(self.progress.as_ref(), Phase::Relationships);
        let available = self.available(summary);
        let batches: Vec<(usize, AdjacencyAccumulator)> = available
            .iter()
            .map(|(index, _)| (*index, AdjacencyAccumulator::default()))
            .collect();
        let results = join_all(available.iter().zip(&batches).map(|((_, source), (_, batch))| {
            self.ingest_relationships(source.clone(), model.clone(), batch.clone(), cancel)
        }))
        .await;

        for ((index, _), result) in available.into_iter().zip(results) {
            match result {
                Ok(stats) => {
                    summary.sources[index].relationships = stats.admitted;
                    summary.sources[index].skipped_relationships = stats.skipped + stats.dropped;
                    summary.undeclared += stats.undeclared;
                }
                Err(err) => self.mark_failed(summary, index, &err),
            }
        }
        phase.finish(self.progress.as_ref());
        batches
    }

    async fn ingest_relationships(
        &self,
        source: Arc<dyn GraphSource>,
        model: Arc<ModelGraph>,
        adjacency: AdjacencyAccumulator,
        cancel: &CancellationToken,
    ) -> Result<RelationshipStats, AppError> {
        let name = source.name().to_string();
        let total = cancel.guard(source.relationship_count(&self.scope)).await.ok();
        let (sender, receiver) = mpsc::channel::<Relationship>(self.ingest.queue_capacity.max(1));

        let producer = {
            let source = source.clone();
            let scope = self.scope.clone();
            let cancel = cancel.clone();
            let label = format!("{name} relationships");
            tokio::spawn(async move {
                let stream = cancel.guard(source.list_relationships(&scope)).await?;
                crate::pipeline::produce(&label, stream, sender, &cancel).await
            })
        };

        let lane = Arc::new(LaneContext {
            scope: self.scope.clone(),
            entities: self.caches.entities.clone(),
            relationships: self.caches.relationships.clone(),
            adjacency,
            relations: self.relations.clone(),
            hosted_by_targets: self.hosted_by_targets.clone(),
            model,
        });
        let mut outcomes = fan_out(
            receiver,
            self.ingest.lanes,
            self.ingest.queue_capacity,
            Relationship::key,
            move |rel: Relationship| {
                let lane = lane.clone();
                async move { Some(lane.admit(rel).await) }
            },
            cancel.clone(),
        );

        let mut stats = RelationshipStats::default();
        while let Some(outcome) = outcomes.recv().await {
            match outcome {
                Admission::Admitted { undeclared } => {
                    stats.admitted += 1;
                    stats.undeclared += u64::from(undeclared);
                }
                Admission::Dropped(reason) => {
                    stats.dropped += 1;
                    tracing::trace!(source = %name, ?reason, "relationship dropped");
                }
            }
            let processed = stats.admitted + stats.dropped;
            if processed % REPORT_EVERY == 0 {
                notify(
                    self.progress.as_ref(),
                    ProgressEvent::Relationships {
                        source: name.clone(),
                        processed,
                        total,
                    },
                );
            }
        }

        match tokio::time::timeout(self.ingest.producer_grace(), producer).await {
            Ok(Ok(Ok(produced))) => stats.skipped = produced.skipped,
            Ok(Ok(Err(err))) if err.is_cancelled() => {}
            Ok(Ok(Err(err))) => return Err(err),
            Ok(Err(join)) => return Err(AppError::Internal(format!("relationship producer failed: {join}"))),
            Err(_) => {
                tracing::warn!(
                    source = %name,
                    grace_secs = self.ingest.producer_grace_secs,
                    "relationship producer still not complete"
                );
            }
        }

        notify(
            self.progress.as_ref(),
            ProgressEvent::Relationships {
                source: name.clone(),
                processed: stats.admitted + stats.dropped,
                total,
            },
        );
        tracing::info!(
            source = %name,
            admitted = stats.admitted,
            dropped = stats.dropped,
            skipped = stats.skipped,
            undeclared = stats.undeclared,
            "relationships ingested"
        );
        Ok(stats)
    }

    /// Merges the per-source batches of available sources, minus every edge
    /// touching a withdrawn entity, and removes the cached relationships no
    /// surviving batch holds.
    async fn withdraw_edges(
        &self,
        summary: &mut RefreshSummary,
        batches: Vec<(usize, AdjacencyAccumulator)>,
        withdrawn: &HashSet<String>,
    ) -> AdjacencyAccumulator {
        let merged = AdjacencyAccumulator::default();
        let mut orphaned: HashSet<String> = HashSet::new();

        for (index, batch) in batches {
            if !summary.sources[index].available {
                orphaned.extend(batch.edge_keys());
                continue;
            }
            let dropped = batch.drop_nodes(withdrawn);
            if !dropped.is_empty() {
                let source = &mut summary.sources[index];
                let count = dropped.len() as u64;
                source.relationships = source.relationships.saturating_sub(count);
                source.skipped_relationships += count;
                orphaned.extend(dropped);
            }
            merged.absorb(&batch);
        }

        orphaned.retain(|key| !merged.has_edge(key));
        for key in &orphaned {
            if let Err(err) = self.caches.relationships.remove(&self.scope, key).await {
                tracing::error!(relationship = %key, error = %err, "relationship withdrawal failed");
            }
        }
        if !orphaned.is_empty() {
            tracing::warn!(withdrawn = orphaned.len(), "relationships of failed sources withdrawn");
        }
        merged
    }

    // ========================================================================
    // Adjacency and eviction
    // ========================================================================

    /// Writes every accumulated node list as one cache value, and an empty
    /// list for each entity in `known` without edges in that direction.
    /// Stops between nodes when cancelled.
    async fn flush_adjacency(
        &self,
        adjacency: &AdjacencyAccumulator,
        known: &HashSet<String>,
        cancel: &CancellationToken,
    ) -> u64 {
        let phase = PhaseTimer::start(self.progress.as_ref(), Phase::Adjacency);
        let mut written = [0u64; 2];

        let lists = [
            (&self.caches.forward, adjacency.forward.as_ref()),
            (&self.caches.backward, adjacency.backward.as_ref()),
        ];
        for (slot, (cache, accumulated)) in lists.into_iter().enumerate() {
            let mut snapshot: Vec<(String, Adjacency)> = accumulated
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect();
            snapshot.extend(
                known
                    .iter()
                    .filter(|id| !accumulated.contains_key(id.as_str()))
                    .map(|id| (id.clone(), Adjacency::new())),
            );
            for (node, list) in snapshot {
                if cancel.is_cancelled() {
                    tracing::warn!(cache = cache.name(), written = written[slot], "adjacency flush cancelled");
                    return written.iter().sum();
                }
                match cache.add_or_update(&self.scope, &node, list).await {
                    Ok(()) => written[slot] += 1,
                    Err(err) => tracing::error!(cache = cache.name(), node = %node, error = %err, "adjacency write failed"),
                }
            }
        }

        notify(
            self.progress.as_ref(),
            ProgressEvent::Adjacency {
                forward: written[0],
                backward: written[1],
            },
        );
        phase.finish(self.progress.as_ref());
        written.iter().sum()
    }

    /// Evicts entries written before `epoch` from the caches whose phase ran,
    /// and from every derived cache.
    async fn evict(&self, epoch: DateTime<Utc>) -> BTreeMap<String, usize> {
        let phase = PhaseTimer::start(self.progress.as_ref(), Phase::Eviction);
        let mut evicted = BTreeMap::new();
        let scope = self.scope.as_str();

        let mut run = |name: &str, result: Result<usize, AppError>| match result {
            Ok(count) => {
                evicted.insert(name.to_string(), count);
            }
            Err(err) => tracing::error!(cache = name, error = %err, "eviction failed"),
        };

        let caches = &self.caches;
        run(caches.types.name(), caches.types.remove_older_than(scope, epoch).await);
        if self.ingest.refresh_entities {
            run(caches.entities.name(), caches.entities.remove_older_than(scope, epoch).await);
        }
        if self.ingest.refresh_relationships {
            run(
                caches.relationships.name(),
                caches.relationships.remove_older_than(scope, epoch).await,
            );
            run(caches.forward.name(), caches.forward.remove_older_than(scope, epoch).await);
            run(caches.backward.name(), caches.backward.remove_older_than(scope, epoch).await);
        }
        run(
            caches.system_graphs.name(),
            caches.system_graphs.remove_older_than(scope, epoch).await,
        );
        run(caches.meta_graph.name(), caches.meta_graph.remove_older_than(scope, epoch).await);
        run(caches.templates.name(), caches.templates.remove_older_than(scope, epoch).await);
        run(caches.ontology.name(), caches.ontology.remove_older_than(scope, epoch).await);

        tracing::info!(evicted = evicted.values().sum::<usize>(), "stale entries evicted");
        phase.finish(self.progress.as_ref());
        evicted
    }
}

fn check_entity(entity: &Entity, model: &ModelGraph) -> Result<(), AppError> {
    entity.validate()?;
    if !model.is_empty() && !model.contains(&entity.type_id) {
        return Err(AppError::TypeNotFound(format!(
            "{} (entity {})",
            entity.type_id, entity.id
        )));
    }
    Ok(())
}

// ============================================================================
// Per-source bookkeeping
// ============================================================================

#[derive(Debug, Default)]
struct EntityStats {
    written: u64,
    skipped: u64,
    ids: HashSet<String>,
}

#[derive(Debug, Default)]
struct RelationshipStats {
    admitted: u64,
    dropped: u64,
    /// Malformed rows reported by the source stream.
    skipped: u64,
    undeclared: u64,
}

/// Entity ids written this pass, per source index.
#[derive(Debug)]
struct Ownership {
    by_source: Vec<HashSet<String>>,
}

impl Ownership {
    fn new(sources: usize) -> Self {
        Self {
            by_source: vec![HashSet::new(); sources],
        }
    }

    fn record(&mut self, index: usize, ids: HashSet<String>) {
        self.by_source[index] = ids;
    }

    /// Forgets the ids of `failed` sources. Returns those no other source
    /// wrote.
    fn release(&mut self, failed: &[usize]) -> HashSet<String> {
        let mut released = HashSet::new();
        for index in failed {
            released.extend(std::mem::take(&mut self.by_source[*index]));
        }
        released.retain(|id| !self.by_source.iter().any(|ids| ids.contains(id)));
        released
    }

    fn all(&self) -> HashSet<String> {
        self.by_source.iter().flatten().cloned().collect()
    }
}

/// Per-node forward and backward lists built while relationships stream in.
#[derive(Clone, Default)]
struct AdjacencyAccumulator {
    forward: Arc<DashMap<String, Adjacency>>,
    backward: Arc<DashMap<String, Adjacency>>,
    /// Relationship key → (source id, target id).
    edges: Arc<DashMap<String, (String, String)>>,
}

impl AdjacencyAccumulator {
    fn append(&self, rel: &Relationship) {
        push_unique(
            &self.forward,
            &rel.source_id,
            AdjacencyEntry {
                relation: rel.relation.clone(),
                substance: rel.substance.clone(),
                neighbor: rel.target_id.clone(),
            },
        );
        push_unique(
            &self.backward,
            &rel.target_id,
            AdjacencyEntry {
                relation: rel.relation.clone(),
                substance: rel.substance.clone(),
                neighbor: rel.source_id.clone(),
            },
        );
        self.edges
            .insert(rel.key(), (rel.source_id.clone(), rel.target_id.clone()));
    }

    fn absorb(&self, other: &AdjacencyAccumulator) {
        for (into, from) in [(&self.forward, &other.forward), (&self.backward, &other.backward)] {
            for list in from.iter() {
                for entry in list.value() {
                    push_unique(into, list.key(), entry.clone());
                }
            }
        }
        for edge in other.edges.iter() {
            self.edges.insert(edge.key().clone(), edge.value().clone());
        }
    }

    /// Removes every list and edge touching `ids`. Returns the keys of the
    /// removed edges.
    fn drop_nodes(&self, ids: &HashSet<String>) -> Vec<String> {
        if ids.is_empty() {
            return Vec::new();
        }
        for map in [&self.forward, &self.backward] {
            map.retain(|node, list| {
                list.retain(|entry| !ids.contains(&entry.neighbor));
                !ids.contains(node)
            });
        }
        let mut dropped = Vec::new();
        self.edges.retain(|key, (source, target)| {
            let keep = !ids.contains(source.as_str()) && !ids.contains(target.as_str());
            if !keep {
                dropped.push(key.clone());
            }
            keep
        });
        dropped
    }

    fn has_edge(&self, key: &str) -> bool {
        self.edges.contains_key(key)
    }

    fn edge_keys(&self) -> Vec<String> {
        self.edges.iter().map(|edge| edge.key().clone()).collect()
    }
}

fn push_unique(map: &DashMap<String, Adjacency>, node: &str, entry: AdjacencyEntry) {
    let mut list = map.entry(node.to_string()).or_default();
    if !list.contains(&entry) {
        list.push(entry);
    }
}

// ============================================================================
// Relationship lanes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DropReason {
    Malformed,
    Excluded,
    MissingEndpoint,
    HostedByFiltered,
    CacheFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Admitted { undeclared: bool },
    Dropped(DropReason),
}

/// Everything a lane worker needs, shared by all lanes.
struct LaneContext {
    scope: String,
    entities: Arc<dyn CacheStore<Entity>>,
    relationships: Arc<dyn CacheStore<Relationship>>,
    adjacency: AdjacencyAccumulator,
    relations: RelationTable,
    hosted_by_targets: TypeSet,
    model: Arc<ModelGraph>,
}

impl LaneContext {
    async fn admit(&self, rel: Relationship) -> Admission {
        if rel.validate().is_err() {
            return Admission::Dropped(DropReason::Malformed);
        }
        if self.relations.is_excluded(&rel.relation) {
            return Admission::Dropped(DropReason::Excluded);
        }

        let (source, target) = match (
            self.entities.try_get(&self.scope, &rel.source_id).await,
            self.entities.try_get(&self.scope, &rel.target_id).await,
        ) {
            (Ok(Some(source)), Ok(Some(target))) => (source, target),
            (Err(err), _) | (_, Err(err)) => {
                tracing::debug!(relationship = %rel.key(), error = %err, "endpoint lookup failed");
                return Admission::Dropped(DropReason::CacheFailure);
            }
            _ => return Admission::Dropped(DropReason::MissingEndpoint),
        };

        if rel.relation == HOSTED_BY
            && !self
                .hosted_by_targets
                .matches(&target.type_id, Some(self.model.as_ref()))
        {
            return Admission::Dropped(DropReason::HostedByFiltered);
        }

        if let Err(err) = self
            .relationships
            .add_or_update(&self.scope, &rel.key(), rel.clone())
            .await
        {
            tracing::debug!(relationship = %rel.key(), error = %err, "relationship write failed");
            return Admission::Dropped(DropReason::CacheFailure);
        }
        self.adjacency.append(&rel);

        let undeclared =
            !self.model.is_empty() && !self.model.declares_relationship(&source.type_id, &rel.relation);
        Admission::Admitted { undeclared }
    }
}

/// Logs and reports the start and completion of a phase.
struct PhaseTimer {
    phase: Phase,
    started: Instant,
}

impl PhaseTimer {
    fn start(progress: &dyn ProgressSink, phase: Phase) -> Self {
        tracing::debug!(?phase, "phase started");
        notify(progress, ProgressEvent::PhaseStarted(phase));
        Self {
            phase,
            started: Instant::now(),
        }
    }

    fn finish(self, progress: &dyn ProgressSink) {
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        tracing::info!(phase = ?self.phase, elapsed_ms, "phase completed");
        notify(
            progress,
            ProgressEvent::PhaseCompleted {
                phase: self.phase,
                elapsed_ms,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backends::memory::MemoryCache;

    fn lane(model: ModelGraph) -> LaneContext {
        LaneContext {
            scope: "s".to_string(),
            entities: Arc::new(MemoryCache::new("entities")),
            relationships: Arc::new(MemoryCache::new("relationships")),
            adjacency: AdjacencyAccumulator::default(),
            relations: RelationTable::default(),
            hosted_by_targets: TypeSet::new(["ElectricalMeter"]),
            model: Arc::new(model),
        }
    }

    async fn seed(lane: &LaneContext, id: &str, type_id: &str) {
        lane.entities
            .add_or_update("s", id, Entity::new(id, type_id))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_admission_filter() {
        let lane = lane(ModelGraph::build(vec![
            TypeNode::new("Meter"),
            TypeNode::new("ElectricalMeter").extends("Meter"),
            TypeNode::new("Switchboard").relation("hostedBy", None),
            TypeNode::new("Room"),
        ]));
        seed(&lane, "SB1", "Switchboard").await;
        seed(&lane, "EM1", "ElectricalMeter").await;
        seed(&lane, "R1", "Room").await;

        assert_eq!(
            lane.admit(Relationship::new("SB1", "hostedBy", "EM1")).await,
            Admission::Admitted { undeclared: false }
        );
        assert_eq!(
            lane.admit(Relationship::new("SB1", "hostedBy", "R1")).await,
            Admission::Dropped(DropReason::HostedByFiltered)
        );
        assert_eq!(
            lane.admit(Relationship::new("SB1", "hasDocument", "R1")).await,
            Admission::Dropped(DropReason::Excluded)
        );
        assert_eq!(
            lane.admit(Relationship::new("SB1", "feeds", "Ghost")).await,
            Admission::Dropped(DropReason::MissingEndpoint)
        );
        assert_eq!(
            lane.admit(Relationship::new("R1", "feeds", "SB1")).await,
            Admission::Admitted { undeclared: true }
        );

        assert_eq!(lane.relationships.count("s").await.unwrap(), 2);
        assert_eq!(lane.adjacency.forward.get("SB1").unwrap().len(), 1);
        assert_eq!(lane.adjacency.backward.get("SB1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_relationships_accumulate_once() {
        let lane = lane(ModelGraph::default());
        seed(&lane, "A", "X").await;
        seed(&lane, "B", "X").await;
        let rel = Relationship::new("A", "feeds", "B").with_substance("air");
        lane.admit(rel.clone()).await;
        lane.admit(rel).await;
        assert_eq!(lane.adjacency.forward.get("A").unwrap().len(), 1);
    }

    #[test]
    fn test_drop_nodes_removes_touching_edges() {
        let batch = AdjacencyAccumulator::default();
        batch.append(&Relationship::new("AHU1", "feeds", "VAV1"));
        batch.append(&Relationship::new("VAV1", "feeds", "Room1"));
        batch.append(&Relationship::new("Room1", "isPartOf", "Floor1"));

        let dropped = batch.drop_nodes(&HashSet::from(["Room1".to_string()]));
        assert_eq!(dropped.len(), 2);
        assert!(batch.has_edge(&Relationship::new("AHU1", "feeds", "VAV1").key()));
        assert!(batch.forward.get("Room1").is_none());
        assert!(batch.forward.get("VAV1").unwrap().is_empty());
        assert!(batch.backward.get("Floor1").unwrap().is_empty());
        assert_eq!(batch.backward.get("VAV1").unwrap().len(), 1);
    }

    #[test]
    fn test_absorb_merges_without_duplicates() {
        let merged = AdjacencyAccumulator::default();
        let first = AdjacencyAccumulator::default();
        let second = AdjacencyAccumulator::default();
        first.append(&Relationship::new("A", "feeds", "B"));
        second.append(&Relationship::new("A", "feeds", "B"));
        second.append(&Relationship::new("A", "feeds", "C"));

        merged.absorb(&first);
        merged.absorb(&second);
        assert_eq!(merged.forward.get("A").unwrap().len(), 2);
        assert_eq!(merged.edge_keys().len(), 2);
    }

    #[test]
    fn test_release_keeps_ids_other_sources_wrote() {
        let mut owned = Ownership::new(3);
        owned.record(0, HashSet::from(["A".to_string(), "B".to_string()]));
        owned.record(1, HashSet::from(["B".to_string(), "C".to_string()]));
        owned.record(2, HashSet::from(["D".to_string()]));

        let released = owned.release(&[1, 2]);
        assert_eq!(released, HashSet::from(["C".to_string(), "D".to_string()]));
        assert_eq!(owned.all(), HashSet::from(["A".to_string(), "B".to_string()]));
        assert!(owned.release(&[1, 2]).is_empty());
    }

    #[test]
    fn test_check_entity() {
        let model = ModelGraph::build(vec![TypeNode::new("Room")]);
        assert!(check_entity(&Entity::new("R1", "Room"), &model).is_ok());
        assert!(matches!(
            check_entity(&Entity::new("R1", "Nope"), &model),
            Err(AppError::TypeNotFound(_))
        ));
        assert!(check_entity(&Entity::new("R1", "Nope"), &ModelGraph::default()).is_ok());
        assert!(check_entity(&Entity::new("", "Room"), &model).is_err());
    }
}
