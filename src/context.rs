//! Application context: the composition root.

use std::sync::Arc;

use crate::cache::CacheSet;
use crate::config::Config;
use crate::error::AppError;
use crate::pipeline::CancellationToken;
use crate::progress::{LoggingProgress, ProgressSink};
use crate::services::{
    MetaGraphBuilder, OntologyService, SystemGraphExtractor, TraversalPolicy, TwinCacheIngestor,
};
use crate::source::{self, GraphSource, HealthRegistry};
use crate::symbols::TypeSet;

/// Shared dependencies of every service.
///
/// Cloning is cheap; clones share caches, health, ontology and the
/// cancellation signal.
#[derive(Clone)]
pub struct Context {
    pub config: Arc<Config>,
    pub caches: CacheSet,
    pub sources: Vec<Arc<dyn GraphSource>>,
    pub health: HealthRegistry,
    pub ontology: OntologyService,
    pub progress: Arc<dyn ProgressSink>,
    pub cancel: CancellationToken,
}

impl Context {
    /// Builds the context with in-memory caches and the configured sources.
    pub fn new(config: Config) -> Result<Self, AppError> {
        let health = HealthRegistry::new();
        let sources = source::from_config(&config, &health)?;
        Ok(Self::with_sources(config, CacheSet::in_memory(), sources, health))
    }

    /// Builds the context around already constructed caches and sources.
    pub fn with_sources(
        config: Config,
        caches: CacheSet,
        sources: Vec<Arc<dyn GraphSource>>,
        health: HealthRegistry,
    ) -> Self {
        let ontology = OntologyService::new(caches.types.clone(), config.scope.clone());
        Self {
            config: Arc::new(config),
            caches,
            sources,
            health,
            ontology,
            progress: Arc::new(LoggingProgress::default()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn ingestor(&self) -> TwinCacheIngestor {
        TwinCacheIngestor::new(
            &self.config,
            self.caches.clone(),
            self.sources.clone(),
            self.health.clone(),
            self.ontology.clone(),
            self.progress.clone(),
        )
    }

    pub fn extractor(&self) -> SystemGraphExtractor {
        SystemGraphExtractor::new(
            self.caches.clone(),
            self.config.scope.clone(),
            self.ontology.clone(),
            TraversalPolicy::from_config(&self.config.traversal),
        )
    }

    pub fn meta_graph(&self) -> MetaGraphBuilder {
        MetaGraphBuilder::new(
            self.caches.clone(),
            self.config.scope.clone(),
            self.ontology.clone(),
            TraversalPolicy::from_config(&self.config.traversal),
            TypeSet::new(&self.config.traversal.capability_types),
            &self.config.ingest,
            self.progress.clone(),
            self.cancel.clone(),
        )
    }
}
