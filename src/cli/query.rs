//! Query command handlers.

use color_eyre::Result;

use super::{print_json, App};

impl App {
    pub async fn run_system(&self, seeds: &[String]) -> Result<()> {
        let context = self.refreshed_context().await?;
        let graph = context.extractor().extract_system_graph(seeds).await?;
        if graph.truncated {
            tracing::warn!("system graph truncated by the step budget");
        }
        print_json(&graph)
    }

    pub async fn run_locations(&self, entity: &str) -> Result<()> {
        let context = self.refreshed_context().await?;
        let path = context.extractor().locations(entity).await?;
        print_json(&path)
    }

    pub async fn run_meta_graph(&self) -> Result<()> {
        let context = self.refreshed_context().await?;
        let graph = context.meta_graph().build_meta_graph().await?;
        print_json(&graph)
    }

    pub async fn run_template(&self, type_id: &str) -> Result<()> {
        let context = self.refreshed_context().await?;
        let template = context.meta_graph().template(type_id).await?;
        print_json(&template)
    }

    pub async fn run_ontology(&self, type_id: Option<&str>) -> Result<()> {
        let context = self.refreshed_context().await?;
        let ontology = context.meta_graph().ontology_with_counts(type_id).await?;
        print_json(&ontology)
    }
}
