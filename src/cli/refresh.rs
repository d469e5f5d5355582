//! Refresh command handler.

use color_eyre::Result;
use serde::Serialize;

use crate::config::Config;
use crate::context::Context;
use crate::services::RefreshSummary;
use crate::source::SourceHealth;

use super::{print_json, App};

#[derive(Serialize)]
struct RefreshReport<'a> {
    summary: &'a RefreshSummary,
    health: std::collections::BTreeMap<String, SourceHealth>,
}

impl App {
    /// Run the refresh command and print the summary with source health.
    pub async fn run_refresh(&self, no_entities: bool, no_relationships: bool) -> Result<()> {
        let mut config = Config::load()?;
        config.ingest.refresh_entities &= !no_entities;
        config.ingest.refresh_relationships &= !no_relationships;

        let context = self.context(config)?;
        let summary = context.ingestor().refresh_all(&context.cancel).await?;
        print_json(&RefreshReport {
            summary: &summary,
            health: context.health.snapshot(),
        })
    }

    /// Loads the configuration and runs a full refresh, for the query
    /// commands.
    pub(super) async fn refreshed_context(&self) -> Result<Context> {
        let context = self.context(Config::load()?)?;
        let summary = context.ingestor().refresh_all(&context.cancel).await?;
        if summary.cancelled {
            return Err(color_eyre::eyre::eyre!("refresh cancelled"));
        }
        Ok(context)
    }
}
