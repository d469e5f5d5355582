//! CLI module for twingraph.
//!
//! Subcommands:
//! - `refresh`: Refresh the caches from every configured source
//! - `system`: System graph around seed entities
//! - `locations`: Location path of one entity
//! - `meta-graph`: Type-level meta graph with counts
//! - `template`: System-graph template of one type
//! - `ontology`: Ontology with instance counts
//!
//! Caches live in process memory, so every query command refreshes first.
//! Results are printed to stdout as JSON; logs go to stderr.

mod query;
mod refresh;

use clap::{Parser, Subcommand};
use serde::Serialize;

use crate::config::Config;
use crate::context::Context;

/// Twingraph - cached digital-twin graph mirror
#[derive(Parser)]
#[command(name = "twingraph")]
#[command(about = "Cached digital-twin graph mirror with system-graph extraction")]
#[command(version)]
pub struct App {
    /// Run in verbose mode
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Refresh the caches and print the refresh summary
    Refresh {
        /// Skip the entity phase
        #[arg(long)]
        no_entities: bool,

        /// Skip the relationship and adjacency phases
        #[arg(long)]
        no_relationships: bool,
    },

    /// Extract the system graph around one or more entities (`all` for every
    /// top-level entity)
    System {
        #[arg(required = true)]
        seeds: Vec<String>,
    },

    /// Print the location path of an entity
    Locations { entity: String },

    /// Print the type-level meta graph
    MetaGraph,

    /// Print the system-graph template of a type
    Template { type_id: String },

    /// Print the ontology with instance counts
    Ontology {
        /// Restrict to this type, its ancestors and its descendants
        #[arg(long = "type")]
        type_id: Option<String>,
    },
}

impl App {
    /// Run the CLI application.
    pub async fn run(self) -> color_eyre::Result<()> {
        match self.command {
            Command::Refresh {
                no_entities,
                no_relationships,
            } => self.run_refresh(no_entities, no_relationships).await,
            Command::System { ref seeds } => self.run_system(seeds).await,
            Command::Locations { ref entity } => self.run_locations(entity).await,
            Command::MetaGraph => self.run_meta_graph().await,
            Command::Template { ref type_id } => self.run_template(type_id).await,
            Command::Ontology { ref type_id } => self.run_ontology(type_id.as_deref()).await,
        }
    }

    /// Loads the configuration and builds the context. Ctrl-C cancels the
    /// context's token.
    fn context(&self, config: Config) -> color_eyre::Result<Context> {
        tracing::info!(
            scope = %config.scope,
            sources = config.sources.len(),
            "configuration loaded"
        );
        let context = Context::new(config)?;

        let cancel = context.cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, cancelling");
                cancel.cancel();
            }
        });
        Ok(context)
    }
}

fn print_json<T: Serialize>(value: &T) -> color_eyre::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
