//! Configuration with layered resolution using figment.
//!
//! Resolution order (highest priority last):
//! 1. User config: `~/.config/twingraph/config.toml` (XDG) or platform config dir
//! 2. Project config: `.twingraph.toml`
//! 3. Environment variables: `TWINGRAPH_*` (nested keys split on `__`)
//!
//! # Intended Usage
//!
//! **Global config** (`~/.config/twingraph/config.toml`):
//! ```toml
//! [retry]
//! max_attempts = 5
//! base_delay_ms = 200
//! ```
//!
//! **Project config** (`.twingraph.toml`):
//! ```toml
//! scope = "site-42"
//!
//! [[sources]]
//! name = "primary"
//! kind = "snapshot"
//! path = "./twins.json"
//!
//! [traversal]
//! step_budget = 10000
//! zone_types = ["HVACZone", "OccupancyZone", "InferredOccupancySensor"]
//! ```
//!
//! Every section is optional; missing values fall back to the defaults below.

use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Boxed wrapper for figment::Error to reduce Result size on the stack.
#[derive(Debug)]
pub struct ConfigError(Box<figment::Error>);

impl Deref for ConfigError {
    type Target = figment::Error;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self(Box::new(err))
    }
}

/// Scope used when none is configured.
pub const DEFAULT_SCOPE: &str = "default";

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Cache scope (environment / site id) every cache key lives under.
    pub scope: String,
    /// External graph sources merged by the ingestor.
    pub sources: Vec<SourceConfig>,
    pub traversal: TraversalConfig,
    pub ingest: IngestConfig,
    pub retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scope: DEFAULT_SCOPE.to_string(),
            sources: Vec::new(),
            traversal: TraversalConfig::default(),
            ingest: IngestConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

/// Which backend serves a configured source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// JSON snapshot file on disk.
    Snapshot,
    /// Empty in-process source, populated programmatically.
    Memory,
}

/// One external graph source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Unique name, used in logs, health and summaries.
    pub name: String,
    pub kind: SourceKind,
    /// Snapshot file path (required for `snapshot`).
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Traversal policy shared by instance and type level extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraversalConfig {
    /// Maximum number of dequeued nodes before a traversal is truncated.
    pub step_budget: usize,
    /// Relations dropped entirely from traversal and ingestion.
    pub excluded_relations: Vec<String>,
    /// Types at which containment traversal resets to fresh exploration.
    pub zone_types: Vec<String>,
    /// Top-level container types (seed for `all`, `isMeasureOf` relabel).
    pub top_level_types: Vec<String>,
    /// Root types of capabilities (points, sensors, setpoints).
    pub capability_types: Vec<String>,
    /// Re-admit rejected edges between result nodes at instance level too.
    pub instance_second_chance: bool,
}

impl Default for TraversalConfig {
    fn default() -> Self {
        Self {
            step_budget: 10_000,
            excluded_relations: strings(&[
                "hasDocument",
                "installedBy",
                "manufacturedBy",
                "constructedBy",
            ]),
            zone_types: strings(&["HVACZone", "OccupancyZone", "InferredOccupancySensor"]),
            top_level_types: strings(&["Building"]),
            capability_types: strings(&["Capability"]),
            instance_second_chance: false,
        }
    }
}

/// Refresh pipeline tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Worker lanes for the relationship fan-out.
    pub lanes: usize,
    /// Capacity of the bounded relationship queue.
    pub queue_capacity: usize,
    /// How long a lagging producer is waited for after the lanes finish.
    pub producer_grace_secs: u64,
    /// Target types for which `hostedBy` relationships are admitted.
    pub hosted_by_targets: Vec<String>,
    pub refresh_entities: bool,
    pub refresh_relationships: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            lanes: 8,
            queue_capacity: 100,
            producer_grace_secs: 30,
            hosted_by_targets: strings(&["ElectricalMeter"]),
            refresh_entities: true,
            refresh_relationships: true,
        }
    }
}

impl IngestConfig {
    pub fn producer_grace(&self) -> Duration {
        Duration::from_secs(self.producer_grace_secs)
    }
}

/// Exponential backoff for source calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 200,
            max_delay_ms: 10_000,
        }
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

impl Config {
    /// Load config with layered resolution (user → project → env).
    pub fn load() -> Result<Self, ConfigError> {
        Self::figment(&Self::user_config_path())
            .extract()
            .map_err(ConfigError::from)
    }

    /// The layered provider chain, rooted at the given user config file.
    pub fn figment(user_config: &Path) -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            // Layer 1: User config (lowest priority)
            .merge(Toml::file(user_config))
            // Layer 2: Project config
            .merge(Toml::file(".twingraph.toml"))
            // Layer 3: Environment variables (highest priority)
            .merge(Env::prefixed("TWINGRAPH_").split("__"))
    }

    /// User config path: ~/.config/twingraph/config.toml (XDG) or platform config dir.
    fn user_config_path() -> PathBuf {
        // Prefer XDG config location (~/.config) on all platforms
        if let Some(home) = dirs::home_dir() {
            let xdg_path = home.join(".config").join("twingraph").join("config.toml");
            if xdg_path.exists() {
                return xdg_path;
            }
        }
        // Fall back to platform-specific config dir
        dirs::config_dir()
            .map(|p| p.join("twingraph").join("config.toml"))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_without_files() {
        Jail::expect_with(|_jail| {
            let config: Config = Config::figment(Path::new("missing.toml")).extract()?;
            assert_eq!(config.scope, DEFAULT_SCOPE);
            assert_eq!(config.traversal.step_budget, 10_000);
            assert_eq!(config.ingest.lanes, 8);
            assert_eq!(config.ingest.queue_capacity, 100);
            assert!(config.sources.is_empty());
            assert!(config
                .traversal
                .excluded_relations
                .contains(&"hasDocument".to_string()));
            Ok(())
        });
    }

    #[test]
    fn test_project_file_and_env_layers() {
        Jail::expect_with(|jail| {
            jail.create_file(
                ".twingraph.toml",
                r#"
                scope = "site-42"

                [[sources]]
                name = "primary"
                kind = "snapshot"
                path = "twins.json"

                [traversal]
                step_budget = 50
                "#,
            )?;
            jail.set_env("TWINGRAPH_INGEST__LANES", "4");

            let config: Config = Config::figment(Path::new("missing.toml")).extract()?;
            assert_eq!(config.scope, "site-42");
            assert_eq!(config.sources.len(), 1);
            assert_eq!(config.sources[0].kind, SourceKind::Snapshot);
            assert_eq!(config.traversal.step_budget, 50);
            // untouched keys in a partially specified table keep their defaults
            assert_eq!(config.traversal.zone_types.len(), 3);
            assert_eq!(config.ingest.lanes, 4);
            assert_eq!(config.ingest.queue_capacity, 100);
            Ok(())
        });
    }
}
