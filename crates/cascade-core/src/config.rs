use std::{
    collections::BTreeSet,
    env,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use config as cfg;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Limits and traversal settings for the server-side change tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default = "TrackerConfig::default_max_depth")]
    pub max_depth: u32,
    #[serde(default = "TrackerConfig::default_max_entities")]
    pub max_entities: usize,
    #[serde(default = "TrackerConfig::default_enable_relationship_tracking")]
    pub enable_relationship_tracking: bool,
    /// Typenames never tracked, not even as traversal targets.
    #[serde(default)]
    pub exclude_types: BTreeSet<String>,
}

impl TrackerConfig {
    fn default_max_depth() -> u32 {
        3
    }

    fn default_max_entities() -> usize {
        1000
    }

    fn default_enable_relationship_tracking() -> bool {
        true
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_max_entities(mut self, max_entities: usize) -> Self {
        self.max_entities = max_entities;
        self
    }

    pub fn with_relationship_tracking(mut self, enabled: bool) -> Self {
        self.enable_relationship_tracking = enabled;
        self
    }

    pub fn exclude_type(mut self, typename: impl Into<String>) -> Self {
        self.exclude_types.insert(typename.into());
        self
    }

    pub fn is_excluded(&self, typename: &str) -> bool {
        self.exclude_types.contains(typename)
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_depth: Self::default_max_depth(),
            max_entities: Self::default_max_entities(),
            enable_relationship_tracking: Self::default_enable_relationship_tracking(),
            exclude_types: BTreeSet::new(),
        }
    }
}

/// Payload limits applied by the response builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuilderConfig {
    #[serde(default = "BuilderConfig::default_max_updated_entities")]
    pub max_updated_entities: usize,
    #[serde(default = "BuilderConfig::default_max_deleted_entities")]
    pub max_deleted_entities: usize,
    #[serde(default = "BuilderConfig::default_max_invalidations")]
    pub max_invalidations: usize,
    #[serde(default = "BuilderConfig::default_max_response_size_mb")]
    pub max_response_size_mb: f64,
    /// When false, responses omit the tracking and construction timings.
    #[serde(default = "BuilderConfig::default_include_metadata")]
    pub include_metadata: bool,
}

impl BuilderConfig {
    fn default_max_updated_entities() -> usize {
        500
    }

    fn default_max_deleted_entities() -> usize {
        100
    }

    fn default_max_invalidations() -> usize {
        50
    }

    fn default_max_response_size_mb() -> f64 {
        5.0
    }

    fn default_include_metadata() -> bool {
        true
    }

    pub fn max_response_bytes(&self) -> usize {
        (self.max_response_size_mb * 1024.0 * 1024.0) as usize
    }
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            max_updated_entities: Self::default_max_updated_entities(),
            max_deleted_entities: Self::default_max_deleted_entities(),
            max_invalidations: Self::default_max_invalidations(),
            max_response_size_mb: Self::default_max_response_size_mb(),
            include_metadata: Self::default_include_metadata(),
        }
    }
}

/// How a disagreement between an optimistic prediction and the server is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictStrategy {
    #[default]
    ServerWins,
    ClientWins,
    Merge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,
    /// Ids starting with this prefix are client generated placeholders.
    #[serde(default = "ClientConfig::default_temp_id_prefix")]
    pub temp_id_prefix: String,
}

impl ClientConfig {
    fn default_temp_id_prefix() -> String {
        "temp-".to_string()
    }

    pub fn is_temp_id(&self, id: &str) -> bool {
        !self.temp_id_prefix.is_empty() && id.starts_with(&self.temp_id_prefix)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            conflict_strategy: ConflictStrategy::default(),
            temp_id_prefix: Self::default_temp_id_prefix(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CascadeSettings {
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub builder: BuilderConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl CascadeSettings {
    pub fn default_env() -> String {
        env::var("CASCADE_ENV")
            .ok()
            .or_else(|| env::var("APP_ENV").ok())
            .unwrap_or_else(|| "development".to_string())
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.tracker.max_entities > 0,
            "tracker.max_entities must be > 0"
        );
        anyhow::ensure!(
            self.builder.max_updated_entities > 0,
            "builder.max_updated_entities must be > 0"
        );
        anyhow::ensure!(
            self.builder.max_response_size_mb.is_finite() && self.builder.max_response_size_mb > 0.0,
            "builder.max_response_size_mb must be a positive number"
        );
        anyhow::ensure!(
            !self.logging.level.trim().is_empty(),
            "logging.level cannot be empty"
        );
        Ok(())
    }

    /// Layered load, later sources win:
    /// 1. `default.toml`
    /// 2. `{env}.toml`
    /// 3. `local.toml`
    /// 4. `CASCADE__*` environment variables (`CASCADE__TRACKER__MAX_DEPTH=5`)
    pub fn load_from_sources(config_dir: &Path, env_name: &str) -> Result<Self> {
        let settings: CascadeSettings = cfg::Config::builder()
            .add_source(cfg::File::from(config_dir.join("default.toml")).required(false))
            .add_source(
                cfg::File::from(config_dir.join(format!("{}.toml", env_name))).required(false),
            )
            .add_source(cfg::File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                cfg::Environment::with_prefix("CASCADE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to assemble configuration sources")?
            .try_deserialize()
            .context("Failed to deserialize cascade settings")?;

        settings.validate()?;
        info!(
            "Loaded cascade settings from {:?} (env: {})",
            config_dir, env_name
        );
        Ok(settings)
    }

    /// Conventional config directory: `./config` when present, otherwise the cwd.
    pub fn default_config_dir() -> PathBuf {
        let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let project_config = cwd.join("config");
        if project_config.exists() {
            project_config
        } else {
            cwd
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let settings: CascadeSettings =
            toml::from_str(raw).context("Failed to parse cascade settings")?;
        settings.validate()?;
        Ok(settings)
    }
}
