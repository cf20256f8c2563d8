//! Configuration management for Floodgate.
//!
//! Configuration is read from an optional YAML file and then overridden by
//! `FLOODGATE__`-prefixed environment variables, e.g.
//! `FLOODGATE__STORE__DIR=/var/lib/floodgate`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::{FloodgateError, Result};
use crate::ratelimit::{
    FileStore, MemoryStore, PolicyRules, RateLimiter, RulesOverlay, Sweeper, WindowStore,
    DEFAULT_KEY_PREFIX, DEFAULT_MAX_AGE, DEFAULT_MAX_RECORDS,
};

/// Environment variable prefix for overrides.
const ENV_PREFIX: &str = "FLOODGATE";

/// Main configuration for Floodgate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Window store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Inline policy rules
    #[serde(default)]
    pub rules: PolicyRules,

    /// Optional YAML file with additional policy rules, merged over `rules`
    #[serde(default)]
    pub rules_path: Option<PathBuf>,

    /// Retention configuration
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Limiter behaviour
    #[serde(default)]
    pub limiter: LimiterConfig,
}

/// Which window store backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// One file per fingerprint in `dir`
    #[default]
    File,
    /// Process-local memory; history is lost on exit
    Memory,
}

/// Window store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend type
    #[serde(default)]
    pub backend: StoreBackend,

    /// Directory for the file backend
    #[serde(default = "default_store_dir")]
    pub dir: PathBuf,

    /// Record name prefix for the file backend
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            dir: default_store_dir(),
            prefix: default_prefix(),
        }
    }
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("./data/ratelimit")
}

fn default_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

/// Retention (garbage collection) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Sweep after every accepted attempt
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Records untouched for longer than this are deleted
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,

    /// Upper bound on the number of stored records
    #[serde(default = "default_max_records")]
    pub max_records: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            max_age_secs: default_max_age_secs(),
            max_records: default_max_records(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_age_secs() -> u64 {
    DEFAULT_MAX_AGE.as_secs()
}

fn default_max_records() -> usize {
    DEFAULT_MAX_RECORDS
}

impl RetentionConfig {
    /// The sweeper described by this configuration, whether or not enabled.
    pub fn sweeper(&self) -> Sweeper {
        Sweeper::new(Duration::from_secs(self.max_age_secs), self.max_records)
    }
}

/// Limiter behaviour configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Serialize concurrent checks for the same fingerprint in this process
    #[serde(default = "default_true")]
    pub serialize_per_fingerprint: bool,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            serialize_per_fingerprint: default_true(),
        }
    }
}

impl FloodgateConfig {
    /// Load configuration from an optional YAML file plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// Load configuration from a YAML file without environment overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| FloodgateError::Config(e.to_string()))
    }

    /// The effective policy rules: inline rules with `rules_path` merged over them.
    pub fn policy_rules(&self) -> Result<PolicyRules> {
        let mut rules = self.rules.clone();
        if let Some(path) = &self.rules_path {
            rules.merge(RulesOverlay::from_file(path)?);
        }
        Ok(rules)
    }

    /// Build the configured window store.
    pub fn build_store(&self) -> Arc<dyn WindowStore> {
        match self.store.backend {
            StoreBackend::File => Arc::new(FileStore::with_prefix(
                self.store.dir.clone(),
                self.store.prefix.clone(),
            )),
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
        }
    }

    /// Build a rate limiter from this configuration.
    pub fn build_limiter(&self) -> Result<RateLimiter> {
        let sweeper = self
            .retention
            .enabled
            .then(|| self.retention.sweeper());

        Ok(RateLimiter::new(self.build_store())
            .with_rules(self.policy_rules()?)
            .with_sweeper(sweeper)
            .serialize_per_fingerprint(self.limiter.serialize_per_fingerprint))
    }
}
