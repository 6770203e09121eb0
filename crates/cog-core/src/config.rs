//! Configuration for the dispatcher and the recovery tool.
//!
//! Loaded from a TOML/JSON/YAML file (format taken from the extension) and
//! layered with `COG__`-prefixed environment variables, e.g.
//! `COG__STORE__PASSWORD=secret` overrides `store.password`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::PartitionMap;
use crate::impls::retry::ReconnectPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to load config: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CogConfig {
    pub store: StoreConfig,

    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub submitter: SubmitterConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connection to the document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Server root, e.g. `http://couch.example.org:5984`.
    pub url: String,
    pub database: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// How long one long-poll request on the changes feed may wait.
    #[serde(default = "default_changes_timeout_secs")]
    pub changes_timeout_secs: u64,

    /// Page size for index queries.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl StoreConfig {
    pub fn new(url: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            database: database.into(),
            username: None,
            password: None,
            changes_timeout_secs: default_changes_timeout_secs(),
            page_size: default_page_size(),
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn with_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.username = username;
        self.password = password;
        self
    }

    pub fn changes_timeout(&self) -> Duration {
        Duration::from_secs(self.changes_timeout_secs)
    }

    /// Every field here ends up on the worker's whitespace-split command line.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("store.url", Some(&self.url)),
            ("store.database", Some(&self.database)),
            ("store.username", self.username.as_ref()),
            ("store.password", self.password.as_ref()),
        ];
        for (name, value) in fields {
            if value.is_some_and(|v| v.contains(char::is_whitespace)) {
                return Err(ConfigError::Invalid(format!("{name} must not contain whitespace")));
            }
        }
        if self.url.trim().is_empty() {
            return Err(ConfigError::Invalid("store.url must not be empty".into()));
        }
        reqwest::Url::parse(&self.url)
            .map_err(|e| ConfigError::Invalid(format!("store.url '{}': {e}", self.url)))?;
        if self.database.trim().is_empty() {
            return Err(ConfigError::Invalid("store.database must not be empty".into()));
        }
        if self.changes_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "store.changes_timeout_secs must be positive".into(),
            ));
        }
        if self.page_size == 0 {
            return Err(ConfigError::Invalid("store.page_size must be positive".into()));
        }
        self.reconnect.validate()
    }
}

/// Backoff between reconnect attempts of the pending feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.multiplier.is_finite() && self.multiplier >= 1.0) {
            return Err(ConfigError::Invalid(
                "store.reconnect.multiplier must be >= 1".into(),
            ));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigError::Invalid(
                "store.reconnect.max_delay_ms must be >= base_delay_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Partition selection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Partition used when no requirement matches; unset lets the scheduler pick.
    #[serde(default)]
    pub default_partition: Option<String>,

    #[serde(default)]
    pub partition_map: PartitionMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitterConfig {
    /// Cluster submission tool.
    #[serde(default = "default_submitter_program")]
    pub program: String,

    /// Pin every job to this node.
    #[serde(default)]
    pub node: Option<String>,
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self {
            program: default_submitter_program(),
            node: None,
        }
    }
}

/// How submitted jobs start a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Program the cluster runs; it is invoked as `<program> run ...`.
    #[serde(default = "default_worker_program")]
    pub program: String,

    /// Directory for per-task stdout/stderr files.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: default_worker_program(),
            log_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_changes_timeout_secs() -> u64 {
    60
}

fn default_page_size() -> usize {
    100
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_submitter_program() -> String {
    "q".to_string()
}

fn default_worker_program() -> String {
    "cog".to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

impl CogConfig {
    /// Load `path`, apply `COG__*` environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let config: CogConfig = ConfigBuilder::builder()
            .add_source(File::from(path))
            .add_source(
                Environment::with_prefix("COG")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: CogConfig = ConfigBuilder::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.store.validate()?;
        if self.submitter.program.trim().is_empty() {
            return Err(ConfigError::Invalid("submitter.program must not be empty".into()));
        }
        if self.worker.program.trim().is_empty() {
            return Err(ConfigError::Invalid("worker.program must not be empty".into()));
        }
        if self.recovery.batch_size == 0 {
            return Err(ConfigError::Invalid("recovery.batch_size must be positive".into()));
        }
        Ok(())
    }
}
