//! Configuration types for content-migrate.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::endpoint::{ContentEndpoint, JsonDirEndpoint, MemoryEndpoint};
use crate::error::{Error, Result};
use crate::pipeline::PipelineDefinition;
use crate::retry::RetryConfig;

/// Main migration configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Endpoint content is read from.
    pub source: EndpointConfig,
    /// Endpoint content is published to.
    pub destination: EndpointConfig,
    /// Manifest file path.
    #[serde(default = "default_manifest_path")]
    pub manifest: PathBuf,
    /// Stage declarations; the standard pipeline when omitted.
    #[serde(default)]
    pub pipeline: Option<PipelineDefinition>,
    /// Migration options.
    #[serde(default)]
    pub options: MigrationOptions,
}

/// Endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EndpointConfig {
    /// Directory with one JSON file per content type.
    #[serde(rename = "json_dir")]
    JsonDir {
        /// Root directory.
        path: PathBuf,
    },
    /// Empty in-process endpoint, useful for dry runs.
    #[serde(rename = "memory")]
    Memory,
}

impl EndpointConfig {
    /// Builds the endpoint. `role` names the side for generated ids.
    #[must_use]
    pub fn build(&self, role: &str) -> Arc<dyn ContentEndpoint> {
        match self {
            Self::JsonDir { path } => Arc::new(JsonDirEndpoint::new(path.clone())),
            Self::Memory => Arc::new(MemoryEndpoint::new(role)),
        }
    }
}

/// Migration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationOptions {
    /// Page size used when listing source content.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Number of items processed concurrently within a batch.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Leave items that failed in an earlier run alone.
    #[serde(default)]
    pub skip_failed: bool,
    /// Save the manifest once this many changes are pending.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,
    /// Run everything except publishing and manifest writes.
    #[serde(default)]
    pub dry_run: bool,
    /// Show a progress bar per stage.
    #[serde(default)]
    pub show_progress: bool,
    /// Parent directory of the staged file store; system temp when unset.
    #[serde(default)]
    pub file_store_dir: Option<PathBuf>,
    /// Retry policy for endpoint calls.
    #[serde(default)]
    pub retry: RetryOptions,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            workers: default_workers(),
            skip_failed: false,
            checkpoint_interval: default_checkpoint_interval(),
            dry_run: false,
            show_progress: false,
            file_store_dir: None,
            retry: RetryOptions::default(),
        }
    }
}

/// Retry options as written in configuration files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryOptions {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Upper bound for a single delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Multiplier applied per attempt.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Randomize delays.
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

impl RetryOptions {
    /// Converts to the runtime retry policy.
    #[must_use]
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
            add_jitter: self.jitter,
        }
    }
}

fn default_manifest_path() -> PathBuf {
    PathBuf::from("migration-manifest.json")
}

fn default_batch_size() -> usize {
    100
}

fn default_workers() -> usize {
    4
}

fn default_checkpoint_interval() -> usize {
    25
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

impl MigrationOptions {
    /// Validate the options.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be greater than 0".to_string()));
        }
        if self.workers == 0 {
            return Err(Error::Config("workers must be greater than 0".to_string()));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::Config(
                "retry.backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

impl MigrationConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// The configured pipeline, or the standard one.
    #[must_use]
    pub fn pipeline(&self) -> PipelineDefinition {
        self.pipeline
            .clone()
            .unwrap_or_else(PipelineDefinition::standard)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        self.options.validate()?;
        if self.pipeline().is_empty() {
            return Err(Error::Config("pipeline has no stages".to_string()));
        }
        if self.manifest.as_os_str().is_empty() {
            return Err(Error::Config("manifest path cannot be empty".to_string()));
        }
        Ok(())
    }

    /// Example configuration written by `content-migrate init`.
    #[must_use]
    pub fn example_yaml() -> &'static str {
        r"# content-migrate configuration
source:
  type: json_dir
  path: ./export

destination:
  type: json_dir
  path: ./import

manifest: ./migration-manifest.json

# Stages run in dependency order. Omit to use the standard
# Group -> User -> Project -> DataSource -> Workbook pipeline.
pipeline:
  - content_type: Group
  - content_type: User
    depends_on: [Group]
  - content_type: Project
    depends_on: [User]

options:
  batch_size: 100
  workers: 4
  skip_failed: false
  checkpoint_interval: 25
  dry_run: false
  show_progress: true
  retry:
    max_retries: 3
    initial_delay_ms: 500
    max_delay_ms: 30000
    backoff_multiplier: 2.0
    jitter: true
"
    }
}
