//! # Configuration
//!
//! Layered configuration built with the `config` crate, in increasing precedence:
//!
//! 1. `config/imagebatch.toml`
//! 2. `config/imagebatch.<environment>.toml`, where the environment comes from
//!    `IMAGEBATCH_ENV` (falling back to `APP_ENV`, then `development`)
//! 3. Environment variables prefixed `IMAGEBATCH__`, with `__` between path segments,
//!    e.g. `IMAGEBATCH__WORKER__CONCURRENCY=16`
//!
//! Every field has a default, so an empty layer stack still yields a usable
//! configuration. `DATABASE_URL` is honoured when `database.url` is not set.

pub mod error;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub use error::{ConfigResult, ConfigurationError};

use crate::constants::{env, lanes};
use crate::messaging::{Lane, LaneQueueNames};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageBatchConfig {
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub fetch: FetchConfig,
    pub transform: TransformConfig,
    pub storage: StorageConfig,
    pub delivery: DeliveryConfig,
    pub finalization: FinalizationConfig,
    pub reconciliation: ReconciliationConfig,
}

/// Which store and queue implementation the process runs on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[default]
    Postgres,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub backend: Backend,
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_seconds: u64,
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Postgres,
            url: None,
            max_connections: 10,
            min_connections: 1,
            acquire_timeout_seconds: 30,
            run_migrations: true,
        }
    }
}

impl DatabaseConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub fast_queue: String,
    pub image_queue: String,
    pub visibility_timeout_seconds: u64,
    /// Messages read per poll
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    /// Reads after which a message is archived instead of processed again
    pub max_read_count: i32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            fast_queue: lanes::FAST_QUEUE.to_string(),
            image_queue: lanes::IMAGE_QUEUE.to_string(),
            visibility_timeout_seconds: 60,
            batch_size: 10,
            poll_interval_ms: 250,
            max_read_count: 5,
        }
    }
}

impl QueueConfig {
    pub fn queue_names(&self) -> LaneQueueNames {
        LaneQueueNames {
            fast: self.fast_queue.clone(),
            image: self.image_queue.clone(),
        }
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub lanes: Vec<Lane>,
    /// In-flight units per lane
    pub concurrency: usize,
    pub shutdown_timeout_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            lanes: Lane::ALL.to_vec(),
            concurrency: 8,
            shutdown_timeout_seconds: 30,
        }
    }
}

impl WorkerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_seconds: u64,
    pub max_bytes: u64,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            max_bytes: 20 * 1024 * 1024,
            user_agent: concat!("imagebatch/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    /// Output dimensions as a fraction of the input's, in (0, 1]
    pub downscale_ratio: f64,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            downscale_ratio: 0.5,
        }
    }
}

impl TransformConfig {
    /// A ratio of 1.0 leaves pixels untouched
    pub fn is_pass_through(&self) -> bool {
        (self.downscale_ratio - 1.0).abs() < f64::EPSILON
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub output_dir: PathBuf,
    /// When set, output URLs are `<public_base_url>/<relative path>` instead of
    /// `file://` URLs
    pub public_base_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            public_base_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Delivery is skipped when unset
    pub callback_url: Option<String>,
    pub timeout_seconds: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            callback_url: None,
            timeout_seconds: 30,
        }
    }
}

impl DeliveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPolicyKind {
    #[default]
    AllSucceeded,
    AnySucceeded,
    MinimumRatio,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalizationConfig {
    pub policy: CompletionPolicyKind,
    /// Only consulted by `minimum_ratio`
    pub minimum_ratio: f64,
}

impl Default for FinalizationConfig {
    fn default() -> Self {
        Self {
            policy: CompletionPolicyKind::AllSucceeded,
            minimum_ratio: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    pub stale_after_seconds: u64,
    /// Units re-submitted per sweep
    pub batch_limit: i64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_seconds: 60,
            stale_after_seconds: 300,
            batch_limit: 100,
        }
    }
}

impl ReconciliationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_seconds)
    }
}

impl ImageBatchConfig {
    /// Load from `./config` for the detected environment
    pub fn load() -> ConfigResult<Self> {
        Self::load_from_directory(Path::new("config"), &detect_environment())
    }

    pub fn load_from_directory(config_dir: &Path, environment: &str) -> ConfigResult<Self> {
        let base = config_dir.join("imagebatch.toml");
        let overlay = config_dir.join(format!("imagebatch.{environment}.toml"));

        debug!(
            environment = %environment,
            config_dir = %config_dir.display(),
            "Loading configuration"
        );

        let layered = config::Config::builder()
            .add_source(config::File::from(base).required(false))
            .add_source(config::File::from(overlay).required(false))
            .add_source(
                config::Environment::with_prefix(env::CONFIG_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("worker.lanes")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: ImageBatchConfig = layered.try_deserialize()?;
        if config.database.url.is_none() {
            config.database.url = std::env::var(env::DATABASE_URL).ok();
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values no component can run with
    pub fn validate(&self) -> ConfigResult<()> {
        let ratio = self.transform.downscale_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(ConfigurationError::invalid_value(
                "transform.downscale_ratio",
                ratio,
                "must be in (0, 1]",
            ));
        }

        let minimum = self.finalization.minimum_ratio;
        if !(0.0..=1.0).contains(&minimum) {
            return Err(ConfigurationError::invalid_value(
                "finalization.minimum_ratio",
                minimum,
                "must be in [0, 1]",
            ));
        }

        if self.worker.concurrency == 0 {
            return Err(ConfigurationError::invalid_value(
                "worker.concurrency",
                0,
                "at least one in-flight unit per lane is required",
            ));
        }
        if self.worker.lanes.is_empty() {
            return Err(ConfigurationError::invalid_value(
                "worker.lanes",
                "[]",
                "a worker must consume at least one lane",
            ));
        }
        if self.queue.batch_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "queue.batch_size",
                0,
                "must be positive",
            ));
        }
        if self.queue.max_read_count < 1 {
            return Err(ConfigurationError::invalid_value(
                "queue.max_read_count",
                self.queue.max_read_count,
                "must be positive",
            ));
        }
        if self.queue.fast_queue == self.queue.image_queue {
            return Err(ConfigurationError::invalid_value(
                "queue.image_queue",
                &self.queue.image_queue,
                "lanes must map to distinct queues",
            ));
        }
        if self.database.min_connections > self.database.max_connections {
            return Err(ConfigurationError::invalid_value(
                "database.min_connections",
                self.database.min_connections,
                "cannot exceed database.max_connections",
            ));
        }
        if self.reconciliation.enabled && self.reconciliation.batch_limit < 1 {
            return Err(ConfigurationError::invalid_value(
                "reconciliation.batch_limit",
                self.reconciliation.batch_limit,
                "must be positive when reconciliation is enabled",
            ));
        }
        if self.reconciliation.enabled && self.reconciliation.interval_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "reconciliation.interval_seconds",
                0,
                "must be positive when reconciliation is enabled",
            ));
        }
        if self.database.backend == Backend::Postgres && self.database.url.is_none() {
            return Err(ConfigurationError::missing_required_field(
                "database.url",
                "the postgres backend (or set DATABASE_URL)",
            ));
        }
        Ok(())
    }
}

/// Current environment name from `IMAGEBATCH_ENV`, then `APP_ENV`
pub fn detect_environment() -> String {
    std::env::var(env::ENVIRONMENT)
        .or_else(|_| std::env::var(env::FALLBACK_ENVIRONMENT))
        .unwrap_or_else(|_| "development".to_string())
}
