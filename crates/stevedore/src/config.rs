//! Configuration types for the load pipeline
//!
//! Loaded from YAML with `${VAR}` / `${VAR:-default}` environment expansion.
//! Values only; argument parsing lives in the CLI binary.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::LazyLock;

use crate::placement::ShardRef;

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoadConfig {
    /// Destination store connection configuration
    pub store: StoreConfig,

    /// Batch and transaction sizing
    #[serde(default)]
    pub batch: BatchConfig,

    /// Retry configuration for failed batch writes
    #[serde(default)]
    pub retry: RetryConfig,

    /// Worker pool configuration
    #[serde(default)]
    pub workers: WorkerConfig,

    /// Input configuration
    #[serde(default)]
    pub input: InputConfig,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Destination store configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    /// Cluster entry hosts (host:port)
    pub hosts: Vec<String>,

    /// Address shards directly instead of going through entry hosts
    #[serde(default)]
    pub fastload: bool,

    /// Route every connection through `allowed_hosts` only
    #[serde(default)]
    pub restrict_hosts: bool,

    /// Known reachable hosts when `restrict_hosts` is set (ordered;
    /// the order fixes the balancer tie-break)
    #[serde(default)]
    pub allowed_hosts: Vec<String>,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// Request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Static shard map; when empty and `fastload` is set, the map is
    /// fetched from the store topology endpoint at startup
    #[serde(default)]
    pub shards: Vec<ShardRef>,
}

fn default_connection_timeout_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

/// Batch and transaction sizing
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BatchConfig {
    /// Documents per batch write request
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Batches per commit
    #[serde(default = "default_txn_size")]
    pub txn_size: u32,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            txn_size: default_txn_size(),
        }
    }
}

fn default_batch_size() -> usize {
    100
}

fn default_txn_size() -> u32 {
    10
}

/// Retry configuration for failed batch writes
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Total number of submission attempts for one batch
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff in milliseconds
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff in milliseconds
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Backoff multiplier
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryConfig {
    /// Backoff before retry `attempt` (1-indexed): initial delay scaled by
    /// the multiplier per prior retry, capped at the maximum.
    pub fn backoff_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let capped_attempt = attempt.min(30);
        let delay = self.initial_backoff_ms as f64
            * self.backoff_multiplier.powi(capped_attempt.saturating_sub(1) as i32);
        std::time::Duration::from_millis(delay.min(self.max_backoff_ms as f64) as u64)
    }
}

fn default_max_retries() -> u32 {
    4
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    120_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

/// Worker pool configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    /// Total worker budget across all splits
    #[serde(default = "default_thread_count")]
    pub thread_count: usize,

    /// Workers per split; 0 lets the runner divide `thread_count`
    #[serde(default)]
    pub threads_per_split: usize,

    /// Floor for workers assigned to any split
    #[serde(default = "default_min_threads")]
    pub min_threads: usize,

    /// Ceiling for workers assigned to any split; 0 = no ceiling
    #[serde(default)]
    pub max_threads: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            thread_count: default_thread_count(),
            threads_per_split: 0,
            min_threads: default_min_threads(),
            max_threads: 0,
        }
    }
}

fn default_thread_count() -> usize {
    4
}
fn default_min_threads() -> usize {
    1
}

/// Input configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InputConfig {
    /// Directory to load documents from
    #[serde(default)]
    pub path: PathBuf,

    /// Prefix prepended to every generated URI
    #[serde(default)]
    pub uri_prefix: String,

    /// Suffix appended to every generated URI
    #[serde(default)]
    pub uri_suffix: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl LoadConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file: {}", e))?;

        // Expand environment variables
        let expanded = Self::expand_env_vars(&content);

        let config: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;

        config.validate()?;
        Ok(config)
    }

    /// Expand environment variables in the format ${VAR} or ${VAR:-default}
    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());

                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.store.hosts.is_empty() {
            anyhow::bail!("store must have at least one host");
        }
        if self.batch.batch_size == 0 {
            anyhow::bail!("batch_size must be at least 1");
        }
        if self.batch.txn_size == 0 {
            anyhow::bail!("txn_size must be at least 1");
        }
        if self.retry.max_retries == 0 {
            anyhow::bail!("max_retries must be at least 1");
        }
        if self.retry.backoff_multiplier < 1.0 {
            anyhow::bail!("backoff_multiplier must be at least 1.0");
        }
        if self.workers.thread_count == 0 {
            anyhow::bail!("thread_count must be at least 1");
        }
        if self.workers.min_threads == 0 {
            anyhow::bail!("min_threads must be at least 1");
        }
        if self.workers.max_threads > 0 && self.workers.max_threads < self.workers.min_threads {
            anyhow::bail!("max_threads must be at least min_threads");
        }
        if self.store.restrict_hosts && self.store.allowed_hosts.is_empty() {
            anyhow::bail!("restrict_hosts requires a non-empty allowed_hosts list");
        }

        Ok(())
    }
}
