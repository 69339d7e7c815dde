//! Client configuration
//!
//! Loaded from built-in defaults, an optional TOML file, and `NEBULA_*`
//! environment variables, in increasing order of precedence.
//!
//! ```toml
//! temp_dir = "/var/tmp/nebula"
//! partition_max_size = 268435456
//! replica_num = 5
//! min_replica_num = 3
//! file_concurrency = 4
//! block_concurrency = 8
//! ```

use nebula_core::{NebulaError, INLINE_FILE_SIZE, MIN_REPLICA_NUM, PARTITION_MAX_SIZE, REPLICA_NUM};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Read(PathBuf, std::io::Error),

    #[error("Failed to parse config file {0}: {1}")]
    Parse(PathBuf, toml::de::Error),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

impl From<ConfigError> for NebulaError {
    fn from(err: ConfigError) -> Self {
        NebulaError::Configuration(err.to_string())
    }
}

/// Transfer engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Scratch directory for shard and partition files
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// Files larger than this are split into partitions
    #[serde(default = "default_partition_max_size")]
    pub partition_max_size: u64,

    /// Files strictly smaller than this are sent inline
    #[serde(default = "default_inline_file_size")]
    pub inline_file_size: u64,

    /// Desired number of replicas in replica mode
    #[serde(default = "default_replica_num")]
    pub replica_num: usize,

    /// Minimum reachable peers for replica mode
    #[serde(default = "default_min_replica_num")]
    pub min_replica_num: usize,

    /// Concurrent files in directory transfers
    #[serde(default = "default_file_concurrency")]
    pub file_concurrency: usize,

    /// Concurrent shard/replica transfers per file
    #[serde(default = "default_block_concurrency")]
    pub block_concurrency: usize,

    /// Liveness probe timeout in seconds
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    /// Seconds before a download stops waiting for slow shards
    #[serde(default = "default_straggler_timeout_secs")]
    pub straggler_timeout_secs: u64,

    /// Progress reporting interval in milliseconds
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    /// Entries requested per remote directory page
    #[serde(default = "default_list_page_size")]
    pub list_page_size: usize,
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir().join("nebula")
}

fn default_partition_max_size() -> u64 {
    PARTITION_MAX_SIZE
}

fn default_inline_file_size() -> u64 {
    INLINE_FILE_SIZE
}

fn default_replica_num() -> usize {
    REPLICA_NUM
}

fn default_min_replica_num() -> usize {
    MIN_REPLICA_NUM
}

fn default_file_concurrency() -> usize {
    4
}

fn default_block_concurrency() -> usize {
    8
}

fn default_probe_timeout_secs() -> u64 {
    10
}

fn default_straggler_timeout_secs() -> u64 {
    30
}

fn default_progress_interval_ms() -> u64 {
    1000
}

fn default_list_page_size() -> usize {
    100
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            temp_dir: default_temp_dir(),
            partition_max_size: default_partition_max_size(),
            inline_file_size: default_inline_file_size(),
            replica_num: default_replica_num(),
            min_replica_num: default_min_replica_num(),
            file_concurrency: default_file_concurrency(),
            block_concurrency: default_block_concurrency(),
            probe_timeout_secs: default_probe_timeout_secs(),
            straggler_timeout_secs: default_straggler_timeout_secs(),
            progress_interval_ms: default_progress_interval_ms(),
            list_page_size: default_list_page_size(),
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file, then apply environment overrides
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        let mut config: ClientConfig =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `NEBULA_*` environment variables
    pub fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("NEBULA_TEMP_DIR") {
            self.temp_dir = PathBuf::from(dir);
        }

        self.partition_max_size = env_or("NEBULA_PARTITION_MAX_SIZE", self.partition_max_size);
        self.inline_file_size = env_or("NEBULA_INLINE_FILE_SIZE", self.inline_file_size);
        self.replica_num = env_or("NEBULA_REPLICA_NUM", self.replica_num);
        self.min_replica_num = env_or("NEBULA_MIN_REPLICA_NUM", self.min_replica_num);
        self.file_concurrency = env_or("NEBULA_FILE_CONCURRENCY", self.file_concurrency);
        self.block_concurrency = env_or("NEBULA_BLOCK_CONCURRENCY", self.block_concurrency);
        self.probe_timeout_secs = env_or("NEBULA_PROBE_TIMEOUT", self.probe_timeout_secs);
        self.straggler_timeout_secs =
            env_or("NEBULA_STRAGGLER_TIMEOUT", self.straggler_timeout_secs);
        self.progress_interval_ms = env_or("NEBULA_PROGRESS_INTERVAL_MS", self.progress_interval_ms);
        self.list_page_size = env_or("NEBULA_LIST_PAGE_SIZE", self.list_page_size);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("partition_max_size", self.partition_max_size as usize),
            ("min_replica_num", self.min_replica_num),
            ("file_concurrency", self.file_concurrency),
            ("block_concurrency", self.block_concurrency),
            ("list_page_size", self.list_page_size),
            ("progress_interval_ms", self.progress_interval_ms as usize),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue(
                    name.to_string(),
                    "must be > 0".to_string(),
                ));
            }
        }
        if self.min_replica_num > self.replica_num {
            return Err(ConfigError::InvalidValue(
                "min_replica_num".to_string(),
                format!(
                    "{} exceeds replica_num {}",
                    self.min_replica_num, self.replica_num
                ),
            ));
        }
        Ok(())
    }

    /// Get probe timeout as Duration
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Get straggler timeout as Duration
    pub fn straggler_timeout(&self) -> Duration {
        Duration::from_secs(self.straggler_timeout_secs)
    }

    /// Get progress interval as Duration
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

fn env_or<T: std::str::FromStr>(key: &str, current: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(current)
}
