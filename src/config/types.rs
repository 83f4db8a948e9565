use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const IN_MEMORY_PATH: &str = ":memory:";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub app_secret: String,
    pub storage: StorageConfig,
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub channels: HashMap<String, ChannelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub path: PathBuf,
}

impl StorageConfig {
    pub fn is_in_memory(&self) -> bool {
        self.path == Path::new(IN_MEMORY_PATH)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    pub log_url: String,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_concurrent_requests() -> usize {
    3
}

/// Batching parameters of one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default = "default_max_logs_per_batch")]
    pub max_logs_per_batch: usize,
    #[serde(default = "default_batch_interval", with = "humantime_serde")]
    pub batch_interval: Duration,
    #[serde(default = "default_max_parallel_batches")]
    pub max_parallel_batches: usize,
    /// First delay after a recoverable failure; doubles per consecutive
    /// failure up to one minute.
    #[serde(default = "default_retry_backoff", with = "humantime_serde")]
    pub retry_backoff: Duration,
}

fn default_max_logs_per_batch() -> usize {
    50
}

fn default_batch_interval() -> Duration {
    Duration::from_secs(3)
}

fn default_max_parallel_batches() -> usize {
    3
}

fn default_retry_backoff() -> Duration {
    Duration::from_secs(10)
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_logs_per_batch: default_max_logs_per_batch(),
            batch_interval: default_batch_interval(),
            max_parallel_batches: default_max_parallel_batches(),
            retry_backoff: default_retry_backoff(),
        }
    }
}
