use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Blob storage backend configuration.
///
/// `backend = "filesystem"` resolves keys under `root`; `backend = "s3"`
/// fetches objects from `bucket` (credentials come from the standard AWS
/// environment variables).
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    pub root: Option<PathBuf>,
    pub bucket: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub prefix: String,
    /// Custom endpoint for S3-compatible services (MinIO, LocalStack).
    pub endpoint_url: Option<String>,
}

fn default_backend() -> String {
    "filesystem".to_string()
}
fn default_region() -> String {
    "us-east-2".to_string()
}

/// Task queue delivery tuning.
///
/// The visibility timeout must exceed the maximum expected task duration;
/// a delivered-but-unacked item becomes receivable again once it elapses.
#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: i64,
    /// Long-poll window for an empty receive.
    #[serde(default = "default_wait_time")]
    pub wait_time_secs: u64,
    /// Redeliveries allowed after the first delivery of an item.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,
    /// Base delay for release backoff; doubles per prior attempt.
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_secs: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: default_visibility_timeout(),
            wait_time_secs: default_wait_time(),
            max_attempts: default_max_attempts(),
            retry_base_delay_secs: default_retry_base_delay(),
        }
    }
}

fn default_visibility_timeout() -> i64 {
    3600
}
fn default_wait_time() -> u64 {
    20
}
fn default_max_attempts() -> i64 {
    3
}
fn default_retry_base_delay() -> i64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    700
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Directory for spooled temp files. Defaults to the system temp dir.
    pub spool_dir: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            spool_dir: None,
        }
    }
}

fn default_concurrency() -> usize {
    2
}

impl WorkerConfig {
    pub fn spool_path(&self) -> PathBuf {
        self.spool_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }

    if config.queue.max_attempts < 1 {
        anyhow::bail!("queue.max_attempts must be >= 1");
    }

    if config.queue.visibility_timeout_secs < 1 {
        anyhow::bail!("queue.visibility_timeout_secs must be >= 1");
    }

    if config.worker.concurrency == 0 {
        anyhow::bail!("worker.concurrency must be > 0");
    }

    match config.storage.backend.as_str() {
        "filesystem" => {
            if config.storage.root.is_none() {
                anyhow::bail!("storage.root must be set when backend is 'filesystem'");
            }
        }
        "s3" => {
            if config.storage.bucket.is_none() {
                anyhow::bail!("storage.bucket must be set when backend is 's3'");
            }
        }
        other => anyhow::bail!(
            "Unknown storage backend: '{}'. Must be filesystem or s3.",
            other
        ),
    }

    Ok(config)
}
