use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use thiserror::Error;

use crate::transfer::worker::WorkerConfig;
use crate::validation::batch::ValidatorConfig;
use crate::validation::chunking::{ChunkingPolicy, RetryPolicy};

/// Environment variable overriding `erp.password`
pub const ERP_PASSWORD_ENV: &str = "WMS_ERP_PASSWORD";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    /// PostgreSQL connection URL; in-memory store when absent
    #[serde(default)]
    pub postgres_url: Option<String>,
    pub erp: ErpConfig,
    #[serde(default)]
    pub authority: AuthorityConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

/// ERP Service Layer connection
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ErpConfig {
    pub base_url: String,
    pub company_db: String,
    pub username: String,
    #[serde(default, skip_serializing)]
    pub password: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl ErpConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Stored queries used for unit validation
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuthorityConfig {
    /// Serial lookup: `series`, `itemCode`, optional `whsCode`
    pub series_query: String,
    /// Batch lookup: `batch`, `itemCode`, optional `whsCode`
    pub batch_query: String,
    /// Multi-serial lookup; per-identifier calls when absent
    #[serde(default)]
    pub bulk_series_query: Option<String>,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            series_query: "Series_Validation".to_string(),
            batch_query: "Batch_Validation".to_string(),
            bulk_series_query: None,
        }
    }
}

/// Batch validation tuning
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ValidationConfig {
    pub min_chunk_size: usize,
    pub max_chunk_size: usize,
    /// Number of chunks a submission is split into before clamping
    pub target_chunks: usize,
    /// Concurrent authority calls within one chunk
    pub concurrency: usize,
    pub call_timeout_ms: u64,
    /// How long checkpointed outcomes may be reused
    pub checkpoint_ttl_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_chunk_size: 10,
            max_chunk_size: 200,
            target_chunks: 10,
            concurrency: 8,
            call_timeout_ms: 10_000,
            checkpoint_ttl_secs: 900,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub sub_chunk_divisor: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            initial_delay_ms: 250,
            max_delay_ms: 5_000,
            multiplier: 2.0,
            sub_chunk_divisor: 4,
        }
    }
}

impl ValidationConfig {
    pub fn to_validator_config(&self) -> Result<ValidatorConfig, ConfigError> {
        if self.min_chunk_size == 0 || self.min_chunk_size > self.max_chunk_size {
            return Err(ConfigError::Invalid(format!(
                "chunk size bounds {}..{} are invalid",
                self.min_chunk_size, self.max_chunk_size
            )));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be >= 1".into()));
        }

        Ok(ValidatorConfig {
            chunking: ChunkingPolicy {
                min_chunk_size: self.min_chunk_size,
                max_chunk_size: self.max_chunk_size,
                target_chunks: self.target_chunks.max(1),
            },
            retry: RetryPolicy::builder()
                .max_retries(self.retry.max_retries)
                .initial_delay(Duration::from_millis(self.retry.initial_delay_ms))
                .max_delay(Duration::from_millis(self.retry.max_delay_ms))
                .multiplier(self.retry.multiplier)
                .sub_chunk_divisor(self.retry.sub_chunk_divisor)
                .build(),
            concurrency: self.concurrency,
            call_timeout: Duration::from_millis(self.call_timeout_ms),
            checkpoint_ttl: Duration::from_secs(self.checkpoint_ttl_secs),
        })
    }
}

/// Posting recovery worker
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecoveryConfig {
    pub scan_interval_secs: u64,
    pub stale_threshold_secs: u64,
    pub max_posting_attempts: u32,
    pub batch_size: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: 30,
            stale_threshold_secs: 60,
            max_posting_attempts: 5,
            batch_size: 100,
        }
    }
}

impl RecoveryConfig {
    pub fn to_worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            scan_interval: Duration::from_secs(self.scan_interval_secs),
            stale_threshold: Duration::from_secs(self.stale_threshold_secs),
            max_posting_attempts: self.max_posting_attempts.max(1),
            batch_size: self.batch_size,
        }
    }
}

impl AppConfig {
    /// Load `config/<env>.yaml`
    pub fn load(env: &str) -> Result<Self, ConfigError> {
        Self::from_file(&format!("config/{}.yaml", env))
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        let mut config = Self::from_yaml(&content)?;
        if let Ok(password) = std::env::var(ERP_PASSWORD_ENV) {
            config.erp.password = password;
        }
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}
