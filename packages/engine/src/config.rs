//! Engine configuration loaded from environment variables.
//!
//! Invalid values refuse to start rather than degrade: a typo'd worker count
//! or an undersized encryption key is a deployment error, not something to
//! paper over at runtime.

use std::env;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Which blob-store backend to construct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    Local,
    S3,
}

impl StorageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageBackend::Local => "local",
            StorageBackend::S3 => "s3",
        }
    }
}

/// Blob-store settings; backend-specific fields are validated only for the
/// selected backend.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub local_path: String,
    pub s3_endpoint: String,
    pub s3_region: String,
    pub s3_bucket: String,
    pub s3_access_key: String,
    pub s3_secret_key: String,
    pub s3_use_path_style: bool,
}

/// Everything the engine reads from its environment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of capture workers (1..=10).
    pub workers: usize,
    /// Default viewport for captures that do not override it.
    pub viewport_width: u32,
    pub viewport_height: u32,
    /// Per-capture browser deadline.
    pub wait_timeout: Duration,
    /// Explicit Chromium binary path; auto-detected when unset.
    pub chrome_path: Option<String>,

    /// How often the dispatcher polls for leasable jobs.
    pub poll_interval: Duration,
    /// How many jobs one poll leases at most.
    pub batch_size: i64,
    /// Capacity of the dispatcher→worker channel. Must be >= workers.
    pub channel_size: usize,
    /// Retries granted to each job before it is marked failed.
    pub max_retries: i32,
    /// Exclusive claim duration; must outlast the worst expected capture.
    pub lease_duration: Duration,

    pub storage: StorageConfig,

    /// 32-byte key for AES-256-GCM secret sealing.
    pub encryption_key: Vec<u8>,
}

impl EngineConfig {
    /// Load and validate configuration from the process environment.
    ///
    /// Reads a `.env` file first when present (development convenience).
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let config = Self {
            workers: env_parse("CAPTURE_WORKERS", 2)?,
            viewport_width: env_parse("CAPTURE_VIEWPORT_WIDTH", 1920)?,
            viewport_height: env_parse("CAPTURE_VIEWPORT_HEIGHT", 1080)?,
            wait_timeout: Duration::from_millis(env_parse("CAPTURE_WAIT_TIMEOUT_MS", 30_000)?),
            chrome_path: env::var("CAPTURE_CHROME_PATH").ok(),
            poll_interval: Duration::from_secs(env_parse("QUEUE_POLL_INTERVAL", 5)?),
            batch_size: env_parse("QUEUE_BATCH_SIZE", 10)?,
            channel_size: env_parse("QUEUE_CHANNEL_SIZE", 100)?,
            max_retries: env_parse("QUEUE_MAX_RETRIES", 3)?,
            lease_duration: Duration::from_secs(env_parse("QUEUE_LEASE_DURATION", 300)?),
            storage: StorageConfig {
                backend: match env::var("STORAGE_BACKEND").as_deref() {
                    Ok("s3") => StorageBackend::S3,
                    Ok("local") | Err(_) => StorageBackend::Local,
                    Ok(other) => bail!("STORAGE_BACKEND must be 'local' or 's3', got '{other}'"),
                },
                local_path: env::var("STORAGE_LOCAL_PATH")
                    .unwrap_or_else(|_| "./data/captures".to_string()),
                s3_endpoint: env::var("STORAGE_S3_ENDPOINT").unwrap_or_default(),
                s3_region: env::var("STORAGE_S3_REGION").unwrap_or_default(),
                s3_bucket: env::var("STORAGE_S3_BUCKET").unwrap_or_default(),
                s3_access_key: env::var("STORAGE_S3_ACCESS_KEY").unwrap_or_default(),
                s3_secret_key: env::var("STORAGE_S3_SECRET_KEY").unwrap_or_default(),
                s3_use_path_style: env::var("STORAGE_S3_USE_PATH_STYLE")
                    .map(|v| v == "true" || v == "1")
                    .unwrap_or(false),
            },
            encryption_key: env::var("ENCRYPTION_KEY")
                .context("ENCRYPTION_KEY must be set")?
                .into_bytes(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Enforce the configuration contract. Violations refuse to start.
    pub fn validate(&self) -> Result<()> {
        if !(1..=10).contains(&self.workers) {
            bail!("CAPTURE_WORKERS must be between 1 and 10, got {}", self.workers);
        }
        if self.poll_interval < Duration::from_secs(1) {
            bail!("QUEUE_POLL_INTERVAL must be at least 1 second");
        }
        if self.max_retries < 1 {
            bail!("QUEUE_MAX_RETRIES must be at least 1, got {}", self.max_retries);
        }
        if self.lease_duration < Duration::from_secs(60) {
            bail!("QUEUE_LEASE_DURATION must be at least 60 seconds");
        }
        if self.batch_size < 1 {
            bail!("QUEUE_BATCH_SIZE must be at least 1, got {}", self.batch_size);
        }
        if self.channel_size < self.workers {
            bail!(
                "QUEUE_CHANNEL_SIZE ({}) must be at least the worker count ({})",
                self.channel_size,
                self.workers
            );
        }
        if self.encryption_key.len() < 32 {
            bail!("ENCRYPTION_KEY must be at least 32 bytes");
        }
        if self.storage.backend == StorageBackend::S3 {
            if self.storage.s3_bucket.is_empty() {
                bail!("STORAGE_S3_BUCKET must be set for the s3 backend");
            }
            if self.storage.s3_region.is_empty() {
                bail!("STORAGE_S3_REGION must be set for the s3 backend");
            }
            if self.storage.s3_access_key.is_empty() || self.storage.s3_secret_key.is_empty() {
                bail!("STORAGE_S3_ACCESS_KEY and STORAGE_S3_SECRET_KEY must be set for the s3 backend");
            }
        }
        Ok(())
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .with_context(|| format!("{name} is not a valid value: '{raw}'")),
        Err(_) => Ok(default),
    }
}
