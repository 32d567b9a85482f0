//! Store configuration
//!
//! Loaded from (in order of priority, later steps override earlier ones):
//! 1. Built-in defaults
//! 2. JSON file (`~/.config/mailstore/storage.json`, or an explicit path)
//! 3. `MAILSTORE_*` environment variables

use anyhow::{Context, Result};
use chrono::{Duration, TimeDelta};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::storage::{BlobCodec, BucketName, DEFAULT_PAGE_SIZE};

/// Configuration filename in the mailstore config directory
pub const CONFIG_FILE: &str = "storage.json";

/// Prefix of environment overrides
const ENV_PREFIX: &str = "MAILSTORE_";

/// Settings for the blob store, metadata store and retention sweep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root for blobs and the metadata database
    pub data_dir: PathBuf,
    pub default_bucket: String,
    /// SizeBased blobs larger than this many bytes are compressed
    pub compression_threshold: usize,
    pub compression_level: i32,
    /// Upload buckets older than this are removed by the `expired` sweep
    pub retention_weeks: i64,
    /// Rows per round trip when streaming metadata
    pub page_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let data_dir = config::data_dir().unwrap_or_else(|| PathBuf::from(".mailstore"));
        Self {
            data_dir,
            default_bucket: "default".to_string(),
            compression_threshold: 4 * 1024,
            compression_level: 3,
            retention_weeks: 2,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl StoreConfig {
    /// Load from the default config file if present, then the environment
    pub fn load() -> Result<Self> {
        let mut config = if config::config_exists(CONFIG_FILE) {
            config::load_json(CONFIG_FILE)?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a specific JSON file, then the environment
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut config: Self = config::load_json_file(path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Write this configuration to the default config file
    pub fn save(&self) -> Result<()> {
        config::save_json(CONFIG_FILE, self)
    }

    /// Apply `MAILSTORE_*` overrides looked up through `lookup`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(dir) = var("DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(bucket) = var("DEFAULT_BUCKET") {
            self.default_bucket = bucket;
        }
        if let Some(value) = var("COMPRESSION_THRESHOLD") {
            self.compression_threshold = value
                .parse()
                .with_context(|| format!("Invalid MAILSTORE_COMPRESSION_THRESHOLD '{}'", value))?;
        }
        if let Some(value) = var("COMPRESSION_LEVEL") {
            self.compression_level = value
                .parse()
                .with_context(|| format!("Invalid MAILSTORE_COMPRESSION_LEVEL '{}'", value))?;
        }
        if let Some(value) = var("RETENTION_WEEKS") {
            self.retention_weeks = value
                .parse()
                .with_context(|| format!("Invalid MAILSTORE_RETENTION_WEEKS '{}'", value))?;
        }
        if let Some(value) = var("PAGE_SIZE") {
            self.page_size = value
                .parse()
                .with_context(|| format!("Invalid MAILSTORE_PAGE_SIZE '{}'", value))?;
        }
        Ok(())
    }

    /// Reject settings no store could run with
    pub fn validate(&self) -> Result<()> {
        self.default_bucket()
            .validate()
            .context("Invalid default_bucket")?;
        if self.default_bucket.starts_with(crate::bucket::UPLOAD_BUCKET_PREFIX) {
            anyhow::bail!(
                "default_bucket '{}' collides with upload bucket names",
                self.default_bucket
            );
        }
        if self.retention_weeks < 0 {
            anyhow::bail!("retention_weeks must not be negative");
        }
        if TimeDelta::try_weeks(self.retention_weeks).is_none() {
            anyhow::bail!("retention_weeks {} is out of range", self.retention_weeks);
        }
        if self.page_size == 0 {
            anyhow::bail!("page_size must be at least 1");
        }
        Ok(())
    }

    pub fn default_bucket(&self) -> BucketName {
        BucketName::new(self.default_bucket.clone())
    }

    pub fn codec(&self) -> BlobCodec {
        BlobCodec::new(self.compression_threshold, self.compression_level)
    }

    pub fn retention(&self) -> Duration {
        TimeDelta::try_weeks(self.retention_weeks).unwrap_or(TimeDelta::MAX)
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("metadata.sqlite")
    }
}
