use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::error::Error;

pub const ENV_BUCKET: &str = "KEYBUCKET_BUCKET";
pub const ENV_REGION: &str = "KEYBUCKET_REGION";
pub const ENV_ENDPOINT: &str = "KEYBUCKET_ENDPOINT";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Where keys are published.  Credentials are not configured here; the
/// object store client picks them up from its own environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    /// S3-compatible endpoint (MinIO, R2, ...).  `None` means AWS.
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl StoreConfig {
    pub fn bucket_name(&self) -> Result<&str, Error> {
        self.bucket
            .as_deref()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| {
                Error::Config(format!(
                    "no bucket configured (set store.bucket, {ENV_BUCKET} or --bucket)"
                ))
            })
    }

    pub fn region_name(&self) -> Result<&str, Error> {
        self.region
            .as_deref()
            .filter(|r| !r.is_empty())
            .ok_or_else(|| {
                Error::Config(format!(
                    "no region configured (set store.region, {ENV_REGION} or --region)"
                ))
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysConfig {
    #[serde(default = "default_validity_hours")]
    pub validity_hours: u64,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            validity_hours: default_validity_hours(),
        }
    }
}

impl KeysConfig {
    pub fn validity(&self) -> TimeDelta {
        let hours = i64::try_from(self.validity_hours).unwrap_or(i64::MAX);
        TimeDelta::try_hours(hours).unwrap_or(TimeDelta::MAX)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Maximum number of concurrent downloads.  Values below 1 are treated as 1.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Per-download deadline.  Values below 1 are treated as 1.
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
    /// Skip objects whose name says they have already expired.
    #[serde(default = "default_skip_expired")]
    pub skip_expired: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            download_timeout_secs: default_download_timeout_secs(),
            skip_expired: default_skip_expired(),
        }
    }
}

impl PipelineConfig {
    pub fn worker_count(&self) -> usize {
        self.workers.max(1)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs.max(1))
    }
}

impl Config {
    /// Load `path`, or defaults if it does not exist.
    pub fn load(path: &Path) -> Result<Self, Error> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
        toml::from_str(&raw).map_err(|e| Error::Config(format!("parse {}: {e}", path.display())))
    }

    /// Apply `KEYBUCKET_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply `KEYBUCKET_*` overrides using `lookup` to read variables.
    /// Empty values are ignored.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        if let Some(bucket) = get(ENV_BUCKET) {
            self.store.bucket = Some(bucket);
        }
        if let Some(region) = get(ENV_REGION) {
            self.store.region = Some(region);
        }
        if let Some(endpoint) = get(ENV_ENDPOINT) {
            self.store.endpoint = Some(endpoint);
        }
    }
}

pub fn default_config_path() -> PathBuf {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("keybucket").join("config.toml")
}

fn default_validity_hours() -> u64 {
    6
}

fn default_workers() -> usize {
    2
}

fn default_download_timeout_secs() -> u64 {
    10
}

fn default_skip_expired() -> bool {
    true
}
