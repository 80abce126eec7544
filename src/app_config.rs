//! Application configuration.
//!
//! Settings come from a TOML file with CLI overrides on top. Credentials
//! are taken from the config file or the conventional `AWS_*` environment
//! variables and never logged.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytesize::ByteSize;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use objfs::cache::ExpiryMode;

/// A `PathBuf` that expands `~` during deserialization, so every path
/// loaded from configuration is already resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ExpandedPathBuf(PathBuf);

impl<'de> Deserialize<'de> for ExpandedPathBuf {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        let expanded = shellexpand::tilde(&raw);
        Ok(Self(PathBuf::from(expanded.into_owned())))
    }
}

impl ExpandedPathBuf {
    /// Wrap an already-resolved path.
    pub fn new(path: PathBuf) -> Self {
        Self(path)
    }
}

impl std::ops::Deref for ExpandedPathBuf {
    type Target = Path;

    fn deref(&self) -> &Path {
        &self.0
    }
}

impl AsRef<Path> for ExpandedPathBuf {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl std::fmt::Display for ExpandedPathBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.display().fmt(f)
    }
}

fn runtime_dir() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::cache_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("bucketfs")
}

fn default_staging_dir() -> ExpandedPathBuf {
    ExpandedPathBuf::new(runtime_dir().join("staging"))
}

fn default_part_size() -> ByteSize {
    ByteSize::mib(10)
}

fn default_multipart_threshold() -> ByteSize {
    ByteSize::mib(20)
}

fn default_pool_width() -> usize {
    20
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_stat_cache_size() -> usize {
    100_000
}

fn default_stat_cache_expire() -> u64 {
    15 * 60
}

fn default_http_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_region() -> String {
    "us-east-1".to_owned()
}

/// How the stat cache measures entry age.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExpiryModeConfig {
    /// Expire a fixed interval after insertion.
    #[default]
    Fixed,
    /// Every cache hit restarts the clock.
    Sliding,
}

impl From<ExpiryModeConfig> for ExpiryMode {
    fn from(mode: ExpiryModeConfig) -> Self {
        match mode {
            ExpiryModeConfig::Fixed => ExpiryMode::Fixed,
            ExpiryModeConfig::Sliding => ExpiryMode::Sliding,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("{0}")]
    Invalid(String),
}

/// The full configuration, one TOML document.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct AppConfig {
    /// Bucket to mount.
    pub bucket: String,

    /// Endpoint, scheme included (e.g. `https://s3.eu-central-1.amazonaws.com`).
    pub endpoint: String,

    #[serde(default = "default_region")]
    pub region: String,

    /// Where the filesystem is mounted.
    pub mount_point: ExpandedPathBuf,

    /// Directory for per-open-file staging files.
    #[serde(default = "default_staging_dir")]
    pub staging_dir: ExpandedPathBuf,

    /// Access key id; falls back to `AWS_ACCESS_KEY_ID`.
    #[serde(default)]
    pub access_key_id: Option<String>,

    /// Secret key; falls back to `AWS_SECRET_ACCESS_KEY`.
    #[serde(default)]
    pub secret_access_key: Option<SecretString>,

    /// STS session token; falls back to `AWS_SESSION_TOKEN`.
    #[serde(default)]
    pub session_token: Option<SecretString>,

    /// Multipart part size / fetch granularity. Floor 5 MiB.
    #[serde(default = "default_part_size")]
    pub part_size: ByteSize,

    /// File size above which flush switches to multipart upload.
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold: ByteSize,

    /// Concurrent store requests.
    #[serde(default = "default_pool_width")]
    pub pool_width: usize,

    /// Attempts per request (first try included).
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Maximum unpinned stat-cache entries.
    #[serde(default = "default_stat_cache_size")]
    pub stat_cache_size: usize,

    /// Stat-cache entry lifetime in seconds; 0 disables expiry.
    #[serde(default = "default_stat_cache_expire")]
    pub stat_cache_expire_secs: u64,

    #[serde(default)]
    pub stat_cache_expiry_mode: ExpiryModeConfig,

    /// Whether confirmed 404s are cached.
    #[serde(default = "default_true")]
    pub negative_cache: bool,

    /// Per-request HTTP timeout in seconds.
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
}

impl AppConfig {
    /// Parse the config file and absorb environment credentials. Callers
    /// layer CLI overrides on top and then run [`validate`](Self::validate).
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        let mut config: AppConfig = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;
        config.absorb_env();
        debug!(bucket = %config.bucket, endpoint = %config.endpoint, "configuration loaded");
        Ok(config)
    }

    /// Apply `-o key=value` mount options over the file configuration.
    /// Each argument may carry several comma-separated options
    /// (`-o part-size=10MiB,pool-width=8`); keys mirror the config file
    /// fields.
    pub fn apply_mount_options(&mut self, options: &[String]) -> Result<(), ConfigError> {
        for group in options {
            for option in group.split(',').filter(|s| !s.is_empty()) {
                self.apply_override(option)?;
            }
        }
        Ok(())
    }

    fn apply_override(&mut self, option: &str) -> Result<(), ConfigError> {
        let (key, value) = option.split_once('=').ok_or_else(|| {
            ConfigError::Invalid(format!("mount option `{option}` is not of the form key=value"))
        })?;
        fn bad(key: &str, value: &str) -> ConfigError {
            ConfigError::Invalid(format!("mount option `{key}`: cannot parse `{value}`"))
        }
        let expanded = || ExpandedPathBuf::new(PathBuf::from(shellexpand::tilde(value).into_owned()));
        match key {
            "bucket" => self.bucket = value.to_owned(),
            "endpoint" => self.endpoint = value.to_owned(),
            "region" => self.region = value.to_owned(),
            "mount-point" => self.mount_point = expanded(),
            "staging-dir" => self.staging_dir = expanded(),
            "part-size" => {
                self.part_size = value.parse::<ByteSize>().map_err(|_| bad(key, value))?;
            }
            "multipart-threshold" => {
                self.multipart_threshold = value.parse::<ByteSize>().map_err(|_| bad(key, value))?;
            }
            "pool-width" => self.pool_width = value.parse().map_err(|_| bad(key, value))?,
            "retry-attempts" => {
                self.retry_attempts = value.parse().map_err(|_| bad(key, value))?;
            }
            "stat-cache-size" => {
                self.stat_cache_size = value.parse().map_err(|_| bad(key, value))?;
            }
            "stat-cache-expire-secs" => {
                self.stat_cache_expire_secs = value.parse().map_err(|_| bad(key, value))?;
            }
            "stat-cache-expiry-mode" => {
                self.stat_cache_expiry_mode = match value {
                    "fixed" => ExpiryModeConfig::Fixed,
                    "sliding" => ExpiryModeConfig::Sliding,
                    _ => return Err(bad(key, value)),
                };
            }
            "negative-cache" => {
                self.negative_cache = value.parse().map_err(|_| bad(key, value))?;
            }
            "http-timeout-secs" => {
                self.http_timeout_secs = value.parse().map_err(|_| bad(key, value))?;
            }
            _ => {
                return Err(ConfigError::Invalid(format!(
                    "unknown mount option `{key}`"
                )));
            }
        }
        Ok(())
    }

    /// Fill missing credentials from the conventional environment variables.
    fn absorb_env(&mut self) {
        if self.access_key_id.is_none()
            && let Ok(v) = std::env::var("AWS_ACCESS_KEY_ID")
        {
            self.access_key_id = Some(v);
        }
        if self.secret_access_key.is_none()
            && let Ok(v) = std::env::var("AWS_SECRET_ACCESS_KEY")
        {
            self.secret_access_key = Some(SecretString::from(v));
        }
        if self.session_token.is_none()
            && let Ok(v) = std::env::var("AWS_SESSION_TOKEN")
        {
            self.session_token = Some(SecretString::from(v));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket.is_empty() {
            return Err(ConfigError::Invalid("bucket must not be empty".into()));
        }
        if !self.endpoint.starts_with("http://") && !self.endpoint.starts_with("https://") {
            return Err(ConfigError::Invalid(format!(
                "endpoint must include a scheme: {}",
                self.endpoint
            )));
        }
        if self.part_size < ByteSize::mib(5) {
            return Err(ConfigError::Invalid(format!(
                "part-size {} is below the 5 MiB protocol minimum",
                self.part_size
            )));
        }
        if self.pool_width == 0 {
            return Err(ConfigError::Invalid("pool-width must be at least 1".into()));
        }
        if self.retry_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry-attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn stat_cache_expire(&self) -> Option<Duration> {
        (self.stat_cache_expire_secs > 0).then(|| Duration::from_secs(self.stat_cache_expire_secs))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}
