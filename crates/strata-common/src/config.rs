//! Configuration types for Strata
//!
//! Every key has a default, so an empty or missing file yields a working
//! configuration. Values are layered: defaults, then the TOML file, then
//! `STRATA__SECTION__KEY` environment variables.

use crate::error::{Error, Result};
use crate::timestamp::DEFAULT_SUBDIVISIONS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "STRATA";

/// Root configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node state and persistence
    pub node: NodeConfig,
    /// Bucket cache sizing and commit queue aging
    pub cache: CacheConfig,
    /// Pull request behaviour
    pub request: RequestConfig,
    /// Logical clock
    pub timestamp: TimestampConfig,
    /// Bucket layout
    pub buckets: BucketsConfig,
    /// Storage node HTTP surface
    pub server: ServerConfig,
    /// Logging
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from an optional TOML file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("buckets.no_cache"),
        );

        let built = builder
            .build()
            .map_err(|e| Error::Configuration(format!("failed to read configuration: {e}")))?;

        built
            .try_deserialize()
            .map_err(|e| Error::Configuration(format!("invalid configuration: {e}")))
    }

    /// Render the default configuration as TOML
    pub fn default_toml() -> Result<String> {
        toml::to_string_pretty(&Self::default())
            .map_err(|e| Error::Serialization(format!("failed to render configuration: {e}")))
    }

    /// Write the default configuration to `path`, creating parent directories
    pub fn write_default(path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| {
                Error::Configuration(format!("couldn't create config directory: {e}"))
            })?;
        }

        std::fs::write(path, Self::default_toml()?)
            .map_err(|e| Error::Configuration(format!("couldn't write configuration file: {e}")))
    }

    /// Location of the queue snapshot
    #[must_use]
    pub fn snapshot_path(&self) -> PathBuf {
        self.node.data_dir.join("queue.bin")
    }
}

/// Node state configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Directory for the queue snapshot
    pub data_dir: PathBuf,
    /// How often the queue snapshot is rewritten
    pub snapshot_interval_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./strata-data"),
            snapshot_interval_ms: 60 * 1000,
        }
    }
}

impl NodeConfig {
    #[must_use]
    pub const fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }
}

/// Bucket cache configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Upper bound on the bytes of cached files
    pub max_bucket_cache_size: u64,
    /// Grace window before a committed queue item is retired
    pub max_commit_queue_time_ms: u64,
    /// How often the eviction/retirement sweep runs on its own
    pub sweep_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bucket_cache_size: 8 * 1024 * 1024 * 1024, // 8 GiB
            max_commit_queue_time_ms: 60 * 60 * 1000,      // 1 hour
            sweep_interval_ms: 60 * 1000,
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Pull request configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// A request with no byte progress for this long is marked not found
    pub timeout_ms: u64,
    /// State check interval of the per-request task
    pub poll_interval_ms: u64,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10 * 1000,
            poll_interval_ms: 50,
        }
    }
}

impl RequestConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Logical clock configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimestampConfig {
    /// Ticks per millisecond
    pub subdivisions: u64,
}

impl Default for TimestampConfig {
    fn default() -> Self {
        Self {
            subdivisions: DEFAULT_SUBDIVISIONS,
        }
    }
}

/// Bucket layout configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketsConfig {
    /// Directory holding one subdirectory per bucket
    pub root: PathBuf,
    /// Buckets that are stored locally only and never cached or queued
    pub no_cache: Vec<String>,
}

impl Default for BucketsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./strata-data/buckets"),
            no_cache: vec!["identity".to_string()],
        }
    }
}

/// Storage node HTTP surface configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub listen: String,
    /// Shared bearer secret for storage nodes; unset refuses all queue calls
    pub storage_node_secret: Option<String>,
    /// Where `GET /` redirects to
    pub default_redirect: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            storage_node_secret: None,
            default_redirect: "https://example.com".to_string(),
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
