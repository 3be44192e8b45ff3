//! Configuration surface.
//!
//! Options are loaded in order (later sources win): built-in defaults,
//! the first `spyglass.toml` found in the discovery chain
//! (`$XDG_CONFIG_HOME/spyglass`, `$HOME/.config/spyglass`,
//! `/etc/spyglass`), and `SPYGLASS_`-prefixed environment variables.

use crate::error::{Error, Result};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default rows per partition before sealing.
pub const DEFAULT_PARTITION_CAPACITY: u64 = 1 << 20;

/// Default LRU capacity for loaded passive partitions.
pub const DEFAULT_MAX_INMEM_PARTITIONS: usize = 10;

/// Default initial query batch size.
pub const DEFAULT_TASTE_PARTITIONS: usize = 5;

/// Default query worker pool size.
pub const DEFAULT_NUM_WORKERS: usize = 4;

/// Default reader timeout between batches, in milliseconds.
pub const DEFAULT_BATCH_TIMEOUT_MS: u64 = 10_000;

/// Default telemetry reporting interval, in milliseconds.
pub const DEFAULT_TELEMETRY_INTERVAL_MS: u64 = 10_000;

/// System-wide fallback configuration directory.
pub const SYSCONF_DIR: &str = "/etc/spyglass";

pub const CONFIG_FILE: &str = "spyglass.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Database directory holding the ID block, the index descriptor,
    /// and all partitions.
    pub db_dir: Option<PathBuf>,
    pub import: ImportConfig,
    pub index: IndexOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ImportConfig {
    /// Cap on events a reader produces; zero means unlimited.
    pub max_events: u64,
    /// Reader timeout between batches, in milliseconds.
    pub batch_timeout_ms: u64,
    /// Telemetry reporting interval, in milliseconds.
    pub telemetry_interval_ms: u64,
}

impl Default for ImportConfig {
    fn default() -> Self {
        ImportConfig {
            max_events: 0,
            batch_timeout_ms: DEFAULT_BATCH_TIMEOUT_MS,
            telemetry_interval_ms: DEFAULT_TELEMETRY_INTERVAL_MS,
        }
    }
}

impl ImportConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_millis(self.telemetry_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct IndexOptions {
    /// Rows per partition before sealing.
    pub partition_capacity: u64,
    /// LRU capacity for loaded passive partitions.
    pub max_inmem_partitions: usize,
    /// Initial query batch size.
    pub taste_partitions: usize,
    /// Query worker pool size.
    pub num_workers: usize,
    /// Suppress periodic descriptor flushes.
    pub delay_flush_until_shutdown: bool,
}

impl Default for IndexOptions {
    fn default() -> Self {
        IndexOptions {
            partition_capacity: DEFAULT_PARTITION_CAPACITY,
            max_inmem_partitions: DEFAULT_MAX_INMEM_PARTITIONS,
            taste_partitions: DEFAULT_TASTE_PARTITIONS,
            num_workers: DEFAULT_NUM_WORKERS,
            delay_flush_until_shutdown: false,
        }
    }
}

impl Config {
    /// Loads configuration from the discovery chain and environment.
    pub fn load() -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = discover_config_file() {
            tracing::debug!(file = %path.display(), "loading configuration file");
            figment = figment.merge(Toml::file(path));
        }
        figment
            .merge(Env::prefixed("SPYGLASS_").split("__"))
            .extract()
            .map_err(|e| Error::Parse(format!("configuration: {}", e)))
    }

    /// Loads from an explicit file, still honoring the environment.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("SPYGLASS_").split("__"))
            .extract()
            .map_err(|e| Error::Parse(format!("configuration: {}", e)))
    }

    pub fn db_dir(&self) -> PathBuf {
        self.db_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("spyglass.db"))
    }
}

/// Walks the discovery chain and returns the first existing config file.
fn discover_config_file() -> Option<PathBuf> {
    let mut candidates = Vec::new();
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        candidates.push(PathBuf::from(xdg).join("spyglass").join(CONFIG_FILE));
    }
    if let Ok(home) = std::env::var("HOME") {
        candidates.push(
            PathBuf::from(home)
                .join(".config")
                .join("spyglass")
                .join(CONFIG_FILE),
        );
    }
    candidates.push(PathBuf::from(SYSCONF_DIR).join(CONFIG_FILE));
    candidates.into_iter().find(|path| path.exists())
}
