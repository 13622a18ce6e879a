//! Broker configuration
//!
//! Loaded from `~/.config/meridian/broker.json`; every field has a default so
//! a missing or partial file is fine. `MERIDIAN_LISTEN` and
//! `MERIDIAN_DATA_DIR` override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};

/// Config filename in the meridian config directory
pub const CONFIG_FILE: &str = "broker.json";

/// Resource manifest filename in the meridian config directory
pub const MANIFEST_FILE: &str = "resources.json";

const LISTEN_ENV: &str = "MERIDIAN_LISTEN";
const DATA_DIR_ENV: &str = "MERIDIAN_DATA_DIR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Address the protocol listener binds to
    pub listen: String,
    /// Root for the database, part files and search index; defaults to the
    /// platform data directory
    pub data_dir: Option<PathBuf>,
    pub storage: StorageConfig,
    pub scheduler: SchedulerConfig,
    pub cache: CacheConfig,
    pub search: SearchConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:4190".to_string(),
            data_dir: None,
            storage: StorageConfig::default(),
            scheduler: SchedulerConfig::default(),
            cache: CacheConfig::default(),
            search: SearchConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file, relative to the data directory
    pub database: String,
    /// External part directory, relative to the data directory
    pub parts_dir: String,
    pub pool_size: usize,
    pub busy_timeout_ms: u64,
    /// How long a checkout waits for a free connection
    pub checkout_timeout_ms: u64,
    /// Parts larger than this many bytes are stored as files
    pub external_threshold: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: "meridian.sqlite".to_string(),
            parts_dir: "parts".to_string(),
            pool_size: 8,
            busy_timeout_ms: 5_000,
            checkout_timeout_ms: 30_000,
            external_threshold: 32 * 1024,
        }
    }
}

impl StorageConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn checkout_timeout(&self) -> Duration {
        Duration::from_millis(self.checkout_timeout_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often the watchdog checks running tasks
    pub heartbeat_interval_secs: u64,
    /// Missed heartbeats before a running task is failed
    pub missed_heartbeats: u32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    /// Failed attempts before a task is dropped
    pub max_retries: u32,
    /// How long a FETCH waits for an adapter to deliver missing payload
    pub adapter_timeout_secs: u64,
    /// Minimum gap between on-demand syncs of one collection
    pub sync_cooldown_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            missed_heartbeats: 3,
            backoff_base_secs: 5,
            backoff_max_secs: 600,
            max_retries: 5,
            adapter_timeout_secs: 60,
            sync_cooldown_secs: 60,
        }
    }
}

impl SchedulerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_secs(self.adapter_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Timetable granularity of the sweep and interval checks
    pub granularity_minutes: u32,
    /// Floor applied to every collection's check interval
    pub minimum_interval_minutes: u32,
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            granularity_minutes: 1,
            minimum_interval_minutes: 5,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Index directory, relative to the data directory
    pub index_dir: String,
    /// Debounce before persistent searches are refreshed after changes
    pub update_delay_ms: u64,
    pub result_limit: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            index_dir: "search".to_string(),
            update_delay_ms: 1_000,
            result_limit: 10_000,
        }
    }
}

impl BrokerConfig {
    /// Load from the config directory, then apply environment overrides
    pub fn load() -> Result<Self> {
        let mut config: BrokerConfig =
            ::config::load_json_or_default(CONFIG_FILE).context("Failed to load broker config")?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load a specific file, then apply environment overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut config: BrokerConfig = ::config::load_json_file(path)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(listen) = var(LISTEN_ENV).filter(|v| !v.is_empty()) {
            info!("Listen address overridden by {}", LISTEN_ENV);
            self.listen = listen;
        }
        if let Some(dir) = var(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
            info!("Data directory overridden by {}", DATA_DIR_ENV);
            self.data_dir = Some(PathBuf::from(dir));
        }
    }

    /// Broker config rooted at `dir`, for tests and embedding
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: Some(dir.as_ref().to_path_buf()),
            ..Default::default()
        }
    }

    /// Resolved data directory
    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => ::config::ensure_data_dir(),
        }
    }
}

/// One adapter entry of the resource manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceEntry {
    pub name: String,
    #[serde(default)]
    pub mime_types: Vec<String>,
    #[serde(default = "default_online")]
    pub online: bool,
}

fn default_online() -> bool {
    true
}

/// Adapters known to the broker; they connect over the protocol and claim
/// their entry with `RESOURCE-REGISTER`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceManifest {
    #[serde(default)]
    pub resources: Vec<ResourceEntry>,
}

impl ResourceManifest {
    pub fn load() -> Result<Self> {
        ::config::load_json_or_default(MANIFEST_FILE).context("Failed to load resource manifest")
    }

    pub fn get(&self, name: &str) -> Option<&ResourceEntry> {
        self.resources.iter().find(|r| r.name == name)
    }
}
