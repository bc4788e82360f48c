//! # Configuration Management Module
//!
//! Centralized, TOML-backed configuration for meshdock. Every section tolerates being
//! omitted from the file and falls back to the defaults below.
//!
//! ## Configuration Structure
//!
//! - [`ProbeConfig`] - how the `meshtastic` CLI is invoked (command, timeout, retries)
//! - [`DiscoveryConfig`] - serial enumeration and BLE scan window
//! - [`StoreConfig`] - where the active device record and rollback snapshots live
//! - [`CommitConfig`] - commit policy (how fresh a validation must be)
//! - [`CacheConfig`] - telemetry cache freshness and the optional Redis backend
//! - [`LoggingConfig`] - log level, log file and audit trail file
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshdock::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     println!("Probe command: {}", config.probe.command);
//!     Config::create_default("config.toml").await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [probe]
//! command = "meshtastic"
//! timeout_seconds = 15
//! max_retries = 2
//!
//! [discovery]
//! ble_scan_seconds = 10
//!
//! [store]
//! backend = "sled"
//! data_dir = "./data"
//!
//! [cache]
//! # redis_url = "redis://127.0.0.1/"
//! freshness_seconds = 8
//! ```
//!
//! ## Environment Integration
//!
//! `REDIS_URL` fills `cache.redis_url` when the file leaves it unset. CLI flags override
//! both: CLI args > Environment > Config file > Defaults.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub commit: CommitConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Executable used for every device probe.
    pub command: String,
    /// Invocation tried when `command` is not on PATH, e.g. `["python3", "-m", "meshtastic"]`.
    /// An empty list disables the fallback.
    pub fallback_command: Vec<String>,
    /// Per-attempt timeout.
    pub timeout_seconds: u64,
    /// Extra attempts after a timeout or transient I/O failure.
    pub max_retries: u32,
    /// Pause between attempts (ms).
    pub retry_delay_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            command: "meshtastic".to_string(),
            fallback_command: vec![
                "python3".to_string(),
                "-m".to_string(),
                "meshtastic".to_string(),
            ],
            timeout_seconds: 15,
            max_retries: 2,
            retry_delay_ms: 1000,
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub serial_enabled: bool,
    pub ble_enabled: bool,
    /// Upper bound for one BLE scan.
    pub ble_scan_seconds: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            serial_enabled: true,
            ble_enabled: true,
            ble_scan_seconds: 10,
        }
    }
}

/// Which record store backs the active device and its rollback snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Sled,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub data_dir: String,
    /// Rollback snapshots kept in the arena; oldest are pruned first.
    pub max_snapshots: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sled,
            data_dir: "./data".to_string(),
            max_snapshots: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitConfig {
    /// A reachable validation older than this no longer authorizes a commit.
    pub validation_max_age_seconds: u64,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            validation_max_age_seconds: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
    /// Budget for the startup PING against `redis_url`.
    pub probe_timeout_ms: u64,
    /// Entries younger than this are served without refetching.
    pub freshness_seconds: u64,
    /// How long a stale entry is kept around as a fallback for failed refetches.
    pub stale_retention_seconds: u64,
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            probe_timeout_ms: 500,
            freshness_seconds: 8,
            stale_retention_seconds: 120,
            key_prefix: "meshdock:".to_string(),
        }
    }
}

impl CacheConfig {
    pub fn freshness(&self) -> Duration {
        Duration::from_secs(self.freshness_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
    /// Receives records logged with `target: "audit"` (commit and undo trail).
    #[serde(default)]
    pub audit_file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some("meshdock.log".to_string()),
            audit_file: Some("meshdock-audit.log".to_string()),
        }
    }
}

impl Config {
    /// Load configuration from a file, apply environment overrides and validate.
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let mut config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Fill `cache.redis_url` from `REDIS_URL` when the file does not set it.
    pub fn apply_env(&mut self) {
        if self.cache.redis_url.is_none() {
            if let Ok(url) = std::env::var("REDIS_URL") {
                if !url.trim().is_empty() {
                    self.cache.redis_url = Some(url);
                }
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.probe.command.trim().is_empty() {
            return Err(anyhow!("probe.command must not be empty"));
        }
        if self.probe.timeout_seconds == 0 {
            return Err(anyhow!("probe.timeout_seconds must be > 0"));
        }
        if self.discovery.ble_enabled && self.discovery.ble_scan_seconds == 0 {
            return Err(anyhow!("discovery.ble_scan_seconds must be > 0 when BLE is enabled"));
        }
        if self.cache.freshness_seconds == 0 {
            return Err(anyhow!("cache.freshness_seconds must be > 0"));
        }
        if self.cache.stale_retention_seconds < self.cache.freshness_seconds {
            return Err(anyhow!(
                "cache.stale_retention_seconds ({}) must be >= cache.freshness_seconds ({})",
                self.cache.stale_retention_seconds,
                self.cache.freshness_seconds
            ));
        }
        if self.store.max_snapshots == 0 {
            return Err(anyhow!("store.max_snapshots must be > 0"));
        }
        Ok(())
    }
}
