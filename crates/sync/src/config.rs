// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Engine configuration.
//!
//! Stored as TOML, by default at `<state_dir>/config.toml`. Every field has a
//! default, so a missing file or a partial one is fine:
//!
//! ```toml
//! [api]
//! base_url = "https://api.example.com/v1"
//! device_id = "laptop-7f3a"
//!
//! [network]
//! settle_window_ms = 4000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use xs_core::{BackoffPolicy, CachePolicy};

const STATE_DIR_ENV: &str = "XSYNC_STATE_DIR";
const APP_DIR_NAME: &str = "xsync";
const CONFIG_FILE_NAME: &str = "config.toml";
const DB_FILE_NAME: &str = "sync.db";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Retry bookkeeping for queued items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Attempts before an item is dead-lettered (default: 5).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First retry delay in milliseconds (default: 2000).
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Upper bound on any retry delay in milliseconds (default: 30000).
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Random extra delay up to this many milliseconds (default: 250).
    #[serde(default = "default_backoff_jitter_ms")]
    pub backoff_jitter_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    2_000
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_backoff_jitter_ms() -> u64 {
    250
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            backoff_jitter_ms: default_backoff_jitter_ms(),
        }
    }
}

impl QueueConfig {
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.max_attempts,
            base: Duration::from_millis(self.backoff_base_ms),
            cap: Duration::from_millis(self.backoff_cap_ms),
            jitter: Duration::from_millis(self.backoff_jitter_ms),
        }
    }
}

/// Connectivity probing and debounce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// How long a connected state must hold before it is published (default: 3000).
    #[serde(default = "default_settle_window_ms")]
    pub settle_window_ms: u64,
    /// Time between probes (default: 1000).
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    /// A probe slower than this counts as offline (default: 2000).
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Latency at or under this is a good link (default: 150).
    #[serde(default = "default_good_latency_ms")]
    pub good_latency_ms: u64,
    /// Latency at or under this is a fair link; slower is degraded (default: 600).
    #[serde(default = "default_fair_latency_ms")]
    pub fair_latency_ms: u64,
    /// Path probed on the API host (default: "/health").
    #[serde(default = "default_probe_path")]
    pub probe_path: String,
}

fn default_settle_window_ms() -> u64 {
    3_000
}

fn default_probe_interval_ms() -> u64 {
    1_000
}

fn default_probe_timeout_ms() -> u64 {
    2_000
}

fn default_good_latency_ms() -> u64 {
    150
}

fn default_fair_latency_ms() -> u64 {
    600
}

fn default_probe_path() -> String {
    "/health".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            settle_window_ms: default_settle_window_ms(),
            probe_interval_ms: default_probe_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            good_latency_ms: default_good_latency_ms(),
            fair_latency_ms: default_fair_latency_ms(),
            probe_path: default_probe_path(),
        }
    }
}

impl NetworkConfig {
    pub fn settle_window(&self) -> Duration {
        Duration::from_millis(self.settle_window_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn good_latency(&self) -> Duration {
        Duration::from_millis(self.good_latency_ms)
    }

    pub fn fair_latency(&self) -> Duration {
        Duration::from_millis(self.fair_latency_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Bound on each remote call in seconds (default: 30).
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// Both sides editing a progress field within this many seconds is a
    /// conflict for the user to settle (default: 60).
    #[serde(default = "default_conflict_window_secs")]
    pub conflict_window_secs: u64,
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_conflict_window_secs() -> u64 {
    60
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            call_timeout_secs: default_call_timeout_secs(),
            conflict_window_secs: default_conflict_window_secs(),
        }
    }
}

impl SyncConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn conflict_window(&self) -> Duration {
        Duration::from_secs(self.conflict_window_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Completion of the newest year that triggers fetching the next (default: 0.75).
    #[serde(default = "default_refresh_threshold")]
    pub refresh_threshold: f64,
    /// On-disk budget for cached content in bytes (default: 256 MiB).
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
}

fn default_refresh_threshold() -> f64 {
    0.75
}

fn default_max_bytes() -> u64 {
    256 * 1024 * 1024
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            refresh_threshold: default_refresh_threshold(),
            max_bytes: default_max_bytes(),
        }
    }
}

impl CacheConfig {
    pub fn cache_policy(&self) -> CachePolicy {
        CachePolicy {
            refresh_threshold: self.refresh_threshold,
            max_bytes: self.max_bytes,
        }
    }
}

/// Remote Content/Sync API endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Identifies this installation to the server.
    #[serde(default)]
    pub device_id: String,
    #[serde(default = "default_content_path")]
    pub content_path: String,
    #[serde(default = "default_download_start_path")]
    pub download_start_path: String,
    #[serde(default = "default_download_status_path")]
    pub download_status_path: String,
    #[serde(default = "default_answers_path")]
    pub answers_path: String,
    #[serde(default = "default_analysis_path")]
    pub analysis_path: String,
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_content_path() -> String {
    "/content".to_string()
}

fn default_download_start_path() -> String {
    "/downloads/start".to_string()
}

fn default_download_status_path() -> String {
    "/downloads/status".to_string()
}

fn default_answers_path() -> String {
    "/answers".to_string()
}

fn default_analysis_path() -> String {
    "/analysis".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            base_url: default_base_url(),
            device_id: String::new(),
            content_path: default_content_path(),
            download_start_path: default_download_start_path(),
            download_status_path: default_download_status_path(),
            answers_path: default_answers_path(),
            analysis_path: default_analysis_path(),
        }
    }
}

impl ApiConfig {
    /// Join an endpoint path onto the base URL.
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

impl Config {
    /// Load config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Config::default()),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let config = Self::parse(&content)?;
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.queue.max_attempts < 1 {
            return invalid("queue.max_attempts must be at least 1".to_string());
        }
        if self.queue.backoff_base_ms > self.queue.backoff_cap_ms {
            return invalid(format!(
                "queue.backoff_base_ms ({}) exceeds queue.backoff_cap_ms ({})",
                self.queue.backoff_base_ms, self.queue.backoff_cap_ms
            ));
        }
        if !(self.cache.refresh_threshold > 0.0 && self.cache.refresh_threshold <= 1.0) {
            return invalid(format!(
                "cache.refresh_threshold must be in (0, 1], got {}",
                self.cache.refresh_threshold
            ));
        }
        if self.network.probe_interval_ms == 0 {
            return invalid("network.probe_interval_ms must be positive".to_string());
        }
        if self.network.good_latency_ms > self.network.fair_latency_ms {
            return invalid("network.good_latency_ms exceeds network.fair_latency_ms".to_string());
        }
        if !(self.api.base_url.starts_with("http://") || self.api.base_url.starts_with("https://"))
        {
            return invalid(format!(
                "api.base_url must be an http(s) URL, got '{}'",
                self.api.base_url
            ));
        }
        Ok(())
    }
}

/// Directory holding the store, config, log, and lock files.
///
/// `$XSYNC_STATE_DIR`, else the platform state dir, else `~/.local/state`.
pub fn default_state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(STATE_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    if let Some(dir) = dirs::state_dir() {
        return dir.join(APP_DIR_NAME);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".local")
        .join("state")
        .join(APP_DIR_NAME)
}

pub fn config_path(state_dir: &Path) -> PathBuf {
    state_dir.join(CONFIG_FILE_NAME)
}

pub fn db_path(state_dir: &Path) -> PathBuf {
    state_dir.join(DB_FILE_NAME)
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
