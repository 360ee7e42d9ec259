//! Configuration for the monitoring pipeline
//!
//! Loaded from TOML. Every field has a default, so an empty file is a valid
//! configuration. `NEOGUARD_*` environment variables override the file.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::channel::Backoff;
use crate::history::DEFAULT_HISTORY_CAPACITY;

const ENV_API_URL: &str = "NEOGUARD_API_URL";
const ENV_WS_URL: &str = "NEOGUARD_WS_URL";

/// Monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Backend base URL (default: http://localhost:8000)
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Event feed URL. Derived from `api_url` and `channel.path` when unset.
    #[serde(default)]
    pub ws_url: Option<String>,

    #[serde(default)]
    pub history: HistoryConfig,

    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub channel: ChannelConfig,

    #[serde(default)]
    pub alerts: AlertConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Readings kept per patient (default: 120)
    #[serde(default = "default_history_capacity")]
    pub capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Capture cadence in milliseconds (default: 333)
    #[serde(default = "default_capture_interval")]
    pub interval_ms: u64,

    /// Per-request timeout in milliseconds (default: 10000)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Consecutive failures before analysis is flagged degraded (default: 3)
    #[serde(default = "default_degraded_after")]
    pub degraded_after: u32,

    /// Only capture while the event channel is open (default: true)
    #[serde(default = "default_true")]
    pub require_channel: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Event feed path appended to the API URL (default: /ws/dashboard)
    #[serde(default = "default_channel_path")]
    pub path: String,

    /// Heartbeat cadence in milliseconds (default: 30000)
    #[serde(default = "default_heartbeat")]
    pub heartbeat_ms: u64,

    /// Handshake deadline in milliseconds (default: 10000)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Reconnect policy (default: fixed 3000ms)
    #[serde(default)]
    pub backoff: Backoff,

    /// Treat a missing pong as a transport failure. Disabled by default.
    #[serde(default)]
    pub pong_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Score at which an alert is raised (default: 4.0)
    #[serde(default = "default_moderate_threshold")]
    pub moderate_threshold: f64,

    /// Score at which an alert is urgent (default: 7.0)
    #[serde(default = "default_urgent_threshold")]
    pub urgent_threshold: f64,

    /// Per-patient suppression window in milliseconds (default: 5000)
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,

    /// Active alerts kept before the oldest is dropped (default: 10)
    #[serde(default = "default_max_active")]
    pub max_active: usize,
}

fn default_api_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_history_capacity() -> usize {
    DEFAULT_HISTORY_CAPACITY
}

fn default_capture_interval() -> u64 {
    333
}

fn default_request_timeout() -> u64 {
    10_000
}

fn default_degraded_after() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_channel_path() -> String {
    "/ws/dashboard".to_string()
}

fn default_heartbeat() -> u64 {
    30_000
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_moderate_threshold() -> f64 {
    4.0
}

fn default_urgent_threshold() -> f64 {
    7.0
}

fn default_debounce() -> u64 {
    5_000
}

fn default_max_active() -> usize {
    10
}

impl Config {
    /// Load configuration from file, or use defaults if no file exists
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(|p| p.to_path_buf()).or_else(|| {
            let home = dirs::home_dir()?;
            let default_path = home.join(".config/neoguard/monitor.toml");
            default_path.exists().then_some(default_path)
        });

        let Some(path) = config_path else {
            return Ok(Self::default());
        };

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        trace!("loaded config: {config:?}");
        Ok(config)
    }

    /// Apply `NEOGUARD_API_URL` / `NEOGUARD_WS_URL` overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var(ENV_API_URL) {
            self.api_url = url;
        }
        if let Ok(url) = std::env::var(ENV_WS_URL) {
            self.ws_url = Some(url);
        }
        self
    }

    /// Full event feed URL
    pub fn ws_endpoint(&self) -> String {
        if let Some(url) = &self.ws_url {
            return url.clone();
        }

        // Convert http:// to ws:// and https:// to wss://
        let base = self
            .api_url
            .trim_end_matches('/')
            .replace("http://", "ws://")
            .replace("https://", "wss://");

        format!("{}{}", base, self.channel.path)
    }
}

impl CaptureConfig {
    /// Never zero
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl ChannelConfig {
    /// Never zero
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn pong_timeout(&self) -> Option<Duration> {
        self.pong_timeout_ms.map(Duration::from_millis)
    }
}

impl AlertConfig {
    pub fn debounce(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.debounce_ms as i64)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            ws_url: None,
            history: HistoryConfig::default(),
            capture: CaptureConfig::default(),
            channel: ChannelConfig::default(),
            alerts: AlertConfig::default(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: default_history_capacity(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_capture_interval(),
            request_timeout_ms: default_request_timeout(),
            degraded_after: default_degraded_after(),
            require_channel: true,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            path: default_channel_path(),
            heartbeat_ms: default_heartbeat(),
            connect_timeout_ms: default_connect_timeout(),
            backoff: Backoff::default(),
            pong_timeout_ms: None,
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            moderate_threshold: default_moderate_threshold(),
            urgent_threshold: default_urgent_threshold(),
            debounce_ms: default_debounce(),
            max_active: default_max_active(),
        }
    }
}
