//! Application configuration.

use crate::error::{AppError, AppResult};
use crate::event::Severity;
use serde::{Deserialize, Serialize};
use siem_ws::ChannelOptions;
use std::time::Duration;

/// Event channel tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Reconnect attempts after an abnormal close. Default: 5.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First reconnect delay (ms); doubles per attempt. Default: 1000.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Inbound silence before a ping (ms). 0 disables heartbeats. Default: 30000.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Unanswered ping limit (ms). Default: 10000.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    /// Closing handshake bound (ms). Default: 5000.
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    10_000
}

fn default_close_timeout_ms() -> u64 {
    5_000
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            close_timeout_ms: default_close_timeout_ms(),
        }
    }
}

impl From<&ChannelConfig> for ChannelOptions {
    fn from(config: &ChannelConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            heartbeat_interval: (config.heartbeat_interval_ms > 0)
                .then(|| Duration::from_millis(config.heartbeat_interval_ms)),
            heartbeat_timeout: Duration::from_millis(config.heartbeat_timeout_ms),
            close_timeout: Duration::from_millis(config.close_timeout_ms),
        }
    }
}

/// What to do once the channel reports `RetriesExhausted`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartConfig {
    /// Reconnect from scratch after exhaustion. Default: false (exit).
    #[serde(default)]
    pub enabled: bool,
    /// Pause before the restart (ms). Default: 30000.
    #[serde(default = "default_restart_delay_ms")]
    pub delay_ms: u64,
    /// Restart limit. 0 = unlimited. Default: 0.
    #[serde(default)]
    pub max_restarts: u32,
}

fn default_restart_delay_ms() -> u64 {
    30_000
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            delay_ms: default_restart_delay_ms(),
            max_restarts: 0,
        }
    }
}

impl RestartConfig {
    /// Whether another restart is allowed after `performed` restarts.
    pub fn allows(&self, performed: u32) -> bool {
        self.enabled && (self.max_restarts == 0 || performed < self.max_restarts)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Event handling options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Alerts below this severity are logged at debug only. Default: low.
    #[serde(default = "default_min_severity")]
    pub min_severity: Severity,
    /// Interval between periodic summaries (ms). 0 disables. Default: 60000.
    #[serde(default = "default_summary_interval_ms")]
    pub summary_interval_ms: u64,
}

fn default_min_severity() -> Severity {
    Severity::Low
}

fn default_summary_interval_ms() -> u64 {
    60_000
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            min_severity: default_min_severity(),
            summary_interval_ms: default_summary_interval_ms(),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Stream endpoint (ws:// or wss://).
    pub ws_url: String,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub restart: RestartConfig,
    #[serde(default)]
    pub stream: StreamConfig,
}

impl AppConfig {
    /// Configuration with defaults for everything except the endpoint.
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            channel: ChannelConfig::default(),
            restart: RestartConfig::default(),
            stream: StreamConfig::default(),
        }
    }

    /// Load from a specific file.
    pub fn from_file(path: &str) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;

        Self::from_toml(&content)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> AppResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if !(self.ws_url.starts_with("ws://") || self.ws_url.starts_with("wss://")) {
            return Err(AppError::Config(format!(
                "ws_url must start with ws:// or wss://, got {:?}",
                self.ws_url
            )));
        }
        if self.channel.heartbeat_interval_ms > 0 && self.channel.heartbeat_timeout_ms == 0 {
            return Err(AppError::Config(
                "heartbeat_timeout_ms must be > 0 when heartbeats are enabled".to_string(),
            ));
        }
        Ok(())
    }

    pub fn summary_interval(&self) -> Option<Duration> {
        (self.stream.summary_interval_ms > 0)
            .then(|| Duration::from_millis(self.stream.summary_interval_ms))
    }
}
