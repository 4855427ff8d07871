//! Application configuration
//!
//! Loaded from a TOML file in the platform config directory. Every section
//! has defaults, so a missing or partial file is fine.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub buffer: BufferConfig,
    pub reconnect: ReconnectConfig,
    pub stream: StreamConfig,
    pub output: OutputConfig,
    pub ui: UiConfig,
    /// Last session requested through any control surface
    pub last_session: Option<SavedSession>,
}

/// Chunk buffer sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Hard capacity in chunks
    pub capacity: usize,
    /// Queue length at which the whole backlog is discarded
    pub backlog_threshold: usize,
    /// Feed poll timeout in milliseconds
    pub poll_interval_ms: u64,
    /// Minimum spacing between backlog warnings in milliseconds
    pub backlog_log_window_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
            backlog_threshold: DEFAULT_BACKLOG_THRESHOLD,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            backlog_log_window_ms: BACKLOG_LOG_WINDOW_MS,
        }
    }
}

impl BufferConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn backlog_log_window(&self) -> Duration {
        Duration::from_millis(self.backlog_log_window_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::Config("buffer.capacity must be positive".into()));
        }
        if self.backlog_threshold == 0 || self.backlog_threshold >= self.capacity {
            return Err(Error::Config(format!(
                "buffer.backlog_threshold must be in 1..{} (got {})",
                self.capacity, self.backlog_threshold
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Config("buffer.poll_interval_ms must be positive".into()));
        }
        Ok(())
    }
}

/// Reconnect backoff policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub step_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Reconnects attempted before giving up
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BACKOFF_BASE_MS,
            step_delay_ms: DEFAULT_BACKOFF_STEP_MS,
            max_delay_ms: DEFAULT_BACKOFF_CAP_MS,
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl ReconnectConfig {
    /// Delay before the reconnect that follows `retries` earlier reconnects
    pub fn delay_for(&self, retries: u32) -> Duration {
        let ms = self
            .base_delay_ms
            .saturating_add(self.step_delay_ms.saturating_mul(retries as u64))
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Stream endpoint layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Path appended to the endpoint for direct connections
    pub path: String,
    /// Format marker sent to the server
    pub format: String,
    /// Connect through a relay instead of the endpoint itself
    pub relay: Option<RelayConfig>,
    /// Handshake deadline in milliseconds
    pub connect_timeout_ms: u64,
    /// Longest silence tolerated on an open stream, in milliseconds
    pub idle_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_STREAM_PATH.to_string(),
            format: DEFAULT_STREAM_FORMAT.to_string(),
            relay: None,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
        }
    }
}

impl StreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Relay base URL; the endpoint is used when empty
    #[serde(default)]
    pub base: String,
    pub session_code: String,
}

/// Where the received stream goes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub kind: OutputKind,
    /// Target file for [`OutputKind::File`]
    pub path: Option<PathBuf>,
    /// Output device name for [`OutputKind::Device`]; default device when unset
    pub device: Option<String>,
    /// PCM parameters for [`OutputKind::Device`]
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            kind: OutputKind::Stdout,
            path: None,
            device: None,
            sample_rate: DEFAULT_PCM_SAMPLE_RATE,
            channels: DEFAULT_PCM_CHANNELS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Stdout,
    File,
    Discard,
    Device,
}

/// HTTP control surface
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub http_port: u16,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1".to_string(),
            http_port: DEFAULT_HTTP_PORT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedSession {
    pub endpoint: String,
    pub identifier: String,
}

impl AppConfig {
    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from `path`; a missing file yields defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the default location, or defaults if there is none
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.buffer.validate()?;

        let r = &self.reconnect;
        if r.max_delay_ms < r.base_delay_ms {
            return Err(Error::Config(
                "reconnect.max_delay_ms must not be below reconnect.base_delay_ms".into(),
            ));
        }

        if self.stream.format.trim().is_empty() {
            return Err(Error::Config("stream.format must not be empty".into()));
        }
        if self.stream.connect_timeout_ms == 0 || self.stream.idle_timeout_ms == 0 {
            return Err(Error::Config(
                "stream.connect_timeout_ms and stream.idle_timeout_ms must be positive".into(),
            ));
        }
        if !self.stream.path.starts_with('/') {
            return Err(Error::Config("stream.path must start with '/'".into()));
        }
        if let Some(relay) = &self.stream.relay {
            if relay.session_code.trim().is_empty() {
                return Err(Error::Config("stream.relay.session_code must not be empty".into()));
            }
        }

        if self.output.kind == OutputKind::File && self.output.path.is_none() {
            return Err(Error::Config("output.path is required for file output".into()));
        }
        if self.output.channels == 0 || self.output.sample_rate == 0 {
            return Err(Error::Config("output sample_rate and channels must be positive".into()));
        }
        Ok(())
    }
}
