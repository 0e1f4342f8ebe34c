use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::sse::{BackpressureConfig, ConnectionLimits, MIN_SEND_RATE, OverflowPolicy};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,

    pub server: ServerConfig,

    pub observability: ObservabilityConfig,

    pub sse: SseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub log_level: String,

    /// Emit logs as JSON lines instead of the human-readable format.
    pub json_logs: bool,

    /// Number of tokio worker threads (default: 2)
    /// Set to 0 to use the number of CPU cores
    pub worker_threads: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            worker_threads: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,

    pub port: u16,

    /// Origins allowed by the CORS layer. `*` allows any origin.
    pub cors_allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 7878,
            cors_allowed_origins: vec!["*".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
        }
    }
}

/// Streaming engine settings. The connection fields are defaults that
/// individual streams may override.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SseConfig {
    /// Maximum events per second per connection.
    pub send_rate_limit: f64,

    /// Assumed client buffer size in bytes.
    pub max_buffer_size: usize,

    pub adaptive_throttling: bool,

    /// Capacity of the delivery queue behind each channel stream.
    pub queue_capacity: usize,

    pub overflow_policy: OverflowPolicy,

    /// Idle interval after which channel streams emit a keep-alive comment.
    pub keep_alive_secs: u64,

    pub backpressure: BackpressureConfig,
}

impl Default for SseConfig {
    fn default() -> Self {
        let limits = ConnectionLimits::default();
        Self {
            send_rate_limit: limits.send_rate_limit,
            max_buffer_size: limits.max_buffer_size,
            adaptive_throttling: limits.adaptive_throttling,
            queue_capacity: 256,
            overflow_policy: OverflowPolicy::default(),
            keep_alive_secs: 15,
            backpressure: BackpressureConfig::default(),
        }
    }
}

impl SseConfig {
    #[must_use]
    pub const fn limits(&self) -> ConnectionLimits {
        ConnectionLimits {
            send_rate_limit: self.send_rate_limit,
            max_buffer_size: self.max_buffer_size,
            adaptive_throttling: self.adaptive_throttling,
        }
    }

    #[must_use]
    pub const fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.send_rate_limit.is_finite() || self.send_rate_limit < MIN_SEND_RATE {
            anyhow::bail!("sse.send_rate_limit must be a number >= {MIN_SEND_RATE}");
        }

        if self.max_buffer_size == 0 {
            anyhow::bail!("sse.max_buffer_size must be > 0");
        }

        if self.queue_capacity == 0 {
            anyhow::bail!("sse.queue_capacity must be > 0");
        }

        let threshold = self.backpressure.buffer_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            anyhow::bail!("sse.backpressure.buffer_threshold must be in (0, 1], got {threshold}");
        }

        if self.backpressure.throttle_delay_ms == 0 {
            anyhow::bail!("sse.backpressure.throttle_delay_ms must be > 0");
        }

        if self.keep_alive_secs == 0 {
            anyhow::bail!("sse.keep_alive_secs must be > 0");
        }

        if self.backpressure.drain_rate_bytes_per_sec <= 0.0 {
            anyhow::bail!("sse.backpressure.drain_rate_bytes_per_sec must be > 0");
        }

        Ok(())
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let paths = Self::config_paths();

        for path in &paths {
            if path.exists() {
                info!("Loading config from: {}", path.display());
                return Self::load_from_path(path);
            }
        }

        info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    fn config_paths() -> Vec<PathBuf> {
        let mut paths = vec![];

        paths.push(PathBuf::from("config.toml"));

        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("zenith-sse").join("config.toml"));
        }

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".zenith-sse").join("config.toml"));
        }

        paths
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.enabled && self.server.port == 0 {
            anyhow::bail!("Server port cannot be 0 when the server is enabled");
        }

        self.sse.validate()
    }
}
