use crate::command_queue::OverflowPolicy;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

pub const CONFIG_ENV: &str = "BASESTATION_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "./basestation.toml";

/// Base station configuration. Every field has a default so a partial (or
/// missing) file is fine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub pod: PodConfig,
    pub queue: QueueConfig,
    pub transport: TransportConfig,
    pub telemetry: TelemetryConfig,
    pub guard: GuardConfig,
    pub web: WebConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PodConfig {
    /// TCP endpoint of the pod's command server.
    pub command_addr: String,
    /// Local UDP address the pod streams telemetry to.
    pub telemetry_bind: String,
}

impl Default for PodConfig {
    fn default() -> Self {
        Self {
            command_addr: "127.0.0.1:8001".to_string(),
            telemetry_bind: "0.0.0.0:5004".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            overflow: OverflowPolicy::Reject,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub tick_ms: u64,
    pub connect_timeout_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    /// How long shutdown may spend sending what is still queued.
    pub shutdown_flush_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tick_ms: 50,
            connect_timeout_ms: 2_000,
            backoff_initial_ms: 250,
            backoff_max_ms: 5_000,
            shutdown_flush_ms: 1_000,
        }
    }
}

impl TransportConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn shutdown_flush(&self) -> Duration {
        Duration::from_millis(self.shutdown_flush_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Frames retained for statistics; oldest are evicted first.
    pub history_capacity: usize,
    pub stale_after_ms: u64,
    pub max_datagram: usize,
    pub watchdog_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            history_capacity: 10_000,
            stale_after_ms: 2_000,
            max_datagram: 512,
            watchdog_ms: 500,
        }
    }
}

impl TelemetryConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn watchdog_period(&self) -> Duration {
        Duration::from_millis(self.watchdog_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub reject_invalid_transitions: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub bind: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
        }
    }
}

impl GatewayConfig {
    /// Loads `path`, falling back to defaults when the file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        let config = Self::parse(&raw)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        info!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).context("cannot parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue.capacity == 0 {
            bail!("queue.capacity must be at least 1");
        }
        if self.transport.tick_ms == 0 {
            bail!("transport.tick_ms must be at least 1");
        }
        if self.transport.backoff_initial_ms == 0 {
            bail!("transport.backoff_initial_ms must be at least 1");
        }
        if self.transport.backoff_initial_ms > self.transport.backoff_max_ms {
            bail!(
                "transport.backoff_initial_ms ({}) exceeds backoff_max_ms ({})",
                self.transport.backoff_initial_ms,
                self.transport.backoff_max_ms
            );
        }
        if self.telemetry.history_capacity == 0 {
            bail!("telemetry.history_capacity must be at least 1");
        }
        if self.telemetry.max_datagram == 0 {
            bail!("telemetry.max_datagram must be at least 1");
        }
        if self.telemetry.watchdog_ms == 0 {
            bail!("telemetry.watchdog_ms must be at least 1");
        }
        Ok(())
    }
}
