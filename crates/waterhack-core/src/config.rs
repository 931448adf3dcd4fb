//! waterhack.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WaterhackConfig {
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Smoothing factor applied to each new sample, in (0, 1].
    pub alpha: f64,
    pub sample_interval: String,
    /// Silence longer than this marks the sensor inactive.
    pub sensor_timeout: String,
    pub history_len: usize,
    /// Seed for the simulated sensor feed. Random when absent.
    pub seed: Option<u64>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            alpha: 0.3,
            sample_interval: "1s".to_string(),
            sensor_timeout: "5s".to_string(),
            history_len: 300,
            seed: None,
        }
    }
}

impl TelemetryConfig {
    pub fn sample_interval(&self) -> Duration {
        parse_duration(&self.sample_interval).unwrap_or(Duration::from_secs(1))
    }

    pub fn sensor_timeout(&self) -> Duration {
        parse_duration(&self.sensor_timeout).unwrap_or(Duration::from_secs(5))
    }
}

/// Whether the scheduler starts queued deliveries by itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    #[default]
    Auto,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval: String,
    pub control_mode: ControlMode,
    /// Move new demands straight through review to approved.
    pub auto_approve: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: "1s".to_string(),
            control_mode: ControlMode::Auto,
            auto_approve: false,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        parse_duration(&self.tick_interval).unwrap_or(Duration::from_secs(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8480,
            data_dir: PathBuf::from("/var/lib/waterhack"),
        }
    }
}

impl WaterhackConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: WaterhackConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let alpha = self.telemetry.alpha;
        if !(alpha > 0.0 && alpha <= 1.0) {
            anyhow::bail!("telemetry.alpha must be in (0, 1], got {alpha}");
        }
        for (key, value) in [
            ("telemetry.sample_interval", &self.telemetry.sample_interval),
            ("telemetry.sensor_timeout", &self.telemetry.sensor_timeout),
            ("scheduler.tick_interval", &self.scheduler.tick_interval),
        ] {
            match parse_duration(value) {
                Some(d) if !d.is_zero() => {}
                _ => anyhow::bail!("{key}: invalid duration {value:?}"),
            }
        }
        Ok(())
    }
}

/// Parse a duration string like "5s", "500ms", "1m". A bare number is seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
