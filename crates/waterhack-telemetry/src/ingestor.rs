//! Sample validation, smoothing and sensor dropout tracking.
//!
//! The ingestor is plain synchronous state; `TelemetryHub` wraps it for
//! sharing across tasks.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use waterhack_state::TelemetryReading;

use crate::error::{TelemetryError, TelemetryResult};

/// A raw, unvalidated sample from the canal sensors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    pub timestamp: u64,
    pub water_level_pct: f64,
    pub flow_rate_lps: f64,
    pub pressure_bar: f64,
    pub canal_volume_m3: f64,
}

impl RawSample {
    fn validate(&self) -> TelemetryResult<()> {
        let checks = [
            ("water level", self.water_level_pct),
            ("flow rate", self.flow_rate_lps),
            ("pressure", self.pressure_bar),
            ("canal volume", self.canal_volume_m3),
        ];
        for (name, value) in checks {
            if !value.is_finite() {
                return Err(TelemetryError::InvalidSample(format!(
                    "{name} is not a finite number"
                )));
            }
        }
        if !(0.0..=100.0).contains(&self.water_level_pct) {
            return Err(TelemetryError::InvalidSample(format!(
                "water level {}% outside [0, 100]",
                self.water_level_pct
            )));
        }
        for (name, value) in &checks[1..] {
            if *value < 0.0 {
                return Err(TelemetryError::InvalidSample(format!(
                    "negative {name}: {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Ingestor tuning.
#[derive(Debug, Clone)]
pub struct IngestorConfig {
    /// Weight of the newest sample, in (0, 1].
    pub alpha: f64,
    /// Silence longer than this marks the sensor inactive.
    pub sensor_timeout: Duration,
    /// Number of readings kept for observers.
    pub history_len: usize,
}

impl Default for IngestorConfig {
    fn default() -> Self {
        Self {
            alpha: 0.3,
            sensor_timeout: Duration::from_secs(5),
            history_len: 300,
        }
    }
}

impl From<&waterhack_core::config::TelemetryConfig> for IngestorConfig {
    fn from(cfg: &waterhack_core::config::TelemetryConfig) -> Self {
        Self {
            alpha: cfg.alpha,
            sensor_timeout: cfg.sensor_timeout(),
            history_len: cfg.history_len,
        }
    }
}

/// Validates raw samples and keeps the smoothed canonical reading.
#[derive(Debug)]
pub struct TelemetryIngestor {
    config: IngestorConfig,
    current: Option<TelemetryReading>,
    /// Local arrival time of the last accepted sample.
    last_sample_at: Option<u64>,
    sensor_active: bool,
    history: VecDeque<TelemetryReading>,
}

impl TelemetryIngestor {
    pub fn new(config: IngestorConfig) -> TelemetryResult<Self> {
        if !(config.alpha > 0.0 && config.alpha <= 1.0) {
            return Err(TelemetryError::InvalidConfig(format!(
                "alpha must be in (0, 1], got {}",
                config.alpha
            )));
        }
        Ok(Self {
            history: VecDeque::with_capacity(config.history_len),
            config,
            current: None,
            last_sample_at: None,
            sensor_active: false,
        })
    }

    /// Validate and smooth a raw sample received at `now`.
    ///
    /// The first accepted sample seeds the reading; later ones are blended
    /// as `alpha·raw + (1-alpha)·previous`. A sample arriving after a
    /// dropout reactivates the sensor and blends against the frozen reading.
    pub fn ingest(&mut self, raw: &RawSample, now: u64) -> TelemetryResult<TelemetryReading> {
        raw.validate()?;
        if let Some(prev) = &self.current {
            if raw.timestamp < prev.timestamp {
                return Err(TelemetryError::InvalidSample(format!(
                    "timestamp {} precedes last reading at {}",
                    raw.timestamp, prev.timestamp
                )));
            }
        }

        let reading = match &self.current {
            None => TelemetryReading {
                timestamp: raw.timestamp,
                water_level_pct: raw.water_level_pct,
                flow_rate_lps: raw.flow_rate_lps,
                pressure_bar: raw.pressure_bar,
                canal_volume_m3: raw.canal_volume_m3,
            },
            Some(prev) => {
                let a = self.config.alpha;
                let blend = |raw: f64, prev: f64| a * raw + (1.0 - a) * prev;
                TelemetryReading {
                    timestamp: raw.timestamp,
                    water_level_pct: blend(raw.water_level_pct, prev.water_level_pct),
                    flow_rate_lps: blend(raw.flow_rate_lps, prev.flow_rate_lps),
                    pressure_bar: blend(raw.pressure_bar, prev.pressure_bar),
                    canal_volume_m3: blend(raw.canal_volume_m3, prev.canal_volume_m3),
                }
            }
        };

        if !self.sensor_active {
            info!(timestamp = raw.timestamp, "canal sensor reporting");
        }
        self.sensor_active = true;
        self.last_sample_at = Some(now);
        self.current = Some(reading);
        if self.history.len() == self.config.history_len {
            self.history.pop_front();
        }
        if self.config.history_len > 0 {
            self.history.push_back(reading);
        }
        debug!(
            flow_lps = reading.flow_rate_lps,
            level_pct = reading.water_level_pct,
            "telemetry reading recorded"
        );
        Ok(reading)
    }

    /// Mark the sensor inactive if it has been silent past the timeout.
    /// Returns true when this call flipped it.
    pub fn check_staleness(&mut self, now: u64) -> bool {
        let Some(last) = self.last_sample_at else {
            return false;
        };
        let silent = Duration::from_secs(now.saturating_sub(last));
        if self.sensor_active && silent > self.config.sensor_timeout {
            self.sensor_active = false;
            warn!(
                silent_secs = silent.as_secs(),
                timeout_secs = self.config.sensor_timeout.as_secs(),
                "canal sensor silent, freezing last reading"
            );
            return true;
        }
        false
    }

    /// The latest smoothed reading, frozen while the sensor is inactive.
    pub fn current_reading(&self) -> Option<TelemetryReading> {
        self.current
    }

    pub fn sensor_active(&self) -> bool {
        self.sensor_active
    }

    /// Recorded readings, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &TelemetryReading> {
        self.history.iter()
    }
}
