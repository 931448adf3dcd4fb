//! Sample sources for the sampling loop.
//!
//! `SimulatedSource` reproduces the demo canal: a bounded random walk
//! around a fixed baseline, driven by an injectable RNG so runs can be
//! replayed from a seed. `ScriptedSource` replays a fixed sequence.

use std::collections::VecDeque;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::ingestor::RawSample;

/// Produces raw samples on demand.
pub trait SampleSource: Send {
    /// The sample for the tick at `now`, or `None` if the sensor has
    /// nothing to report.
    fn poll(&mut self, now: u64) -> Option<RawSample>;
}

/// Baseline and jitter for the simulated canal.
#[derive(Debug, Clone)]
pub struct SimulationProfile {
    pub water_level_pct: f64,
    pub flow_rate_lps: f64,
    pub pressure_bar: f64,
    pub canal_volume_m3: f64,
    /// Peak-to-peak jitter applied per tick.
    pub level_jitter: f64,
    pub flow_jitter: f64,
    pub pressure_jitter: f64,
}

impl Default for SimulationProfile {
    fn default() -> Self {
        Self {
            water_level_pct: 75.0,
            flow_rate_lps: 120.0,
            pressure_bar: 3.5,
            canal_volume_m3: 5000.0,
            level_jitter: 5.0,
            flow_jitter: 10.0,
            pressure_jitter: 0.2,
        }
    }
}

/// Random-walk sensor feed.
pub struct SimulatedSource<R = StdRng> {
    rng: R,
    profile: SimulationProfile,
    state: RawSample,
}

impl SimulatedSource<StdRng> {
    /// A reproducible feed.
    pub fn seeded(seed: u64, profile: SimulationProfile) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed), profile)
    }

    pub fn from_entropy(profile: SimulationProfile) -> Self {
        Self::with_rng(StdRng::from_entropy(), profile)
    }
}

impl<R: Rng> SimulatedSource<R> {
    pub fn with_rng(rng: R, profile: SimulationProfile) -> Self {
        let state = RawSample {
            timestamp: 0,
            water_level_pct: profile.water_level_pct,
            flow_rate_lps: profile.flow_rate_lps,
            pressure_bar: profile.pressure_bar,
            canal_volume_m3: profile.canal_volume_m3,
        };
        Self {
            rng,
            profile,
            state,
        }
    }

    fn jitter(&mut self, span: f64) -> f64 {
        (self.rng.r#gen::<f64>() - 0.5) * span
    }
}

impl<R: Rng + Send> SampleSource for SimulatedSource<R> {
    fn poll(&mut self, now: u64) -> Option<RawSample> {
        let level = self.jitter(self.profile.level_jitter);
        let flow = self.jitter(self.profile.flow_jitter);
        let pressure = self.jitter(self.profile.pressure_jitter);
        // Flow is kept within twice the baseline so the walk cannot drift
        // the canal dry or into flood.
        let max_flow = self.profile.flow_rate_lps * 2.0;

        let s = &mut self.state;
        s.timestamp = now;
        s.water_level_pct = (s.water_level_pct + level).clamp(0.0, 100.0);
        s.flow_rate_lps = (s.flow_rate_lps + flow).clamp(0.0, max_flow);
        s.pressure_bar = (s.pressure_bar + pressure).max(0.0);
        Some(*s)
    }
}

/// Replays a fixed script. `None` entries model ticks with no report; once
/// the script runs out the sensor stays silent.
#[derive(Debug, Default)]
pub struct ScriptedSource {
    script: VecDeque<Option<RawSample>>,
}

impl ScriptedSource {
    pub fn new(script: impl IntoIterator<Item = Option<RawSample>>) -> Self {
        Self {
            script: script.into_iter().collect(),
        }
    }

    /// A sensor reporting a constant flow on every tick, stamped with the
    /// tick time.
    pub fn constant(flow_rate_lps: f64, ticks: usize) -> Self {
        let sample = RawSample {
            timestamp: 0,
            water_level_pct: 75.0,
            flow_rate_lps,
            pressure_bar: 3.5,
            canal_volume_m3: 5000.0,
        };
        Self::new(std::iter::repeat_n(Some(sample), ticks))
    }
}

impl SampleSource for ScriptedSource {
    fn poll(&mut self, now: u64) -> Option<RawSample> {
        let mut sample = self.script.pop_front().flatten()?;
        sample.timestamp = sample.timestamp.max(now);
        Some(sample)
    }
}
