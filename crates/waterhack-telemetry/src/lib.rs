//! waterhack-telemetry: canal sensor ingestion for WaterHack.
//!
//! Validates raw sensor samples, smooths them into a canonical reading, and
//! detects sensor dropout. The sampling loop pulls from a pluggable source
//! on a fixed-period clock.
//!
//! # Architecture
//!
//! ```text
//! run_sampler() (1 Hz by default)
//!   ├── SampleSource::poll() → RawSample
//!   └── TelemetryHub
//!       ├── TelemetryIngestor (validation, smoothing, staleness)
//!       └── watch channel → latest() / subscribe()
//! ```
//!
//! # Dropout
//!
//! When no valid sample arrives for longer than the sensor timeout the hub
//! publishes `sensor_active = false` and keeps the last reading frozen. The
//! next valid sample reactivates the sensor and smoothing resumes from the
//! frozen value.

pub mod error;
pub mod hub;
pub mod ingestor;
pub mod sampler;
pub mod source;

pub use error::{TelemetryError, TelemetryResult};
pub use hub::{ReadingStream, TelemetryHub, TelemetrySnapshot};
pub use ingestor::{IngestorConfig, RawSample, TelemetryIngestor};
pub use sampler::{run_sampler, sample_once};
pub use source::{SampleSource, ScriptedSource, SimulatedSource, SimulationProfile};
