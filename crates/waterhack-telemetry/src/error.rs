//! Telemetry error types.

use thiserror::Error;

/// Errors raised while ingesting sensor samples.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The sample is malformed or out of range. It is dropped; ingestion
    /// continues with the next one.
    #[error("invalid sample: {0}")]
    InvalidSample(String),

    #[error("invalid telemetry config: {0}")]
    InvalidConfig(String),
}

pub type TelemetryResult<T> = Result<T, TelemetryError>;
