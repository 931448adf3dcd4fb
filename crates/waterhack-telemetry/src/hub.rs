//! TelemetryHub: shared, subscribable handle over the ingestor.
//!
//! Every accepted sample and every sensor status change publishes a fresh
//! `TelemetrySnapshot` on a `watch` channel, so readers that only need the
//! latest value never wait on the ingestor lock.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, watch};
use tracing::warn;

use waterhack_core::Clock;
use waterhack_state::TelemetryReading;

use crate::error::TelemetryResult;
use crate::ingestor::{IngestorConfig, RawSample, TelemetryIngestor};

/// What observers see: the latest reading plus sensor liveness.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub reading: Option<TelemetryReading>,
    /// False before the first sample and while the sensor is silent; the
    /// reading is then the frozen last known value.
    pub sensor_active: bool,
}

/// Shared telemetry handle. Cheap to clone.
#[derive(Clone)]
pub struct TelemetryHub {
    ingestor: Arc<RwLock<TelemetryIngestor>>,
    updates: Arc<watch::Sender<TelemetrySnapshot>>,
    clock: Arc<dyn Clock>,
}

impl TelemetryHub {
    pub fn new(config: IngestorConfig, clock: Arc<dyn Clock>) -> TelemetryResult<Self> {
        let ingestor = TelemetryIngestor::new(config)?;
        let (tx, _rx) = watch::channel(TelemetrySnapshot::default());
        Ok(Self {
            ingestor: Arc::new(RwLock::new(ingestor)),
            updates: Arc::new(tx),
            clock,
        })
    }

    /// Validate, smooth and publish a raw sample.
    ///
    /// Invalid samples are logged and dropped; the error is returned so
    /// push-style callers can report it.
    pub async fn ingest(&self, raw: RawSample) -> TelemetryResult<TelemetryReading> {
        let now = self.clock.now();
        let mut ingestor = self.ingestor.write().await;
        match ingestor.ingest(&raw, now) {
            Ok(reading) => {
                self.publish(&ingestor);
                Ok(reading)
            }
            Err(e) => {
                warn!(error = %e, timestamp = raw.timestamp, "dropping telemetry sample");
                Err(e)
            }
        }
    }

    /// Flip to frozen-reading mode if the sensor has gone silent.
    pub async fn check_staleness(&self) {
        let now = self.clock.now();
        let mut ingestor = self.ingestor.write().await;
        if ingestor.check_staleness(now) {
            self.publish(&ingestor);
        }
    }

    /// Latest published snapshot. Never blocks.
    pub fn latest(&self) -> TelemetrySnapshot {
        *self.updates.borrow()
    }

    /// The latest smoothed reading.
    pub fn current_reading(&self) -> Option<TelemetryReading> {
        self.latest().reading
    }

    pub fn sensor_active(&self) -> bool {
        self.latest().sensor_active
    }

    /// Recorded readings, oldest first.
    pub async fn history(&self) -> Vec<TelemetryReading> {
        self.ingestor.read().await.history().copied().collect()
    }

    /// Subscribe to reading updates.
    pub fn subscribe(&self) -> ReadingStream {
        ReadingStream {
            rx: self.updates.subscribe(),
        }
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    fn publish(&self, ingestor: &TelemetryIngestor) {
        self.updates.send_replace(TelemetrySnapshot {
            reading: ingestor.current_reading(),
            sensor_active: ingestor.sensor_active(),
        });
    }
}

/// Lazy stream of telemetry snapshots, one per published update.
///
/// Starts at the value current when subscribed and cannot be rewound.
/// Slow consumers skip intermediate values and see the newest one.
pub struct ReadingStream {
    rx: watch::Receiver<TelemetrySnapshot>,
}

impl ReadingStream {
    /// Wait for the next update. Returns `None` once the hub is gone.
    pub async fn next(&mut self) -> Option<TelemetrySnapshot> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }
}
