//! Sampling loop: pulls from a `SampleSource` on a fixed-period clock.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::hub::TelemetryHub;
use crate::source::SampleSource;

/// Poll `source` every `period`, feed the hub, and check for sensor
/// silence on every tick. Runs until `shutdown` changes.
pub async fn run_sampler<S: SampleSource>(
    hub: TelemetryHub,
    mut source: S,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(period_ms = period.as_millis() as u64, "telemetry sampler started");
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sample_once(&hub, &mut source).await;
            }
            _ = shutdown.changed() => {
                info!("telemetry sampler shutting down");
                break;
            }
        }
    }
}

/// One sampling tick. Invalid samples are already logged by the hub.
pub async fn sample_once<S: SampleSource>(hub: &TelemetryHub, source: &mut S) {
    match source.poll(hub.now()) {
        Some(sample) => {
            let _ = hub.ingest(sample).await;
        }
        None => debug!("no telemetry sample this tick"),
    }
    hub.check_staleness().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use waterhack_core::ManualClock;

    use crate::ingestor::{IngestorConfig, RawSample};
    use crate::source::ScriptedSource;

    fn sample(flow_rate_lps: f64) -> RawSample {
        RawSample {
            timestamp: 0,
            water_level_pct: 75.0,
            flow_rate_lps,
            pressure_bar: 3.5,
            canal_volume_m3: 5000.0,
        }
    }

    #[tokio::test]
    async fn silence_past_timeout_freezes_then_recovers() {
        let clock = ManualClock::new(0);
        let hub = TelemetryHub::new(IngestorConfig::default(), Arc::new(clock.clone())).unwrap();
        let mut script = vec![Some(sample(100.0))];
        script.extend(std::iter::repeat_n(None, 6));
        script.push(Some(sample(200.0)));
        let mut source = ScriptedSource::new(script);

        sample_once(&hub, &mut source).await;
        assert!(hub.sensor_active());

        for _ in 0..6 {
            clock.advance(1);
            sample_once(&hub, &mut source).await;
        }
        assert!(!hub.sensor_active());
        assert_eq!(hub.current_reading().unwrap().flow_rate_lps, 100.0);

        clock.advance(1);
        sample_once(&hub, &mut source).await;
        assert!(hub.sensor_active());
        assert!((hub.current_reading().unwrap().flow_rate_lps - 130.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn invalid_samples_do_not_stop_sampling() {
        let clock = ManualClock::new(0);
        let hub = TelemetryHub::new(IngestorConfig::default(), Arc::new(clock.clone())).unwrap();
        let mut source = ScriptedSource::new([Some(sample(-1.0)), Some(sample(50.0))]);

        sample_once(&hub, &mut source).await;
        assert!(hub.current_reading().is_none());
        clock.advance(1);
        sample_once(&hub, &mut source).await;
        assert_eq!(hub.current_reading().unwrap().flow_rate_lps, 50.0);
    }

    #[tokio::test]
    async fn sampler_stops_on_shutdown() {
        let clock = ManualClock::new(0);
        let hub = TelemetryHub::new(IngestorConfig::default(), Arc::new(clock)).unwrap();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_sampler(
            hub.clone(),
            ScriptedSource::constant(120.0, 1_000),
            Duration::from_millis(5),
            rx,
        ));

        let mut stream = hub.subscribe();
        let snap = stream.next().await.unwrap();
        assert_eq!(snap.reading.unwrap().flow_rate_lps, 120.0);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
