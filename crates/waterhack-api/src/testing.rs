//! Shared fixtures for handler tests.

use std::sync::Arc;

use waterhack_core::config::SchedulerConfig;
use waterhack_core::{Clock, ControlMode, ManualClock};
use waterhack_scheduler::Scheduler;
use waterhack_state::{CropType, Field, StateStore};
use waterhack_telemetry::{IngestorConfig, TelemetryHub};

use crate::ApiState;

pub(crate) fn test_state() -> ApiState {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_700_000_000));
    let store = StateStore::open_in_memory().unwrap();
    let telemetry = TelemetryHub::new(IngestorConfig::default(), clock.clone()).unwrap();
    let config = SchedulerConfig {
        control_mode: ControlMode::Manual,
        ..SchedulerConfig::default()
    };
    let scheduler = Scheduler::recover(store.clone(), telemetry.clone(), clock, &config).unwrap();
    ApiState {
        store,
        scheduler,
        telemetry,
    }
}

pub(crate) fn wheat_field(id: &str, size_ha: f64) -> Field {
    Field {
        id: id.to_string(),
        name: format!("Maydon {id}"),
        owner: "Dilnoza".to_string(),
        size_ha,
        crop_type: CropType::Wheat,
        distance_to_canal_km: 0.5,
    }
}
