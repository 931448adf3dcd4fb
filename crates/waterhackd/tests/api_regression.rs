//! API regression tests.
//!
//! Drives the assembled router in-process: fields, demands, the canal
//! session and telemetry, with a manual clock standing in for wall time.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use waterhack_api::{ApiState, build_router};
use waterhack_core::config::SchedulerConfig;
use waterhack_core::{Clock, ControlMode, ManualClock};
use waterhack_scheduler::{Scheduler, SchedulerError};
use waterhack_state::*;
use waterhack_telemetry::{IngestorConfig, RawSample, TelemetryHub};

const T0: u64 = 1_700_000_000;

struct Daemon {
    clock: ManualClock,
    state: ApiState,
    router: Router,
}

impl Daemon {
    fn start(store: StateStore, mode: ControlMode) -> Self {
        let clock = ManualClock::new(T0);
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let telemetry = TelemetryHub::new(IngestorConfig::default(), shared.clone()).unwrap();
        let config = SchedulerConfig {
            control_mode: mode,
            ..SchedulerConfig::default()
        };
        let scheduler = Scheduler::recover(store.clone(), telemetry.clone(), shared, &config).unwrap();
        let state = ApiState {
            store,
            scheduler,
            telemetry,
        };
        let router = build_router(state.clone());
        Self { clock, state, router }
    }

    async fn call(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let req = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = self.router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    /// Report a constant flow at the current time, then run one tick.
    async fn step(&self, secs: u64, flow_rate_lps: f64) {
        self.clock.advance(secs);
        self.state
            .telemetry
            .ingest(RawSample {
                timestamp: self.clock.now(),
                water_level_pct: 75.0,
                flow_rate_lps,
                pressure_bar: 3.5,
                canal_volume_m3: 5000.0,
            })
            .await
            .unwrap();
        self.state.scheduler.tick().await.unwrap();
    }

    async fn add_field(&self, id: &str, size_ha: f64, crop: &str) {
        let (status, _) = self
            .call(
                "POST",
                "/api/v1/fields",
                Some(json!({
                    "id": id,
                    "name": format!("Maydon {id}"),
                    "size_ha": size_ha,
                    "crop_type": crop,
                    "distance_to_canal_km": 1.5,
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    async fn submit(&self, field: &str, volume: Option<f64>) -> u64 {
        let mut body = json!({ "field_id": field, "requested_start": self.clock.now() });
        if let Some(v) = volume {
            body["requested_volume_m3"] = json!(v);
        }
        let (status, resp) = self.call("POST", "/api/v1/demands", Some(body)).await;
        assert_eq!(status, StatusCode::CREATED, "{resp}");
        resp["data"]["id"].as_u64().unwrap()
    }

    async fn status_of(&self, id: u64) -> String {
        let (_, resp) = self.call("GET", &format!("/api/v1/demands/{id}"), None).await;
        resp["data"]["status"].as_str().unwrap().to_string()
    }
}

fn assert_close(value: &Value, expected: f64) {
    let actual = value.as_f64().unwrap();
    assert!((actual - expected).abs() < 1e-6, "{actual} != {expected}");
}

fn memory_daemon(mode: ControlMode) -> Daemon {
    Daemon::start(StateStore::open_in_memory().unwrap(), mode)
}

#[tokio::test]
async fn field_water_need_is_derived() {
    let d = memory_daemon(ControlMode::Auto);
    d.add_field("cotton", 15.0, "cotton").await;
    d.add_field("wheat", 10.0, "wheat").await;

    let (status, resp) = d.call("GET", "/api/v1/fields/cotton", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resp["data"]["water_need_m3"], json!(15000.0));

    let (_, resp) = d.call("GET", "/api/v1/fields/wheat", None).await;
    assert_eq!(resp["data"]["water_need_m3"], json!(9000.0));

    let (status, resp) = d
        .call(
            "PUT",
            "/api/v1/fields/wheat",
            Some(json!({
                "id": "wheat",
                "name": "Maydon wheat",
                "size_ha": 12.0,
                "crop_type": "wheat",
                "distance_to_canal_km": 1.5,
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resp["data"]["water_need_m3"], json!(10800.0));

    let (_, resp) = d.call("GET", "/api/v1/fields", None).await;
    assert_eq!(resp["data"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn submission_errors_map_to_bad_request() {
    let d = memory_daemon(ControlMode::Auto);
    d.add_field("f1", 15.0, "cotton").await;

    let (status, resp) = d
        .call(
            "POST",
            "/api/v1/demands",
            Some(json!({ "field_id": "f1", "requested_volume_m3": 0.0, "requested_start": T0 })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(resp["success"], json!(false));

    let (status, _) = d
        .call(
            "POST",
            "/api/v1/demands",
            Some(json!({ "field_id": "f1", "requested_volume_m3": 10.0, "requested_start": T0 - 60 })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = d
        .call(
            "POST",
            "/api/v1/telemetry",
            Some(json!({
                "timestamp": T0,
                "water_level_pct": 140.0,
                "flow_rate_lps": 120.0,
                "pressure_bar": 3.5,
                "canal_volume_m3": 5000.0,
            })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn three_demands_are_served_in_order() {
    let d = memory_daemon(ControlMode::Auto);
    d.add_field("f1", 15.0, "cotton").await;
    d.add_field("f2", 12.0, "cotton").await;
    d.add_field("f3", 20.0, "wheat").await;

    let first = d.submit("f1", None).await;
    let second = d.submit("f2", None).await;
    let third = d.submit("f3", None).await;
    for id in [first, second, third] {
        let (status, _) = d.call("POST", &format!("/api/v1/demands/{id}/approve"), None).await;
        assert_eq!(status, StatusCode::OK);
    }

    // Re-approving is a conflict and leaves the queue alone.
    let (status, _) = d.call("POST", &format!("/api/v1/demands/{first}/approve"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    d.step(0, 120.0).await;
    assert_eq!(d.status_of(first).await, "delivering");

    let (_, resp) = d.call("GET", "/api/v1/queue", None).await;
    let ids: Vec<u64> = resp["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|slot| slot["demand_id"].as_u64().unwrap())
        .collect();
    assert_eq!(ids, vec![first, second, third]);

    let (_, resp) = d.call("GET", &format!("/api/v1/demands/{third}/wait"), None).await;
    let wait = resp["data"]["estimated_wait_seconds"].as_f64().unwrap();
    assert!((wait - 225_000.0).abs() < 1e-3, "wait {wait}");

    // 15000 m³ at 120 L/s is 125000 s.
    let mut ticks = 0;
    while d.status_of(first).await != "completed" {
        d.step(1_000, 120.0).await;
        ticks += 1;
        assert!(ticks <= 126, "first demand did not complete in time");
    }
    assert!(ticks >= 125);
    assert_eq!(d.status_of(second).await, "delivering");
    assert_eq!(d.status_of(third).await, "approved");

    let (_, resp) = d.call("GET", &format!("/api/v1/demands/{first}/deliveries"), None).await;
    let records = resp["data"].as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["delivered_volume_m3"], json!(15000.0));
    assert_eq!(records[0]["outcome"]["outcome"], json!("completed"));

    let (_, resp) = d.call("GET", "/api/v1/demands?status=completed", None).await;
    assert_eq!(resp["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn abort_requeues_with_partial_volume() {
    let d = memory_daemon(ControlMode::Manual);
    d.add_field("f1", 15.0, "cotton").await;
    d.add_field("f2", 12.0, "cotton").await;
    let first = d.submit("f1", None).await;
    let second = d.submit("f2", None).await;
    for id in [first, second] {
        d.call("POST", &format!("/api/v1/demands/{id}/approve"), None).await;
    }

    // Manual mode: nothing starts until the operator asks.
    d.step(0, 1000.0).await;
    let (status, _) = d.call("GET", "/api/v1/session", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, resp) = d.call("POST", "/api/v1/session/start", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resp["data"]["demand_id"].as_u64(), Some(first));

    // 1000 L/s for 5000 s = 5000 m³.
    d.step(5_000, 1000.0).await;
    let (_, resp) = d.call("GET", "/api/v1/session", None).await;
    assert_close(&resp["data"]["delivered_volume_m3"], 5000.0);
    assert_close(&resp["data"]["remaining_volume_m3"], 10000.0);

    let (status, resp) = d
        .call("POST", "/api/v1/session/abort", Some(json!({ "reason": "sensor_fault" })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resp["data"]["status"], json!("approved"));
    assert_close(&resp["data"]["delivered_volume_m3"], 5000.0);

    let (_, resp) = d.call("GET", "/api/v1/queue", None).await;
    let ids: Vec<u64> = resp["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|slot| slot["demand_id"].as_u64().unwrap())
        .collect();
    assert_eq!(ids, vec![second, first]);

    let (_, resp) = d.call("GET", &format!("/api/v1/demands/{first}/deliveries"), None).await;
    assert_close(&resp["data"][0]["delivered_volume_m3"], 5000.0);
    assert_eq!(resp["data"][0]["outcome"]["reason"], json!("sensor_fault"));

    // Cancelling the requeued demand withdraws it.
    let (status, resp) = d.call("POST", &format!("/api/v1/demands/{first}/cancel"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resp["data"]["status"], json!("rejected"));
}

#[tokio::test]
async fn deleting_field_aborts_its_delivery() {
    let d = memory_daemon(ControlMode::Auto);
    d.add_field("f1", 1.0, "wheat").await;
    let id = d.submit("f1", None).await;
    d.call("POST", &format!("/api/v1/demands/{id}/approve"), None).await;
    d.step(0, 120.0).await;
    assert_eq!(d.status_of(id).await, "delivering");

    let (status, _) = d.call("DELETE", "/api/v1/fields/f1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(d.status_of(id).await, "rejected");
    let (status, _) = d.call("GET", "/api/v1/session", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, resp) = d.call("GET", &format!("/api/v1/demands/{id}/deliveries"), None).await;
    assert_eq!(resp["data"][0]["outcome"]["reason"], json!("field_cancelled"));
}

#[tokio::test]
async fn control_mode_switch() {
    let d = memory_daemon(ControlMode::Manual);
    d.add_field("f1", 1.0, "wheat").await;
    let id = d.submit("f1", None).await;
    d.call("POST", &format!("/api/v1/demands/{id}/approve"), None).await;

    d.step(1, 120.0).await;
    assert_eq!(d.status_of(id).await, "approved");

    let (status, resp) = d
        .call("PUT", "/api/v1/control-mode", Some(json!({ "mode": "auto" })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resp["data"]["mode"], json!("auto"));

    d.step(1, 120.0).await;
    assert_eq!(d.status_of(id).await, "delivering");
}

#[tokio::test]
async fn telemetry_and_metrics_endpoints() {
    let d = memory_daemon(ControlMode::Auto);
    let (_, resp) = d.call("GET", "/api/v1/telemetry", None).await;
    assert_eq!(resp["data"]["sensor_active"], json!(false));

    let (status, _) = d
        .call(
            "POST",
            "/api/v1/telemetry",
            Some(json!({
                "timestamp": T0,
                "water_level_pct": 75.0,
                "flow_rate_lps": 120.0,
                "pressure_bar": 3.5,
                "canal_volume_m3": 5000.0,
            })),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (_, resp) = d.call("GET", "/api/v1/telemetry", None).await;
    assert_eq!(resp["data"]["sensor_active"], json!(true));
    assert_eq!(resp["data"]["reading"]["flow_rate_lps"], json!(120.0));

    let (_, resp) = d.call("GET", "/api/v1/telemetry/history", None).await;
    assert_eq!(resp["data"].as_array().unwrap().len(), 1);

    let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
    let resp = d.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("waterhack_flow_rate_lps 120.00"));
    assert!(text.contains("waterhack_sensor_active 1"));
}

#[tokio::test]
async fn restart_resumes_interrupted_delivery() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("waterhack.redb");

    let (first, second) = {
        let d = Daemon::start(StateStore::open(&path).unwrap(), ControlMode::Auto);
        d.add_field("f1", 15.0, "cotton").await;
        let first = d.submit("f1", Some(1000.0)).await;
        let second = d.submit("f1", Some(500.0)).await;
        for id in [first, second] {
            d.call("POST", &format!("/api/v1/demands/{id}/approve"), None).await;
        }
        d.step(0, 120.0).await;
        assert_eq!(d.status_of(first).await, "delivering");
        (first, second)
    };

    let d = Daemon::start(StateStore::open(&path).unwrap(), ControlMode::Auto);
    let (status, resp) = d.call("GET", "/api/v1/session", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resp["data"]["demand_id"].as_u64(), Some(first));
    assert_eq!(resp["data"]["state"], json!("running"));

    let (_, resp) = d.call("GET", "/api/v1/queue", None).await;
    assert_eq!(resp["data"][1]["demand_id"].as_u64(), Some(second));
}

#[tokio::test]
async fn two_delivering_demands_refuse_to_recover() {
    let store = StateStore::open_in_memory().unwrap();
    for id in [1, 2] {
        store
            .put_demand(&Demand {
                id,
                field_id: "f1".to_string(),
                requested_volume_m3: 100.0,
                requested_start: T0,
                notes: None,
                priority: id,
                status: DemandStatus::Delivering,
                submitted_at: T0,
                approved_at: Some(T0),
                queued_at: Some(T0),
                queue_rank: 0,
                delivered_volume_m3: 0.0,
                status_reason: None,
                updated_at: T0,
            })
            .unwrap();
    }
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(T0));
    let telemetry = TelemetryHub::new(IngestorConfig::default(), clock.clone()).unwrap();
    let result = Scheduler::recover(store, telemetry, clock, &SchedulerConfig::default());
    assert!(matches!(result, Err(SchedulerError::InvariantViolation(_))));
}
