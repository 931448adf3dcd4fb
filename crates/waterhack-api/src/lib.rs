//! waterhack-api: REST API for WaterHack.
//!
//! Provides axum route handlers for fields, water demands, the canal
//! session, and telemetry. Every JSON response is wrapped as
//! `{success, data?, error?}`.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET/POST | `/api/v1/fields` | List / register fields |
//! | GET/PUT/DELETE | `/api/v1/fields/{id}` | Get / update / delete a field |
//! | GET/POST | `/api/v1/demands` | List (`?status=`) / submit demands |
//! | GET | `/api/v1/demands/{id}` | Get a demand |
//! | POST | `/api/v1/demands/{id}/review` | Start review |
//! | POST | `/api/v1/demands/{id}/approve` | Approve and enqueue |
//! | POST | `/api/v1/demands/{id}/reject` | Reject |
//! | POST | `/api/v1/demands/{id}/cancel` | Withdraw a queued demand |
//! | GET | `/api/v1/demands/{id}/wait` | Estimated wait (seconds) |
//! | GET | `/api/v1/demands/{id}/deliveries` | Delivery audit records |
//! | GET | `/api/v1/queue` | Queue snapshot |
//! | GET | `/api/v1/session` | Active delivery session |
//! | POST | `/api/v1/session/{start,pause,resume,abort}` | Operator controls |
//! | GET/PUT | `/api/v1/control-mode` | Auto / manual |
//! | GET/POST | `/api/v1/telemetry` | Current reading / push a raw sample |
//! | GET | `/api/v1/telemetry/history` | Recent readings |
//! | GET | `/metrics` | Prometheus exposition |

pub mod canal_handlers;
pub mod handlers;
pub mod prometheus;
pub mod telemetry_handlers;

#[cfg(test)]
mod testing;

use axum::Router;
use axum::routing::{get, post};
use waterhack_scheduler::Scheduler;
use waterhack_state::StateStore;
use waterhack_telemetry::TelemetryHub;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub scheduler: Scheduler,
    pub telemetry: TelemetryHub,
}

/// Build the complete API router (REST + metrics).
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/fields", get(handlers::list_fields).post(handlers::create_field))
        .route(
            "/fields/{id}",
            get(handlers::get_field)
                .put(handlers::update_field)
                .delete(handlers::delete_field),
        )
        .route("/demands", get(handlers::list_demands).post(handlers::submit_demand))
        .route("/demands/{id}", get(handlers::get_demand))
        .route("/demands/{id}/review", post(handlers::review_demand))
        .route("/demands/{id}/approve", post(handlers::approve_demand))
        .route("/demands/{id}/reject", post(handlers::reject_demand))
        .route("/demands/{id}/cancel", post(handlers::cancel_demand))
        .route("/demands/{id}/wait", get(handlers::demand_wait))
        .route("/demands/{id}/deliveries", get(handlers::list_deliveries))
        .route("/queue", get(canal_handlers::get_queue))
        .route("/session", get(canal_handlers::get_session))
        .route("/session/start", post(canal_handlers::start_session))
        .route("/session/pause", post(canal_handlers::pause_session))
        .route("/session/resume", post(canal_handlers::resume_session))
        .route("/session/abort", post(canal_handlers::abort_session))
        .route(
            "/control-mode",
            get(canal_handlers::get_control_mode).put(canal_handlers::set_control_mode),
        )
        .route(
            "/telemetry",
            get(telemetry_handlers::get_telemetry).post(telemetry_handlers::ingest_sample),
        )
        .route("/telemetry/history", get(telemetry_handlers::telemetry_history))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::prometheus_metrics).with_state(state))
}
