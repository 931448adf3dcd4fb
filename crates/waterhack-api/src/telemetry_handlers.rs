//! REST API handlers for canal telemetry.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use waterhack_telemetry::RawSample;

use crate::ApiState;
use crate::handlers::{ApiResponse, error_response};

/// GET /api/v1/telemetry
pub async fn get_telemetry(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(state.telemetry.latest()).into_response()
}

/// POST /api/v1/telemetry
///
/// Push-style ingestion for sensors that report over HTTP.
pub async fn ingest_sample(State(state): State<ApiState>, Json(sample): Json<RawSample>) -> Response {
    match state.telemetry.ingest(sample).await {
        Ok(reading) => (StatusCode::ACCEPTED, ApiResponse::ok(reading)).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::BAD_REQUEST),
    }
}

/// GET /api/v1/telemetry/history
pub async fn telemetry_history(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(state.telemetry.history().await).into_response()
}
