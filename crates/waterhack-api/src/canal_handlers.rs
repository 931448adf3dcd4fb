//! REST API handlers for the canal: queue, delivery session, control mode.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use waterhack_core::ControlMode;
use waterhack_state::AbortReason;

use crate::ApiState;
use crate::handlers::{ApiResponse, error_response, scheduler_error};

/// GET /api/v1/queue
pub async fn get_queue(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(state.scheduler.queue()).into_response()
}

/// GET /api/v1/session
pub async fn get_session(State(state): State<ApiState>) -> Response {
    match state.scheduler.session().await {
        Some(session) => ApiResponse::ok(session).into_response(),
        None => error_response("no active delivery session", StatusCode::NOT_FOUND),
    }
}

/// POST /api/v1/session/start
pub async fn start_session(State(state): State<ApiState>) -> Response {
    match state.scheduler.start_next().await {
        Ok(session) => ApiResponse::ok(session).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// POST /api/v1/session/pause
pub async fn pause_session(State(state): State<ApiState>) -> Response {
    match state.scheduler.pause().await {
        Ok(session) => ApiResponse::ok(session).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// POST /api/v1/session/resume
pub async fn resume_session(State(state): State<ApiState>) -> Response {
    match state.scheduler.resume().await {
        Ok(session) => ApiResponse::ok(session).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// Optional body for an abort. Defaults to an operator stop.
#[derive(serde::Deserialize)]
pub struct AbortRequest {
    pub reason: AbortReason,
}

/// POST /api/v1/session/abort
pub async fn abort_session(State(state): State<ApiState>, body: Option<Json<AbortRequest>>) -> Response {
    let reason = body.map_or(AbortReason::OperatorStop, |Json(req)| req.reason);
    match state.scheduler.abort(reason).await {
        Ok(demand) => ApiResponse::ok(demand).into_response(),
        Err(e) => scheduler_error(e),
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
pub struct ControlModeBody {
    pub mode: ControlMode,
}

/// GET /api/v1/control-mode
pub async fn get_control_mode(State(state): State<ApiState>) -> Response {
    let mode = state.scheduler.control_mode().await;
    ApiResponse::ok(ControlModeBody { mode }).into_response()
}

/// PUT /api/v1/control-mode
pub async fn set_control_mode(State(state): State<ApiState>, Json(body): Json<ControlModeBody>) -> Response {
    state.scheduler.set_control_mode(body.mode).await;
    ApiResponse::ok(body).into_response()
}
