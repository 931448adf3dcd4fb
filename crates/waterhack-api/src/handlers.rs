//! REST API handlers for fields and demands.
//!
//! Reads go straight to the `StateStore` or the scheduler's registry;
//! every mutation goes through the `Scheduler` so it is serialized with
//! the scheduling loop.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;

use waterhack_scheduler::{NewDemand, SchedulerError};
use waterhack_state::*;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
pub(crate) struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

/// Map a scheduler error onto its HTTP status.
pub(crate) fn scheduler_error(e: SchedulerError) -> Response {
    let status = match &e {
        SchedulerError::InvalidDemand(_) | SchedulerError::InvalidField(_) => StatusCode::BAD_REQUEST,
        SchedulerError::DemandNotFound(_) | SchedulerError::FieldNotFound(_) => StatusCode::NOT_FOUND,
        SchedulerError::IllegalTransition { .. }
        | SchedulerError::FieldExists(_)
        | SchedulerError::NotCancellable { .. }
        | SchedulerError::ResourceBusy(_)
        | SchedulerError::NoActiveSession
        | SchedulerError::IllegalSessionState { .. }
        | SchedulerError::NothingToStart(_) => StatusCode::CONFLICT,
        SchedulerError::InvariantViolation(_) | SchedulerError::State(_) => {
            error!(error = %e, "scheduler failure");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(&e.to_string(), status)
}

fn internal(e: StateError) -> Response {
    error!(error = %e, "state store failure");
    error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
}

// ── Fields ─────────────────────────────────────────────────────

/// A field together with its derived water need.
#[derive(serde::Serialize)]
pub struct FieldView {
    #[serde(flatten)]
    pub field: Field,
    pub water_need_m3: f64,
}

impl From<Field> for FieldView {
    fn from(field: Field) -> Self {
        Self {
            water_need_m3: field.water_need(),
            field,
        }
    }
}

/// GET /api/v1/fields
pub async fn list_fields(State(state): State<ApiState>) -> Response {
    match state.store.list_fields() {
        Ok(fields) => {
            let views: Vec<FieldView> = fields.into_iter().map(FieldView::from).collect();
            ApiResponse::ok(views).into_response()
        }
        Err(e) => internal(e),
    }
}

/// GET /api/v1/fields/{id}
pub async fn get_field(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.store.get_field(&id) {
        Ok(Some(field)) => ApiResponse::ok(FieldView::from(field)).into_response(),
        Ok(None) => error_response("field not found", StatusCode::NOT_FOUND),
        Err(e) => internal(e),
    }
}

/// POST /api/v1/fields
pub async fn create_field(State(state): State<ApiState>, Json(field): Json<Field>) -> Response {
    match state.scheduler.create_field(&field).await {
        Ok(()) => (StatusCode::CREATED, ApiResponse::ok(FieldView::from(field))).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// PUT /api/v1/fields/{id}
///
/// The path id wins over any id in the body.
pub async fn update_field(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(mut field): Json<Field>,
) -> Response {
    field.id = id;
    match state.scheduler.update_field(&field).await {
        Ok(()) => ApiResponse::ok(FieldView::from(field)).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// DELETE /api/v1/fields/{id}
///
/// Open demands on the field are withdrawn; a delivery in progress is
/// aborted.
pub async fn delete_field(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.scheduler.remove_field(&id).await {
        Ok(()) => ApiResponse::ok("deleted").into_response(),
        Err(e) => scheduler_error(e),
    }
}

// ── Demands ────────────────────────────────────────────────────

#[derive(serde::Deserialize)]
pub struct DemandQuery {
    pub status: Option<DemandStatus>,
}

/// GET /api/v1/demands
pub async fn list_demands(State(state): State<ApiState>, Query(query): Query<DemandQuery>) -> Response {
    ApiResponse::ok(state.scheduler.list_demands(query.status).await).into_response()
}

/// POST /api/v1/demands
pub async fn submit_demand(State(state): State<ApiState>, Json(req): Json<NewDemand>) -> Response {
    match state.scheduler.submit(req).await {
        Ok(demand) => (StatusCode::CREATED, ApiResponse::ok(demand)).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// GET /api/v1/demands/{id}
pub async fn get_demand(State(state): State<ApiState>, Path(id): Path<DemandId>) -> Response {
    match state.scheduler.get_demand(id).await {
        Some(demand) => ApiResponse::ok(demand).into_response(),
        None => error_response("demand not found", StatusCode::NOT_FOUND),
    }
}

/// POST /api/v1/demands/{id}/review
pub async fn review_demand(State(state): State<ApiState>, Path(id): Path<DemandId>) -> Response {
    match state.scheduler.review(id).await {
        Ok(demand) => ApiResponse::ok(demand).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// POST /api/v1/demands/{id}/approve
pub async fn approve_demand(State(state): State<ApiState>, Path(id): Path<DemandId>) -> Response {
    match state.scheduler.approve(id).await {
        Ok(demand) => ApiResponse::ok(demand).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// Optional body for a rejection.
#[derive(serde::Deserialize, Default)]
pub struct RejectRequest {
    pub reason: Option<String>,
}

/// POST /api/v1/demands/{id}/reject
pub async fn reject_demand(
    State(state): State<ApiState>,
    Path(id): Path<DemandId>,
    body: Option<Json<RejectRequest>>,
) -> Response {
    let reason = body.and_then(|Json(req)| req.reason);
    match state.scheduler.reject(id, reason).await {
        Ok(demand) => ApiResponse::ok(demand).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// POST /api/v1/demands/{id}/cancel
pub async fn cancel_demand(State(state): State<ApiState>, Path(id): Path<DemandId>) -> Response {
    match state.scheduler.cancel(id).await {
        Ok(demand) => ApiResponse::ok(demand).into_response(),
        Err(e) => scheduler_error(e),
    }
}

#[derive(serde::Serialize)]
pub struct WaitEstimate {
    pub demand_id: DemandId,
    /// `None` when the demand is not waiting or there is no usable flow.
    pub estimated_wait_seconds: Option<f64>,
    /// Always true: the figure assumes the current flow holds.
    pub is_estimate: bool,
}

/// GET /api/v1/demands/{id}/wait
pub async fn demand_wait(State(state): State<ApiState>, Path(id): Path<DemandId>) -> Response {
    match state.scheduler.estimated_wait_seconds(id).await {
        Ok(estimated_wait_seconds) => ApiResponse::ok(WaitEstimate {
            demand_id: id,
            estimated_wait_seconds,
            is_estimate: true,
        })
        .into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// GET /api/v1/demands/{id}/deliveries
pub async fn list_deliveries(State(state): State<ApiState>, Path(id): Path<DemandId>) -> Response {
    match state.scheduler.deliveries(id).await {
        Ok(records) => ApiResponse::ok(records).into_response(),
        Err(e) => scheduler_error(e),
    }
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let metrics = crate::prometheus::CanalMetrics {
        telemetry: state.telemetry.latest(),
        demands: state.scheduler.list_demands(None).await,
        session: state.scheduler.session().await,
    };
    let body = crate::prometheus::render_prometheus(&metrics);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_state, wheat_field};

    #[tokio::test]
    async fn list_fields_empty() {
        let state = test_state();
        let resp = list_fields(State(state)).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_and_get_field() {
        let state = test_state();
        let resp = create_field(State(state.clone()), Json(wheat_field("f1", 10.0))).await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = get_field(State(state.clone()), Path("f1".to_string())).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = create_field(State(state), Json(wheat_field("f1", 10.0))).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_creates_admit_one_field() {
        let state = test_state();
        let handles: Vec<_> = (1..=8)
            .map(|size| {
                let state = state.clone();
                tokio::spawn(create_field(State(state), Json(wheat_field("f1", size as f64))))
            })
            .collect();

        let mut created = Vec::new();
        let mut conflicts = 0;
        for (i, handle) in handles.into_iter().enumerate() {
            match handle.await.unwrap().status() {
                StatusCode::CREATED => created.push(i + 1),
                StatusCode::CONFLICT => conflicts += 1,
                other => panic!("unexpected status {other}"),
            }
        }
        assert_eq!(created.len(), 1);
        assert_eq!(conflicts, 7);
        let stored = state.store.get_field("f1").unwrap().unwrap();
        assert_eq!(stored.size_ha, created[0] as f64);
    }

    #[tokio::test]
    async fn invalid_field_is_bad_request() {
        let state = test_state();
        let resp = create_field(State(state), Json(wheat_field("f1", -1.0))).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn update_recomputes_water_need() {
        let state = test_state();
        state.store.put_field(&wheat_field("f1", 10.0)).unwrap();

        let resp = update_field(
            State(state.clone()),
            Path("f1".to_string()),
            Json(wheat_field("ignored", 20.0)),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let stored = state.store.get_field("f1").unwrap().unwrap();
        assert_eq!(stored.water_need(), 18000.0);
        assert!(state.store.get_field("ignored").unwrap().is_none());

        let resp = update_field(State(state), Path("nope".to_string()), Json(wheat_field("nope", 1.0))).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_nonexistent_field() {
        let state = test_state();
        let resp = delete_field(State(state), Path("nope".to_string())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn submit_unknown_field_is_bad_request() {
        let state = test_state();
        let req = NewDemand {
            field_id: "nope".to_string(),
            requested_volume_m3: Some(10.0),
            requested_start: state.telemetry.now(),
            notes: None,
        };
        let resp = submit_demand(State(state), Json(req)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn demand_lifecycle_over_handlers() {
        let state = test_state();
        state.store.put_field(&wheat_field("f1", 10.0)).unwrap();
        let req = NewDemand {
            field_id: "f1".to_string(),
            requested_volume_m3: None,
            requested_start: state.telemetry.now(),
            notes: None,
        };
        let resp = submit_demand(State(state.clone()), Json(req)).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let demand = state.scheduler.get_demand(1).await.unwrap();
        assert_eq!(demand.requested_volume_m3, 9000.0);

        let resp = approve_demand(State(state.clone()), Path(1)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = approve_demand(State(state.clone()), Path(1)).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = demand_wait(State(state.clone()), Path(1)).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = cancel_demand(State(state.clone()), Path(1)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = cancel_demand(State(state.clone()), Path(1)).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = get_demand(State(state), Path(99)).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn reject_without_body() {
        let state = test_state();
        state.store.put_field(&wheat_field("f1", 10.0)).unwrap();
        let d = state
            .scheduler
            .submit(NewDemand {
                field_id: "f1".to_string(),
                requested_volume_m3: Some(10.0),
                requested_start: state.telemetry.now(),
                notes: None,
            })
            .await
            .unwrap();
        let resp = reject_demand(State(state.clone()), Path(d.id), None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            state.scheduler.get_demand(d.id).await.unwrap().status,
            DemandStatus::Rejected
        );
    }

    #[tokio::test]
    async fn deliveries_for_unknown_demand() {
        let state = test_state();
        let resp = list_deliveries(State(state), Path(5)).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn prometheus_endpoint_returns_text() {
        let state = test_state();
        let resp = prometheus_metrics(State(state)).await;
        let resp = resp.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp.headers().get("content-type").unwrap().to_str().unwrap();
        assert!(content_type.contains("text/plain"));
    }
}
