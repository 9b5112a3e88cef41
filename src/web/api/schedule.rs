use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use utoipa::ToSchema;

use crate::config::Permission;
use crate::predict::PredictorStatus;
use crate::scheduler::{schedule, ScheduleEntry};
use crate::web::api::error::{ApiError, ApiResult, ErrorResponse};
use crate::web::auth::{require_permission, AppState, AuthenticatedUser};

#[derive(Debug, Serialize, ToSchema)]
pub struct ScheduleResponse {
    pub entries: Vec<ScheduleEntry>,
    pub predictor: PredictorStatus,
}

#[utoipa::path(
    get,
    path = "/api/schedule",
    tag = "schedule",
    responses(
        (status = 200, description = "Active and superseded pass events", body = ScheduleResponse),
        (status = 401, description = "Missing or invalid API key"),
        (status = 403, description = "Insufficient permissions")
    ),
    security(("api_key" = []))
)]
pub async fn list_schedule(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> ApiResult<Json<ScheduleResponse>> {
    require_permission(&user, Permission::ListSchedule)?;

    let entries = schedule::lock(&state.schedule).entries();
    let predictor = state.predictor.borrow().clone();
    Ok(Json(ScheduleResponse { entries, predictor }))
}

#[utoipa::path(
    post,
    path = "/api/refresh",
    tag = "schedule",
    responses(
        (status = 202, description = "Refresh queued"),
        (status = 401, description = "Missing or invalid API key"),
        (status = 403, description = "Insufficient permissions"),
        (status = 503, description = "Refresh task not running", body = ErrorResponse)
    ),
    security(("api_key" = []))
)]
pub async fn trigger_refresh(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> ApiResult<impl IntoResponse> {
    require_permission(&user, Permission::TriggerRefresh)?;

    match state.refresh.try_send(()) {
        // A full queue means a refresh is already pending.
        Ok(()) | Err(tokio::sync::mpsc::error::TrySendError::Full(())) => {
            log::info!("Refresh requested by {}", user.name);
            Ok(StatusCode::ACCEPTED)
        }
        Err(tokio::sync::mpsc::error::TrySendError::Closed(())) => {
            Err(ApiError::Unavailable("refresh_task_stopped"))
        }
    }
}
