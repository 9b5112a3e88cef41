use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use utoipa::ToSchema;

use crate::config::Permission;
use crate::scheduler::parser::{check_known, parse_manual_request};
use crate::scheduler::{ScheduleUpdate, StoredRequest};
use crate::web::api::error::{ApiResult, ErrorResponse};
use crate::web::auth::{require_permission, AppState, AuthenticatedUser};

#[derive(Debug, Deserialize, ToSchema)]
pub struct ManualSubmission {
    /// Configured satellite name
    pub satellite: String,
    /// RFC 3339, `YYYY-MM-DD HH:MM:SS` (UTC) or `T+10m`
    pub start: String,
    /// Minutes, or a duration such as `12m30s`
    pub duration: String,
}

#[utoipa::path(
    post,
    path = "/api/manual",
    tag = "manual",
    request_body = ManualSubmission,
    responses(
        (status = 201, description = "Manual recording scheduled", body = StoredRequest),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 401, description = "Missing or invalid API key"),
        (status = 403, description = "Insufficient permissions"),
        (status = 409, description = "Overlaps an existing request", body = ErrorResponse)
    ),
    security(("api_key" = []))
)]
pub async fn submit_manual(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<ManualSubmission>,
) -> ApiResult<impl IntoResponse> {
    require_permission(&user, Permission::SubmitManual)?;

    let request = parse_manual_request(&body.satellite, &body.start, &body.duration, Utc::now())?;
    check_known(&request, &state.config)?;

    let stored = state.store.submit(request.clone())?;
    log::info!("{} submitted manual request {}", user.name, stored.id);
    notify(&state, ScheduleUpdate::UpsertManual(request)).await;

    Ok((StatusCode::CREATED, Json(stored)))
}

#[utoipa::path(
    get,
    path = "/api/manual",
    tag = "manual",
    responses(
        (status = 200, description = "Stored manual requests", body = Vec<StoredRequest>),
        (status = 401, description = "Missing or invalid API key"),
        (status = 403, description = "Insufficient permissions")
    ),
    security(("api_key" = []))
)]
pub async fn list_manual(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> ApiResult<Json<Vec<StoredRequest>>> {
    require_permission(&user, Permission::ListSchedule)?;
    Ok(Json(state.store.list()?))
}

#[utoipa::path(
    delete,
    path = "/api/manual/{id}",
    tag = "manual",
    params(("id" = String, Path, description = "Manual request ID")),
    responses(
        (status = 200, description = "Manual request cancelled", body = StoredRequest),
        (status = 401, description = "Missing or invalid API key"),
        (status = 403, description = "Insufficient permissions"),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    security(("api_key" = []))
)]
pub async fn cancel_manual(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
) -> ApiResult<Json<StoredRequest>> {
    require_permission(&user, Permission::SubmitManual)?;

    let stored = state.store.delete(&id)?;
    log::info!("{} cancelled manual request {}", user.name, id);
    notify(&state, ScheduleUpdate::RemoveManual(stored.request.key())).await;

    Ok(Json(stored))
}

/// The store is the source of truth; a missed message is picked up by the
/// next store sync.
async fn notify(state: &AppState, update: ScheduleUpdate) {
    if state.updates.send(update).await.is_err() {
        log::warn!("Recording manager is not running; update stays in the store");
    }
}

