use axum::{extract::State, Json};

use crate::config::Permission;
use crate::scheduler::RecordingSession;
use crate::web::api::error::{ApiError, ApiResult};
use crate::web::auth::{require_permission, AppState, AuthenticatedUser};

#[utoipa::path(
    get,
    path = "/api/recordings",
    tag = "recordings",
    responses(
        (status = 200, description = "Latest record of every recording session", body = Vec<RecordingSession>),
        (status = 401, description = "Missing or invalid API key"),
        (status = 403, description = "Insufficient permissions")
    ),
    security(("api_key" = []))
)]
pub async fn list_recordings(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> ApiResult<Json<Vec<RecordingSession>>> {
    require_permission(&user, Permission::ListRecordings)?;

    let sessions = state
        .outcomes
        .sessions()
        .map_err(|e| ApiError::Storage(e.to_string()))?;
    Ok(Json(sessions))
}
