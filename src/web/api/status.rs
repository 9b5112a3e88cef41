use axum::{extract::State, Json};

use crate::config::Permission;
use crate::scheduler::ManagerStatus;
use crate::web::api::error::ApiResult;
use crate::web::auth::{require_permission, AppState, AuthenticatedUser};

#[utoipa::path(
    get,
    path = "/api/radio",
    tag = "radio",
    responses(
        (status = 200, description = "Receiver session and tracked passes", body = ManagerStatus),
        (status = 401, description = "Missing or invalid API key"),
        (status = 403, description = "Insufficient permissions")
    ),
    security(("api_key" = []))
)]
pub async fn radio_status(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> ApiResult<Json<ManagerStatus>> {
    require_permission(&user, Permission::ViewRadio)?;
    Ok(Json(state.manager.borrow().clone()))
}
