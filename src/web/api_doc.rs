use utoipa::{
    openapi::security::{Http, HttpAuthScheme, SecurityScheme},
    Modify, OpenApi,
};

use super::api::error::ErrorResponse;
use super::api::manual::ManualSubmission;
use super::api::schedule::ScheduleResponse;

#[derive(OpenApi)]
#[openapi(
    paths(
        super::api::schedule::list_schedule,
        super::api::schedule::trigger_refresh,
        super::api::manual::submit_manual,
        super::api::manual::list_manual,
        super::api::manual::cancel_manual,
        super::api::recordings::list_recordings,
        super::api::status::radio_status,
    ),
    components(
        schemas(
            ScheduleResponse,
            ManualSubmission,
            ErrorResponse,
            crate::scheduler::ScheduleEntry,
            crate::scheduler::StoredRequest,
            crate::scheduler::RecordingSession,
            crate::scheduler::ManagerStatus,
            crate::predict::PredictorStatus,
            crate::radio::ControllerSession,
        )
    ),
    modifiers(&SecurityAddon),
    info(
        title = "Pass-O-Mat API",
        description = "Pass schedule, manual overrides and recording outcomes",
        version = "0.1.0"
    ),
    tags(
        (name = "schedule", description = "Predicted and manual pass schedule"),
        (name = "manual", description = "Manual recording requests"),
        (name = "recordings", description = "Recording outcomes"),
        (name = "radio", description = "Receiver status")
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "api_key",
                SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
            );
        }
    }
}
