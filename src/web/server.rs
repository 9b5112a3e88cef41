use axum::{
    routing::{delete, get, post},
    Router,
};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use super::api::{manual, recordings, schedule, status};
use super::api_doc::ApiDoc;
use super::auth::AppState;

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/schedule", get(schedule::list_schedule))
        .route("/api/refresh", post(schedule::trigger_refresh))
        .route("/api/manual", get(manual::list_manual))
        .route("/api/manual", post(manual::submit_manual))
        .route("/api/manual/{id}", delete(manual::cancel_manual))
        .route("/api/recordings", get(recordings::list_recordings))
        .route("/api/radio", get(status::radio_status))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(
    state: AppState,
    bind_addr: String,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let app = router(state);

    log::info!("Starting server on {}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            log::info!("Web server shutting down");
        })
        .await
}
