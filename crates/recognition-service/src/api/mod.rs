pub mod routes;

use crate::state::AppState;
use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::trace::TraceLayer;

/// Build the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        // Health and metrics endpoints
        .route("/healthz", get(routes::healthz))
        .route("/readyz", get(routes::readyz))
        .route("/metrics", get(routes::metrics))
        // Camera management
        .route("/v1/cameras", get(routes::list_cameras).post(routes::upsert_camera))
        .route("/v1/cameras/start", post(routes::start_camera))
        .route("/v1/cameras/reload", post(routes::reload_cameras))
        .route("/v1/cameras/cleanup", post(routes::cleanup_cameras))
        .route("/v1/cameras/:id", get(routes::get_camera).delete(routes::remove_camera))
        .route("/v1/cameras/:id/stop", post(routes::stop_camera))
        .route("/v1/cameras/:id/status", get(routes::camera_status))
        // Live views
        .route("/v1/cameras/:id/snapshot", get(routes::snapshot))
        .route("/v1/cameras/:id/mjpeg", get(routes::mjpeg))
        .route("/v1/cameras/:id/events/stream", get(routes::event_stream))
        .route("/v1/cameras/:id/events/recent", get(routes::recent_events))
        // Event log
        .route("/v1/events", get(routes::list_events))
        .route("/v1/events/query", get(routes::query_events))
        .route("/v1/events/summary", get(routes::event_summary))
        .route("/v1/events/:id/full-image", get(routes::event_full_image))
        // Gallery and settings
        .route("/v1/gallery", get(routes::list_gallery).post(routes::upsert_gallery_entry))
        .route("/v1/gallery/:person_id", delete(routes::remove_gallery_entry))
        .route(
            "/v1/settings/quality-threshold",
            get(routes::get_quality_threshold).put(routes::set_quality_threshold),
        )
        // Analysis jobs
        .route("/v1/jobs", post(routes::submit_job))
        .route("/v1/jobs/:id", get(routes::get_job))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
