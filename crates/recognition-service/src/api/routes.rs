use crate::hub::NextEvent;
use crate::jobs::JobError;
use crate::registry::RegistryError;
use crate::state::AppState;
use crate::worker::WorkerStatus;
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    Json,
};
use common::cameras::CameraConfig;
use common::events::{AlertLevel, EventQuery, EventType, SortColumn, SortOrder, DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT};
use common::gallery::GalleryEntry;
use common::jobs::JobSubmitRequest;
use common::validation::now_millis;
use futures::stream::{self, Stream};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::str::FromStr;
use std::time::Duration;
use tracing::{error, info};

/// Idle time after which an SSE comment is sent to keep proxies from closing the stream
const SSE_KEEPALIVE: Duration = Duration::from_secs(15);
const SSE_EVENT_NAME: &str = "rtsp_match";
const MJPEG_BOUNDARY: &str = "frame";

fn error_body(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (status, Json(json!({ "error": message.to_string() }))).into_response()
}

fn internal_error(e: impl std::fmt::Display) -> Response {
    error!("request failed: {}", e);
    error_body(StatusCode::INTERNAL_SERVER_ERROR, e)
}

fn registry_error(e: RegistryError) -> Response {
    match e {
        RegistryError::Invalid(_) => error_body(StatusCode::BAD_REQUEST, e),
        RegistryError::NotFound(_) => error_body(StatusCode::NOT_FOUND, e),
        RegistryError::Store(_) => internal_error(e),
    }
}

fn job_error(e: JobError) -> Response {
    match e {
        JobError::Invalid(_) => error_body(StatusCode::BAD_REQUEST, e),
        JobError::Store(_) => internal_error(e),
    }
}

fn camera_not_found(id: &str) -> Response {
    registry_error(RegistryError::NotFound(id.to_string()))
}

/// Health check endpoint
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness check endpoint
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let running = state.registry().running_ids().await;
    (
        StatusCode::OK,
        Json(json!({
            "status": "ready",
            "node_id": state.node_id(),
            "recognizer": state.recognizer_name(),
            "cameras_running": running.len(),
            "version": common::VERSION,
        })),
    )
}

/// Prometheus metrics endpoint
pub async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let families = telemetry::metrics::REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        return internal_error(e);
    }
    ([(header::CONTENT_TYPE, encoder.format_type().to_string())], buffer).into_response()
}

#[derive(Debug, Serialize)]
pub struct CameraView {
    #[serde(flatten)]
    pub config: CameraConfig,
    pub running: bool,
    pub status: Option<WorkerStatus>,
}

/// List camera configs together with their worker status
pub async fn list_cameras(State(state): State<AppState>) -> Response {
    let configs = match state.registry().list().await {
        Ok(configs) => configs,
        Err(e) => return registry_error(e),
    };
    let mut cameras = Vec::with_capacity(configs.len());
    for config in configs {
        let status = state.registry().worker(&config.id).await.map(|w| w.status());
        cameras.push(CameraView {
            running: status.is_some(),
            status,
            config,
        });
    }
    (StatusCode::OK, Json(json!({ "cameras": cameras }))).into_response()
}

pub async fn get_camera(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.registry().get(&id).await {
        Ok(Some(config)) => {
            let status = state.registry().worker(&id).await.map(|w| w.status());
            let view = CameraView {
                running: status.is_some(),
                status,
                config,
            };
            (StatusCode::OK, Json(view)).into_response()
        }
        Ok(None) => camera_not_found(&id),
        Err(e) => registry_error(e),
    }
}

/// Save a camera config without starting it
pub async fn upsert_camera(State(state): State<AppState>, Json(config): Json<CameraConfig>) -> Response {
    match state.registry().upsert(&config).await {
        Ok(stored) => (StatusCode::OK, Json(stored)).into_response(),
        Err(e) => registry_error(e),
    }
}

/// Validate and start a camera, replacing any running worker for it
pub async fn start_camera(State(state): State<AppState>, Json(config): Json<CameraConfig>) -> Response {
    match state.registry().start(&config).await {
        Ok(stored) => {
            info!(camera_id = %stored.id, "camera started via API");
            (
                StatusCode::OK,
                Json(json!({
                    "success": true,
                    "camera": stored,
                })),
            )
                .into_response()
        }
        Err(e) => registry_error(e),
    }
}

pub async fn stop_camera(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.registry().stop(&id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "message": format!("camera '{}' stopped", id),
            })),
        )
            .into_response(),
        Err(e) => registry_error(e),
    }
}

pub async fn remove_camera(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.registry().remove(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => registry_error(e),
    }
}

pub async fn reload_cameras(State(state): State<AppState>) -> Response {
    match state.registry().reload().await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => registry_error(e),
    }
}

pub async fn cleanup_cameras(State(state): State<AppState>) -> Response {
    match state.registry().cleanup().await {
        Ok(removed) => (StatusCode::OK, Json(json!({ "removed": removed }))).into_response(),
        Err(e) => registry_error(e),
    }
}

pub async fn camera_status(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.registry().worker(&id).await {
        Some(worker) => (StatusCode::OK, Json(worker.status())).into_response(),
        None => camera_not_found(&id),
    }
}

/// Latest preview JPEG; 204 until the worker has produced one
pub async fn snapshot(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(worker) = state.registry().worker(&id).await else {
        return camera_not_found(&id);
    };
    match worker.preview() {
        Some(frame) => ([(header::CONTENT_TYPE, "image/jpeg")], frame.jpeg.clone()).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

fn mjpeg_part(jpeg: &[u8]) -> Vec<u8> {
    let mut part = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        MJPEG_BOUNDARY,
        jpeg.len()
    )
    .into_bytes();
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part
}

/// Multipart MJPEG stream; each preview frame is sent once, ending when the worker stops
pub async fn mjpeg(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(worker) = state.registry().worker(&id).await else {
        return camera_not_found(&id);
    };
    let mut preview = worker.watch_preview();
    preview.mark_changed();

    let frames = stream::unfold(preview, |mut preview| async move {
        loop {
            preview.changed().await.ok()?;
            let frame = preview.borrow_and_update().clone();
            if let Some(frame) = frame {
                return Some((Ok::<_, Infallible>(mjpeg_part(&frame.jpeg)), preview));
            }
        }
    });

    (
        [
            (
                header::CONTENT_TYPE,
                format!("multipart/x-mixed-replace; boundary={}", MJPEG_BOUNDARY),
            ),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        Body::from_stream(frames),
    )
        .into_response()
}

fn live_events(subscription: crate::hub::Subscription) -> impl Stream<Item = Result<Event, axum::Error>> {
    stream::unfold(subscription, |subscription| async move {
        let event = match subscription.next(SSE_KEEPALIVE).await {
            NextEvent::Event(event) => Event::default().event(SSE_EVENT_NAME).json_data(&event),
            NextEvent::Timeout => Ok(Event::default().comment("keepalive")),
            NextEvent::Closed => return None,
        };
        Some((event, subscription))
    })
}

/// Server-sent live recognition events for one camera
pub async fn event_stream(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(worker) = state.registry().worker(&id).await else {
        return camera_not_found(&id);
    };
    let subscription = worker.hub().subscription();
    info!(camera_id = %id, subscriber = subscription.id(), "live event subscriber connected");
    Sse::new(live_events(subscription)).into_response()
}

pub async fn recent_events(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.registry().worker(&id).await {
        Some(worker) => (StatusCode::OK, Json(json!({ "events": worker.hub().recent() }))).into_response(),
        None => camera_not_found(&id),
    }
}

#[derive(Debug, Deserialize)]
pub struct ListEventsParams {
    pub limit: Option<u32>,
    pub matched: Option<bool>,
}

pub async fn list_events(State(state): State<AppState>, Query(params): Query<ListEventsParams>) -> Response {
    let limit = params.limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT);
    match state.stores().events.list(limit, params.matched).await {
        Ok(events) => (StatusCode::OK, Json(json!({ "events": events }))).into_response(),
        Err(e) => internal_error(e),
    }
}

/// Query-string form of [`EventQuery`]; list filters are comma separated
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct EventQueryParams {
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
    pub last_hours: Option<f64>,
    pub matched_only: bool,
    pub min_confidence: Option<f32>,
    pub max_confidence: Option<f32>,
    pub person_name: Option<String>,
    pub min_quality: Option<f32>,
    pub max_quality: Option<f32>,
    pub exclude_low_quality: bool,
    pub min_face_size: Option<i32>,
    pub camera_ids: Option<String>,
    pub alert_levels: Option<String>,
    pub event_types: Option<String>,
    pub sort_by: Option<SortColumn>,
    pub order: Option<SortOrder>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

fn split_list(raw: Option<&str>) -> impl Iterator<Item = &str> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn parse_list<T: FromStr>(raw: Option<&str>) -> Result<Vec<T>, T::Err> {
    split_list(raw).map(T::from_str).collect()
}

impl EventQueryParams {
    pub fn into_query(self) -> Result<EventQuery, String> {
        let alert_levels = parse_list::<AlertLevel>(self.alert_levels.as_deref()).map_err(|e| e.to_string())?;
        let event_types = parse_list::<EventType>(self.event_types.as_deref()).map_err(|e| e.to_string())?;
        let camera_ids = split_list(self.camera_ids.as_deref()).map(str::to_string).collect();
        Ok(EventQuery {
            start_ms: self.start_ms,
            end_ms: self.end_ms,
            last_hours: self.last_hours,
            matched_only: self.matched_only,
            min_confidence: self.min_confidence,
            max_confidence: self.max_confidence,
            person_name: self.person_name,
            min_quality: self.min_quality,
            max_quality: self.max_quality,
            exclude_low_quality: self.exclude_low_quality,
            min_face_size: self.min_face_size,
            camera_ids,
            alert_levels,
            event_types,
            sort_by: self.sort_by.unwrap_or_default(),
            order: self.order.unwrap_or_default(),
            page: self.page.unwrap_or(1),
            limit: self.limit.unwrap_or(DEFAULT_PAGE_LIMIT),
        }
        .normalized(now_millis()))
    }
}

pub async fn query_events(State(state): State<AppState>, Query(params): Query<EventQueryParams>) -> Response {
    let query = match params.into_query() {
        Ok(query) => query,
        Err(e) => return error_body(StatusCode::BAD_REQUEST, e),
    };
    match state.stores().events.query(&query).await {
        Ok(page) => (StatusCode::OK, Json(page)).into_response(),
        Err(e) => internal_error(e),
    }
}

pub async fn event_summary(State(state): State<AppState>) -> Response {
    match state.stores().events.summary().await {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(e) => internal_error(e),
    }
}

/// Annotated full frame saved with a matched event
pub async fn event_full_image(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    let event = match state.stores().events.get(id).await {
        Ok(Some(event)) => event,
        Ok(None) => return error_body(StatusCode::NOT_FOUND, format!("event {} not found", id)),
        Err(e) => return internal_error(e),
    };
    let Some(relpath) = event.event.full_image_path.as_deref() else {
        return error_body(StatusCode::NOT_FOUND, format!("event {} has no full image", id));
    };
    match state.media().read(relpath).await {
        Ok(Some(jpeg)) => ([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response(),
        Ok(None) => error_body(StatusCode::NOT_FOUND, format!("full image for event {} is missing", id)),
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct GalleryParams {
    pub group_id: Option<String>,
}

pub async fn list_gallery(State(state): State<AppState>, Query(params): Query<GalleryParams>) -> Response {
    match state.stores().gallery.snapshot().await {
        Ok(mut entries) => {
            if let Some(group) = params.group_id.as_deref() {
                entries.retain(|e| e.group_id.as_deref() == Some(group));
            }
            (StatusCode::OK, Json(json!({ "people": entries }))).into_response()
        }
        Err(e) => internal_error(e),
    }
}

/// Forget a known person; running watchlist cameras keep their snapshot until reload
pub async fn remove_gallery_entry(State(state): State<AppState>, Path(person_id): Path<String>) -> Response {
    match state.stores().gallery.remove(&person_id).await {
        Ok(true) => {
            info!(person_id = %person_id, "gallery entry removed");
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => error_body(StatusCode::NOT_FOUND, format!("person '{}' not found", person_id)),
        Err(e) => internal_error(e),
    }
}

/// Add or replace a known person; running watchlist cameras pick it up on reload
pub async fn upsert_gallery_entry(State(state): State<AppState>, Json(entry): Json<GalleryEntry>) -> Response {
    if let Err(e) = common::validation::validate_id(&entry.person_id, "person_id")
        .and_then(|_| common::validation::validate_name(&entry.name, "name"))
    {
        return error_body(StatusCode::BAD_REQUEST, e);
    }
    if entry.embeddings.is_empty() || entry.embeddings.iter().any(|e| e.is_empty()) {
        return error_body(StatusCode::BAD_REQUEST, "at least one non-empty embedding is required");
    }
    match state.stores().gallery.upsert(&entry).await {
        Ok(()) => {
            info!(person_id = %entry.person_id, "gallery entry saved");
            (StatusCode::OK, Json(json!({ "success": true, "person_id": entry.person_id }))).into_response()
        }
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct QualityThresholdRequest {
    pub threshold: f32,
}

pub async fn get_quality_threshold(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "threshold": state.quality().get() })))
}

pub async fn set_quality_threshold(
    State(state): State<AppState>,
    Json(request): Json<QualityThresholdRequest>,
) -> Response {
    match state.quality().set(request.threshold) {
        Ok(()) => {
            info!(threshold = request.threshold, "quality threshold updated");
            (StatusCode::OK, Json(json!({ "threshold": state.quality().get() }))).into_response()
        }
        Err(e) => error_body(StatusCode::BAD_REQUEST, e),
    }
}

/// Accept an analysis job; progress and results are read back from `/v1/jobs/:id`
pub async fn submit_job(State(state): State<AppState>, Json(request): Json<JobSubmitRequest>) -> Response {
    match state.jobs().submit(&request.job_type, request.payload).await {
        Ok(record) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "job_id": record.id,
                "status": record.status,
            })),
        )
            .into_response(),
        Err(e) => job_error(e),
    }
}

pub async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.jobs().get(&id).await {
        Ok(Some(record)) => (StatusCode::OK, Json(record)).into_response(),
        Ok(None) => error_body(StatusCode::NOT_FOUND, format!("job '{}' not found", id)),
        Err(e) => job_error(e),
    }
}
