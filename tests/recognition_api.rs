/// Integration tests for the recognition service HTTP API
use common::events::{BoundingBox, EventPage, EventSummary};
use common::jobs::{JobRecord, JobStatus};
use recognition_service::{
    api,
    config::ServiceConfig,
    recognizer::{Face, ScriptedRecognizer},
    source::ScriptedSource,
    state::{build_state, AppState},
    store::Stores,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

struct TestService {
    server: axum_test::TestServer,
    state: AppState,
    dir: tempfile::TempDir,
}

/// A service whose recognizer sees one face with embedding [1, 0] in every frame
fn setup_test_service() -> TestService {
    let dir = tempfile::tempdir().unwrap();
    let config = ServiceConfig {
        data_dir: dir.path().to_path_buf(),
        node_id: "test-node".to_string(),
        ..ServiceConfig::default()
    };
    let recognizer = Arc::new(ScriptedRecognizer::new().with_fallback(vec![Face {
        bbox: BoundingBox::new(10, 10, 58, 58),
        detection_score: 0.95,
        embedding: vec![1.0, 0.0],
    }]));
    let source = Arc::new(ScriptedSource::solid(96, 96));
    let state = build_state(&config, Stores::in_memory(), recognizer, source.clone(), source);
    let server = axum_test::TestServer::new(api::router(state.clone())).unwrap();
    TestService {
        server,
        state,
        dir,
    }
}

fn single_target_camera(id: &str) -> Value {
    json!({
        "id": id,
        "url": "rtsp://camera.local/stream",
        "mode": "single_target",
        "target_embedding": [2.0, 0.0],
        "threshold": 0.5,
        "fps": 10.0,
    })
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test]
async fn test_health_and_readiness() {
    let service = setup_test_service();

    let response = service.server.get("/healthz").await;
    assert_eq!(response.status_code(), 200);

    let response = service.server.get("/readyz").await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["recognizer"], "scripted");
    assert_eq!(body["node_id"], "test-node");
    assert_eq!(body["cameras_running"], 0);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let service = setup_test_service();
    let response = service.server.get("/metrics").await;
    assert_eq!(response.status_code(), 200);
    assert!(response.header("content-type").to_str().unwrap().starts_with("text/plain"));
}

#[tokio::test]
async fn test_start_camera_persists_and_records_matches() {
    let service = setup_test_service();

    let response = service
        .server
        .post("/v1/cameras/start")
        .json(&single_target_camera("cam-1"))
        .await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["camera"]["enabled"], true);
    assert_eq!(body["camera"]["target_embedding"], json!([1.0, 0.0]));

    let worker = service.state.registry().worker("cam-1").await.unwrap();
    wait_for(|| worker.status().matches_count > 0).await;

    let response = service.server.get("/v1/cameras/cam-1/status").await;
    assert_eq!(response.status_code(), 200);
    let status: Value = response.json();
    assert_eq!(status["camera_id"], "cam-1");
    assert_eq!(status["state"], "streaming");

    let response = service.server.get("/v1/events").add_query_param("matched", true).await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    let events = body["events"].as_array().unwrap();
    assert!(!events.is_empty());
    assert_eq!(events[0]["camera_id"], "cam-1");
    assert_eq!(events[0]["event_type"], "recognized");

    let response = service.server.get("/v1/cameras/cam-1/events/recent").await;
    let body: Value = response.json();
    assert!(!body["events"].as_array().unwrap().is_empty());

    service.state.shutdown().await;
}

#[tokio::test]
async fn test_invalid_camera_is_rejected() {
    let service = setup_test_service();

    // single target without an embedding
    let response = service
        .server
        .post("/v1/cameras/start")
        .json(&json!({ "id": "cam-1", "url": "rtsp://camera.local/stream", "mode": "single_target" }))
        .await;
    assert_eq!(response.status_code(), 400);
    let body: Value = response.json();
    assert!(body["error"].as_str().unwrap().contains("target_embedding"));

    // watchlist with an empty gallery
    let response = service
        .server
        .post("/v1/cameras/start")
        .json(&json!({ "id": "cam-2", "url": "rtsp://camera.local/stream" }))
        .await;
    assert_eq!(response.status_code(), 400);

    let response = service
        .server
        .post("/v1/cameras/start")
        .json(&json!({ "id": "cam-3", "url": "rtsp://x/$(reboot)", "target_embedding": [1.0], "mode": "single_target" }))
        .await;
    assert_eq!(response.status_code(), 400);

    assert!(service.state.registry().running_ids().await.is_empty());
}

#[tokio::test]
async fn test_stop_disables_camera_and_keeps_config() {
    let service = setup_test_service();
    service
        .server
        .post("/v1/cameras/start")
        .json(&single_target_camera("cam-1"))
        .await
        .assert_status_ok();

    let response = service.server.post("/v1/cameras/cam-1/stop").await;
    assert_eq!(response.status_code(), 200);

    let response = service.server.get("/v1/cameras/cam-1").await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["enabled"], false);
    assert_eq!(body["running"], false);
    assert_eq!(body["threshold"], 0.5);

    let response = service.server.get("/v1/cameras/cam-1/status").await;
    assert_eq!(response.status_code(), 404);

    let response = service.server.post("/v1/cameras/unknown/stop").await;
    assert_eq!(response.status_code(), 404);
}

#[tokio::test]
async fn test_reload_and_cleanup() {
    let service = setup_test_service();
    service
        .server
        .post("/v1/cameras/start")
        .json(&single_target_camera("cam-1"))
        .await
        .assert_status_ok();

    // saved but never started
    let mut idle = single_target_camera("cam-2");
    idle["enabled"] = json!(false);
    service.server.post("/v1/cameras").json(&idle).await.assert_status_ok();

    let response = service.server.post("/v1/cameras/reload").await;
    assert_eq!(response.status_code(), 200);
    let report: Value = response.json();
    assert_eq!(report["started"], json!(["cam-1"]));

    let response = service.server.post("/v1/cameras/cleanup").await;
    let body: Value = response.json();
    assert_eq!(body["removed"], json!(["cam-2"]));

    let response = service.server.get("/v1/cameras").await;
    let body: Value = response.json();
    let cameras = body["cameras"].as_array().unwrap();
    assert_eq!(cameras.len(), 1);
    assert_eq!(cameras[0]["id"], "cam-1");
    assert_eq!(cameras[0]["running"], true);

    service.state.shutdown().await;
}

#[tokio::test]
async fn test_snapshot_for_unknown_camera() {
    let service = setup_test_service();
    let response = service.server.get("/v1/cameras/missing/snapshot").await;
    assert_eq!(response.status_code(), 404);
}

#[tokio::test]
async fn test_snapshot_returns_latest_preview() {
    let service = setup_test_service();
    service
        .server
        .post("/v1/cameras/start")
        .json(&single_target_camera("cam-1"))
        .await
        .assert_status_ok();

    let worker = service.state.registry().worker("cam-1").await.unwrap();
    wait_for(|| worker.preview().is_some()).await;

    let response = service.server.get("/v1/cameras/cam-1/snapshot").await;
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.header("content-type"), "image/jpeg");
    assert_eq!(&response.as_bytes()[..2], &[0xFF, 0xD8]);

    service.state.shutdown().await;
}

#[tokio::test]
async fn test_event_query_and_summary() {
    let service = setup_test_service();
    service
        .server
        .post("/v1/cameras/start")
        .json(&single_target_camera("cam-1"))
        .await
        .assert_status_ok();
    let worker = service.state.registry().worker("cam-1").await.unwrap();
    wait_for(|| worker.status().matches_count > 0).await;
    service.state.shutdown().await;

    let response = service
        .server
        .get("/v1/events/query")
        .add_query_param("camera_ids", "cam-1,cam-9")
        .add_query_param("matched_only", true)
        .add_query_param("limit", 10)
        .await;
    assert_eq!(response.status_code(), 200);
    let page: EventPage = response.json();
    assert!(page.total_count >= 1);
    assert!(page.events.iter().all(|e| e.event.camera_id == "cam-1" && e.event.matched));

    let response = service
        .server
        .get("/v1/events/query")
        .add_query_param("alert_levels", "critical")
        .await;
    assert_eq!(response.status_code(), 400);

    let response = service.server.get("/v1/events/summary").await;
    let summary: EventSummary = response.json();
    assert_eq!(summary.total, page.total_count);
    assert_eq!(summary.matched, page.total_count);
}

#[tokio::test]
async fn test_quality_threshold_setting() {
    let service = setup_test_service();

    let response = service.server.get("/v1/settings/quality-threshold").await;
    let body: Value = response.json();
    assert!((body["threshold"].as_f64().unwrap() - 0.4).abs() < 1e-6);

    let response = service
        .server
        .put("/v1/settings/quality-threshold")
        .json(&json!({ "threshold": 0.7 }))
        .await;
    assert_eq!(response.status_code(), 200);
    assert!((service.state.quality().get() - 0.7).abs() < 1e-6);

    let response = service
        .server
        .put("/v1/settings/quality-threshold")
        .json(&json!({ "threshold": 1.5 }))
        .await;
    assert_eq!(response.status_code(), 400);
    assert!((service.state.quality().get() - 0.7).abs() < 1e-6);
}

#[tokio::test]
async fn test_gallery_enables_watchlist_cameras() {
    let service = setup_test_service();

    let response = service
        .server
        .post("/v1/gallery")
        .json(&json!({ "person_id": "p-1", "name": "Alice", "embeddings": [[0.0, 3.0]] }))
        .await;
    assert_eq!(response.status_code(), 200);

    let response = service.server.get("/v1/gallery").await;
    let body: Value = response.json();
    assert_eq!(body["people"][0]["embeddings"], json!([[0.0, 1.0]]));

    let response = service
        .server
        .post("/v1/gallery")
        .json(&json!({ "person_id": "p-2", "name": "Bob", "embeddings": [] }))
        .await;
    assert_eq!(response.status_code(), 400);

    let response = service
        .server
        .post("/v1/cameras/start")
        .json(&json!({ "id": "cam-w", "url": "rtsp://camera.local/stream", "fps": 10.0 }))
        .await;
    assert_eq!(response.status_code(), 200);

    service.state.shutdown().await;
}

#[tokio::test]
async fn test_compare_job_lifecycle() {
    let service = setup_test_service();
    let image_path = service.dir.path().join("face.png");
    image::RgbImage::from_pixel(64, 64, image::Rgb([200, 180, 160]))
        .save(&image_path)
        .unwrap();

    let response = service
        .server
        .post("/v1/jobs")
        .json(&json!({ "type": "compare", "payload": { "image_a": image_path, "image_b": image_path } }))
        .await;
    assert_eq!(response.status_code(), 202);
    let body: Value = response.json();
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let mut record: Option<JobRecord> = None;
    for _ in 0..200 {
        let current: JobRecord = service.server.get(&format!("/v1/jobs/{}", job_id)).await.json();
        if current.status.is_terminal() {
            record = Some(current);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let record = record.unwrap();
    assert_eq!(record.status, JobStatus::Done);
    assert_eq!(record.progress, 1.0);
    let result = record.result.unwrap();
    assert_eq!(result["is_same_person"], true);

    let response = service.server.get("/v1/jobs/job-missing").await;
    assert_eq!(response.status_code(), 404);
}

#[tokio::test]
async fn test_invalid_job_is_rejected() {
    let service = setup_test_service();

    let response = service
        .server
        .post("/v1/jobs")
        .json(&json!({ "type": "teleport", "payload": {} }))
        .await;
    assert_eq!(response.status_code(), 400);

    let response = service
        .server
        .post("/v1/jobs")
        .json(&json!({ "type": "compare", "payload": { "image_a": "/no/such.png", "image_b": "/no/such.png" } }))
        .await;
    assert_eq!(response.status_code(), 400);
}

fn watchlist_camera(id: &str) -> Value {
    json!({
        "id": id,
        "url": "rtsp://camera.local/stream",
        "mode": "watchlist",
        "threshold": 0.5,
        "fps": 10.0,
    })
}

async fn add_person(service: &TestService, person_id: &str, name: &str, embedding: Value) {
    service
        .server
        .post("/v1/gallery")
        .json(&json!({ "person_id": person_id, "name": name, "embeddings": [embedding] }))
        .await
        .assert_status_ok();
}

#[tokio::test]
async fn test_watchlist_match_names_the_person() {
    let service = setup_test_service();
    add_person(&service, "p-1", "Alice", json!([1.0, 0.0])).await;
    add_person(&service, "p-2", "Bob", json!([0.0, 1.0])).await;

    service
        .server
        .post("/v1/cameras/start")
        .json(&watchlist_camera("cam-w"))
        .await
        .assert_status_ok();
    let worker = service.state.registry().worker("cam-w").await.unwrap();
    wait_for(|| worker.status().matches_count > 0).await;
    service.state.shutdown().await;

    let response = service.server.get("/v1/events").await;
    let body: Value = response.json();
    let event = &body["events"][0];
    assert_eq!(event["matched"], true);
    assert_eq!(event["person_id"], "p-1");
    assert_eq!(event["person_name"], "Alice");

    let response = service
        .server
        .get("/v1/events/query")
        .add_query_param("person_name", "ali")
        .await;
    let page: EventPage = response.json();
    assert!(page.total_count >= 1);
}

#[tokio::test]
async fn test_watchlist_miss_carries_no_person() {
    let service = setup_test_service();
    // the scripted face points along x, Bob along y
    add_person(&service, "p-2", "Bob", json!([0.0, 1.0])).await;

    service
        .server
        .post("/v1/cameras/start")
        .json(&watchlist_camera("cam-w"))
        .await
        .assert_status_ok();
    let worker = service.state.registry().worker("cam-w").await.unwrap();
    wait_for(|| worker.status().last_similarity.is_some()).await;
    service.state.shutdown().await;

    let response = service.server.get("/v1/events").await;
    let body: Value = response.json();
    let events = body["events"].as_array().unwrap();
    assert!(!events.is_empty());
    for event in events {
        assert_eq!(event["matched"], false);
        assert!(event["person_id"].is_null());
        assert!(event["person_name"].is_null());
    }

    let response = service
        .server
        .get("/v1/events/query")
        .add_query_param("person_name", "bob")
        .await;
    let page: EventPage = response.json();
    assert_eq!(page.total_count, 0);

    // unmatched events keep no full frame
    let id = events[0]["id"].as_i64().unwrap();
    let response = service.server.get(&format!("/v1/events/{}/full-image", id)).await;
    assert_eq!(response.status_code(), 404);
}

#[tokio::test]
async fn test_watchlist_rejected_after_gallery_emptied() {
    let service = setup_test_service();
    add_person(&service, "p-1", "Alice", json!([1.0, 0.0])).await;

    let response = service.server.delete("/v1/gallery/p-1").await;
    assert_eq!(response.status_code(), 204);
    let response = service.server.delete("/v1/gallery/p-1").await;
    assert_eq!(response.status_code(), 404);

    let response = service
        .server
        .post("/v1/cameras/start")
        .json(&watchlist_camera("cam-w"))
        .await;
    assert_eq!(response.status_code(), 400);
    let body: Value = response.json();
    assert!(body["error"].as_str().unwrap().contains("gallery"));
    assert!(service.state.registry().running_ids().await.is_empty());
}

#[tokio::test]
async fn test_gallery_lists_by_group() {
    let service = setup_test_service();
    service
        .server
        .post("/v1/gallery")
        .json(&json!({ "person_id": "p-1", "name": "Alice", "group_id": "staff", "embeddings": [[1.0, 0.0]] }))
        .await
        .assert_status_ok();
    add_person(&service, "p-2", "Bob", json!([0.0, 1.0])).await;

    let response = service.server.get("/v1/gallery").add_query_param("group_id", "staff").await;
    let body: Value = response.json();
    let people = body["people"].as_array().unwrap();
    assert_eq!(people.len(), 1);
    assert_eq!(people[0]["name"], "Alice");
}

#[tokio::test]
async fn test_matched_event_serves_full_image() {
    let service = setup_test_service();
    service
        .server
        .post("/v1/cameras/start")
        .json(&single_target_camera("cam-1"))
        .await
        .assert_status_ok();
    let worker = service.state.registry().worker("cam-1").await.unwrap();
    wait_for(|| worker.status().matches_count > 0).await;
    service.state.shutdown().await;

    let response = service.server.get("/v1/events").add_query_param("matched", true).await;
    let body: Value = response.json();
    let id = body["events"][0]["id"].as_i64().unwrap();

    let response = service.server.get(&format!("/v1/events/{}/full-image", id)).await;
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.header("content-type"), "image/jpeg");
    assert_eq!(&response.as_bytes()[..2], &[0xFF, 0xD8]);

    let response = service.server.get("/v1/events/999999/full-image").await;
    assert_eq!(response.status_code(), 404);
}
