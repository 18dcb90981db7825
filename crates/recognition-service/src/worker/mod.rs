//! Per-camera worker.
//!
//! A worker owns one connection to its camera and runs three tasks under a
//! shared cancellation token:
//!
//! * capture: connects with exponential backoff, reads frames and publishes
//!   the latest one into a single-slot `watch` channel
//! * preview: at the preview rate, downsamples and JPEG-encodes the latest
//!   frame into a second `watch` slot read by snapshot and MJPEG clients
//! * recognition: at the camera's rate, runs [`RecognitionPipeline::tick`] on
//!   the latest frame it has not processed yet
//!
//! Slow ticks are skipped rather than queued, so neither loop ever falls behind.

pub mod pipeline;

use crate::hub::{FanoutHub, DEFAULT_RECENT_CAPACITY, DEFAULT_SUBSCRIBER_CAPACITY};
use crate::matching::Matcher;
use crate::media::{self, MediaStore, PREVIEW_JPEG_QUALITY};
use crate::quality::QualityThreshold;
use crate::recognizer::Recognizer;
use crate::source::{Frame, FrameSource};
use crate::store::EventStore;
use common::cameras::CameraConfig;
use common::validation::now_millis;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use pipeline::{RecognitionPipeline, TickReport};

/// Lowest sampling rate accepted for either loop
const MIN_RATE: f64 = 0.01;

/// Tunables shared by every worker in the process
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub preview_fps: f64,
    pub preview_max_width: u32,
    /// Minimum gap between persisted events of one camera
    pub cooldown: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Consecutive read failures after which the connection is reopened
    pub max_read_failures: u32,
    pub read_failure_pause: Duration,
    pub stop_timeout: Duration,
    pub subscriber_capacity: usize,
    pub recent_capacity: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            preview_fps: 30.0,
            preview_max_width: 1280,
            cooldown: Duration::from_secs(1),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            max_read_failures: 50,
            read_failure_pause: Duration::from_millis(100),
            stop_timeout: Duration::from_secs(2),
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            recent_capacity: DEFAULT_RECENT_CAPACITY,
        }
    }
}

/// Everything a worker needs besides its own config
#[derive(Clone)]
pub struct WorkerDeps {
    pub recognizer: Arc<dyn Recognizer>,
    pub source: Arc<dyn FrameSource>,
    pub events: Arc<dyn EventStore>,
    pub media: MediaStore,
    pub quality: Arc<QualityThreshold>,
    pub settings: WorkerSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    #[default]
    Stopped,
    Connecting,
    Streaming,
}

/// Point-in-time view of a worker for status endpoints
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub camera_id: String,
    pub state: WorkerState,
    pub last_error: Option<String>,
    /// Best similarity seen on the most recent tick with faces
    pub last_similarity: Option<f32>,
    pub matches_count: u64,
    /// Unix ms of the last matched face
    pub last_seen: Option<i64>,
    pub frames_read: u64,
    pub subscribers: usize,
    pub started_at: i64,
}

#[derive(Default)]
struct StatusFields {
    state: WorkerState,
    last_error: Option<String>,
    last_similarity: Option<f32>,
    matches_count: u64,
    last_seen: Option<i64>,
    frames_read: u64,
}

/// Status shared between a worker's tasks and its readers
pub struct WorkerShared {
    camera_id: String,
    started_at: i64,
    fields: Mutex<StatusFields>,
}

impl WorkerShared {
    pub fn new(camera_id: impl Into<String>) -> Self {
        Self {
            camera_id: camera_id.into(),
            started_at: now_millis(),
            fields: Mutex::new(StatusFields::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StatusFields> {
        self.fields.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn state(&self) -> WorkerState {
        self.lock().state
    }

    pub fn set_state(&self, state: WorkerState) {
        self.lock().state = state;
    }

    pub fn record_error(&self, error: impl std::fmt::Display) {
        self.lock().last_error = Some(error.to_string());
    }

    fn record_frame(&self) {
        self.lock().frames_read += 1;
    }

    /// Fold one recognition tick into the status
    pub fn record_tick(&self, best_similarity: Option<f32>, matches: u64, now_ms: i64) {
        let mut fields = self.lock();
        if best_similarity.is_some() {
            fields.last_similarity = best_similarity;
        }
        if matches > 0 {
            fields.matches_count += matches;
            fields.last_seen = Some(now_ms);
        }
    }

    pub fn snapshot(&self, subscribers: usize) -> WorkerStatus {
        let fields = self.lock();
        WorkerStatus {
            camera_id: self.camera_id.clone(),
            state: fields.state,
            last_error: fields.last_error.clone(),
            last_similarity: fields.last_similarity,
            matches_count: fields.matches_count,
            last_seen: fields.last_seen,
            frames_read: fields.frames_read,
            subscribers,
            started_at: self.started_at,
        }
    }
}

/// The encoded preview image most recently produced by a worker
#[derive(Debug, Clone)]
pub struct PreviewFrame {
    pub seq: u64,
    pub captured_at_ms: i64,
    pub jpeg: Vec<u8>,
}

type PreviewSlot = Option<Arc<PreviewFrame>>;

/// Next delay after a failed connection attempt
pub fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

fn period(rate: f64) -> Duration {
    Duration::from_secs_f64(1.0 / rate.max(MIN_RATE))
}

pub struct CameraWorker {
    config: CameraConfig,
    hub: Arc<FanoutHub>,
    shared: Arc<WorkerShared>,
    preview: watch::Receiver<PreviewSlot>,
    token: CancellationToken,
    tasks: tokio::sync::Mutex<JoinSet<()>>,
    stop_timeout: Duration,
    stopped: AtomicBool,
}

impl CameraWorker {
    /// Spawn the worker's tasks; `config` is frozen for the worker's lifetime
    pub fn start(config: CameraConfig, matcher: Matcher, deps: WorkerDeps) -> Self {
        let settings = deps.settings.clone();
        let hub = Arc::new(FanoutHub::new(settings.subscriber_capacity, settings.recent_capacity));
        let shared = Arc::new(WorkerShared::new(config.id.clone()));
        shared.set_state(WorkerState::Connecting);

        let token = CancellationToken::new();
        let (frame_tx, frame_rx) = watch::channel::<Option<Frame>>(None);
        let (preview_tx, preview_rx) = watch::channel::<PreviewSlot>(None);

        let mut tasks = JoinSet::new();
        tasks.spawn(capture_loop(
            config.clone(),
            deps.source.clone(),
            settings.clone(),
            shared.clone(),
            frame_tx,
            token.clone(),
        ));
        tasks.spawn(preview_loop(
            config.id.clone(),
            settings.clone(),
            frame_rx.clone(),
            preview_tx,
            token.clone(),
        ));

        let recognition_fps = config.fps.min(settings.preview_fps);
        let pipeline = RecognitionPipeline::new(config.clone(), matcher, &deps, hub.clone(), shared.clone());
        tasks.spawn(recognition_loop(pipeline, recognition_fps, frame_rx, token.clone()));

        telemetry::metrics::CAMERA_WORKERS_RUNNING.inc();
        info!(
            camera_id = %config.id,
            mode = config.mode.as_str(),
            fps = recognition_fps,
            threshold = config.threshold,
            "camera worker started"
        );

        Self {
            config,
            hub,
            shared,
            preview: preview_rx,
            token,
            tasks: tokio::sync::Mutex::new(tasks),
            stop_timeout: settings.stop_timeout,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    pub fn camera_id(&self) -> &str {
        &self.config.id
    }

    pub fn hub(&self) -> &Arc<FanoutHub> {
        &self.hub
    }

    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled()
    }

    pub fn status(&self) -> WorkerStatus {
        self.shared.snapshot(self.hub.subscriber_count())
    }

    pub fn preview(&self) -> Option<Arc<PreviewFrame>> {
        self.preview.borrow().clone()
    }

    /// A receiver that is notified whenever a new preview frame is stored
    pub fn watch_preview(&self) -> watch::Receiver<Option<Arc<PreviewFrame>>> {
        self.preview.clone()
    }

    /// Stop all tasks and drop every subscription; safe to call repeatedly
    pub async fn stop(&self) {
        self.token.cancel();

        let mut tasks = self.tasks.lock().await;
        let drained = time::timeout(self.stop_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(camera_id = %self.config.id, "worker tasks did not exit in time, aborting");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
        drop(tasks);

        self.hub.close();
        self.shared.set_state(WorkerState::Stopped);

        if !self.stopped.swap(true, Ordering::SeqCst) {
            telemetry::metrics::CAMERA_WORKERS_RUNNING.dec();
            info!(camera_id = %self.config.id, "camera worker stopped");
        }
    }
}

async fn capture_loop(
    config: CameraConfig,
    source: Arc<dyn FrameSource>,
    settings: WorkerSettings,
    shared: Arc<WorkerShared>,
    frames: watch::Sender<Option<Frame>>,
    token: CancellationToken,
) {
    let camera_id = config.id.as_str();
    let mut backoff = settings.initial_backoff;
    let mut seq = 0u64;

    'connect: while !token.is_cancelled() {
        shared.set_state(WorkerState::Connecting);
        let opened = tokio::select! {
            _ = token.cancelled() => break,
            opened = source.open(&config.url, config.transport) => opened,
        };

        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                telemetry::metrics::CAMERA_CONNECT_FAILURES
                    .with_label_values(&[camera_id])
                    .inc();
                warn!(camera_id = %camera_id, error = %e, retry_in_ms = backoff.as_millis() as u64, "failed to open camera");
                shared.record_error(format!("connect: {:#}", e));
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = time::sleep(backoff) => {}
                }
                backoff = next_backoff(backoff, settings.max_backoff);
                continue;
            }
        };

        backoff = settings.initial_backoff;
        shared.set_state(WorkerState::Streaming);
        info!(camera_id = %camera_id, "camera connected");

        let mut failures = 0u32;
        loop {
            let read = tokio::select! {
                _ = token.cancelled() => break 'connect,
                read = stream.next_frame() => read,
            };

            match read {
                Ok(image) => {
                    failures = 0;
                    seq += 1;
                    shared.record_frame();
                    telemetry::metrics::CAMERA_FRAMES_READ
                        .with_label_values(&[camera_id])
                        .inc();
                    frames.send_replace(Some(Frame {
                        seq,
                        captured_at_ms: now_millis(),
                        image: Arc::new(image),
                    }));
                }
                Err(e) => {
                    failures += 1;
                    telemetry::metrics::CAMERA_READ_ERRORS
                        .with_label_values(&[camera_id])
                        .inc();
                    debug!(camera_id = %camera_id, error = %e, failures, "frame read failed");
                    shared.record_error(format!("read: {:#}", e));

                    if stream.is_closed() || failures >= settings.max_read_failures {
                        warn!(camera_id = %camera_id, failures, "stream unusable, reconnecting");
                        break;
                    }
                    tokio::select! {
                        _ = token.cancelled() => break 'connect,
                        _ = time::sleep(settings.read_failure_pause) => {}
                    }
                }
            }
        }
    }

    debug!(camera_id = %camera_id, frames = seq, "capture loop exited");
}

async fn preview_loop(
    camera_id: String,
    settings: WorkerSettings,
    frames: watch::Receiver<Option<Frame>>,
    preview: watch::Sender<PreviewSlot>,
    token: CancellationToken,
) {
    let mut interval = time::interval(period(settings.preview_fps));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_seq = 0u64;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }

        let Some(frame) = frames.borrow().clone() else {
            continue;
        };
        if frame.seq == last_seq {
            continue;
        }
        last_seq = frame.seq;

        let image = frame.image.clone();
        let max_width = settings.preview_max_width;
        let encoded = tokio::task::spawn_blocking(move || {
            media::encode_jpeg(&media::resize_max_width(&image, max_width), PREVIEW_JPEG_QUALITY)
        })
        .await;

        match encoded {
            Ok(Ok(jpeg)) => {
                preview.send_replace(Some(Arc::new(PreviewFrame {
                    seq: frame.seq,
                    captured_at_ms: frame.captured_at_ms,
                    jpeg,
                })));
            }
            Ok(Err(e)) => debug!(camera_id = %camera_id, error = %e, "preview encode failed"),
            Err(e) => warn!(camera_id = %camera_id, error = %e, "preview task failed"),
        }
    }
}

async fn recognition_loop(
    mut pipeline: RecognitionPipeline,
    fps: f64,
    frames: watch::Receiver<Option<Frame>>,
    token: CancellationToken,
) {
    let mut interval = time::interval(period(fps));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_seq = 0u64;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }

        let Some(frame) = frames.borrow().clone() else {
            continue;
        };
        if frame.seq <= last_seq {
            continue;
        }
        last_seq = frame.seq;

        tokio::select! {
            _ = token.cancelled() => break,
            _ = pipeline.tick(&frame, now_millis()) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::NextEvent;
    use crate::recognizer::{Face, ScriptedRecognizer};
    use crate::source::ScriptedSource;
    use crate::store::MemoryEventStore;
    use common::events::BoundingBox;

    fn fast_settings() -> WorkerSettings {
        WorkerSettings {
            preview_fps: 50.0,
            preview_max_width: 32,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(80),
            read_failure_pause: Duration::from_millis(5),
            max_read_failures: 3,
            ..Default::default()
        }
    }

    fn deps(source: Arc<ScriptedSource>, recognizer: Arc<ScriptedRecognizer>, dir: &std::path::Path) -> WorkerDeps {
        WorkerDeps {
            recognizer,
            source,
            events: Arc::new(MemoryEventStore::new()),
            media: MediaStore::new(dir),
            quality: Arc::new(QualityThreshold::default()),
            settings: fast_settings(),
        }
    }

    fn camera() -> (CameraConfig, Matcher) {
        let config = CameraConfig::new("cam-1", "rtsp://camera.local/stream")
            .with_target(vec![1.0, 0.0])
            .with_fps(20.0);
        let matcher = Matcher::SingleTarget {
            embedding: vec![1.0, 0.0],
        };
        (config, matcher)
    }

    fn face() -> Face {
        Face {
            bbox: BoundingBox::new(4, 4, 40, 40),
            detection_score: 0.95,
            embedding: vec![1.0, 0.0],
        }
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let max = Duration::from_secs(10);
        let mut delay = Duration::from_secs(1);
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(delay.as_secs());
            delay = next_backoff(delay, max);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 10, 10]);
    }

    #[tokio::test]
    async fn test_start_then_stop_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(ScriptedSource::solid(64, 64));
        let recognizer = Arc::new(ScriptedRecognizer::new().with_fallback(vec![face()]));
        let (config, matcher) = camera();

        let worker = CameraWorker::start(config, matcher, deps(source.clone(), recognizer, dir.path()));
        let subscription = worker.hub().subscription();
        worker.stop().await;

        assert!(!worker.is_running());
        assert_eq!(worker.status().state, WorkerState::Stopped);
        assert_eq!(worker.hub().subscriber_count(), 0);
        assert_eq!(source.live_streams(), 0);
        assert_eq!(subscription.next(Duration::from_millis(10)).await, NextEvent::Closed);

        // idempotent
        worker.stop().await;
        assert_eq!(worker.status().state, WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_streams_preview_and_live_events() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(ScriptedSource::solid(64, 64));
        let recognizer = Arc::new(ScriptedRecognizer::new().with_fallback(vec![face()]));
        let (config, matcher) = camera();

        let worker = CameraWorker::start(config, matcher, deps(source.clone(), recognizer, dir.path()));
        let subscription = worker.hub().subscription();

        wait_for(|| worker.preview().is_some()).await;
        let preview = worker.preview().unwrap();
        let decoded = image::load_from_memory(&preview.jpeg).unwrap();
        assert!(decoded.width() <= 32);

        match subscription.next(Duration::from_secs(2)).await {
            NextEvent::Event(event) => {
                assert_eq!(event.camera_id, "cam-1");
                assert!(event.matched);
            }
            other => panic!("expected event, got {:?}", other),
        }

        let status = worker.status();
        assert_eq!(status.state, WorkerState::Streaming);
        assert!(status.frames_read > 0);
        assert!(status.matches_count > 0);
        assert_eq!(status.subscribers, 1);

        worker.stop().await;
        assert_eq!(source.live_streams(), 0);
    }

    #[tokio::test]
    async fn test_retries_failed_connections() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(ScriptedSource::solid(16, 16).with_failing_opens(2));
        let recognizer = Arc::new(ScriptedRecognizer::new());
        let (config, matcher) = camera();

        let worker = CameraWorker::start(config, matcher, deps(source.clone(), recognizer, dir.path()));
        wait_for(|| worker.status().state == WorkerState::Streaming).await;

        assert_eq!(source.opens(), 3);
        assert!(worker.status().last_error.unwrap().starts_with("connect"));
        worker.stop().await;
    }

    #[tokio::test]
    async fn test_reconnects_after_repeated_read_failures() {
        let dir = tempfile::tempdir().unwrap();
        // no frames: every read fails
        let source = Arc::new(ScriptedSource::new(Vec::new()).with_frame_interval(Duration::from_millis(1)));
        let recognizer = Arc::new(ScriptedRecognizer::new());
        let (config, matcher) = camera();

        let worker = CameraWorker::start(config, matcher, deps(source.clone(), recognizer, dir.path()));
        wait_for(|| source.opens() >= 2).await;

        assert!(worker.status().last_error.unwrap().starts_with("read"));
        worker.stop().await;
        assert_eq!(source.live_streams(), 0);
    }
}
