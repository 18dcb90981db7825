//! Asynchronous analysis jobs.
//!
//! A request is validated before anything is created; once accepted the job
//! is recorded as queued and a tracked task takes it through running to done
//! or error. Failures after acceptance only surface through the job record.

pub mod analysis;

use crate::store::{JobStore, JobStoreError};
use analysis::{AnalysisContext, VideoAnalysisOptions};
use common::jobs::{JobRecord, JobUpdate};
use common::validation::validate_media_path;
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

pub const COMPARE: &str = "compare";
pub const PIC_TO_VIDEO: &str = "pic_to_video";
pub const VIDEO_ANALYSIS: &str = "video_analysis";
pub const VIDEO_TO_VIDEO: &str = "video_to_video";

const DEFAULT_THRESHOLD: f32 = 0.6;
/// Frames per second sampled from videos
const DEFAULT_SAMPLE_FPS: f64 = 3.0;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid job request: {0}")]
    Invalid(String),

    #[error(transparent)]
    Store(#[from] JobStoreError),
}

fn default_threshold() -> f32 {
    DEFAULT_THRESHOLD
}

fn default_sample_fps() -> f64 {
    DEFAULT_SAMPLE_FPS
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ComparePayload {
    image_a: PathBuf,
    image_b: PathBuf,
    #[serde(default = "default_threshold")]
    threshold: f32,
}

#[derive(Debug, Deserialize)]
struct PicToVideoPayload {
    image: PathBuf,
    video: PathBuf,
    #[serde(default = "default_threshold")]
    threshold: f32,
    #[serde(default = "default_sample_fps")]
    sample_fps: f64,
}

#[derive(Debug, Deserialize)]
struct VideoAnalysisPayload {
    video: PathBuf,
    #[serde(default = "default_threshold")]
    threshold: f32,
    #[serde(default = "default_true")]
    use_watchlist: bool,
    #[serde(default = "default_sample_fps")]
    sample_fps: f64,
}

#[derive(Debug, Deserialize)]
struct VideoToVideoPayload {
    video_a: PathBuf,
    video_b: PathBuf,
    #[serde(default = "default_threshold")]
    threshold: f32,
    #[serde(default = "default_sample_fps")]
    sample_fps: f64,
}

/// A validated job request
#[derive(Debug)]
enum JobKind {
    Compare {
        image_a: PathBuf,
        image_b: PathBuf,
        threshold: f32,
    },
    PicToVideo {
        image: PathBuf,
        video: PathBuf,
        threshold: f32,
        sample_fps: f64,
    },
    VideoAnalysis {
        video: PathBuf,
        options: VideoAnalysisOptions,
    },
    VideoToVideo {
        video_a: PathBuf,
        video_b: PathBuf,
        threshold: f32,
        sample_fps: f64,
    },
}

fn invalid(e: impl std::fmt::Display) -> JobError {
    JobError::Invalid(e.to_string())
}

fn check_threshold(threshold: f32) -> Result<f32, JobError> {
    common::validation::validate_range(threshold, 0.0, 1.0, "threshold").map_err(invalid)?;
    Ok(threshold)
}

fn check_sample_fps(fps: f64) -> Result<f64, JobError> {
    if !(fps > 0.0 && fps <= 60.0) {
        return Err(JobError::Invalid(format!("sample_fps must be in (0, 60], got {}", fps)));
    }
    Ok(fps)
}

impl JobKind {
    fn parse(job_type: &str, payload: &Value, input_dir: Option<&Path>) -> Result<Self, JobError> {
        let path = |p: &Path, field: &str| validate_media_path(p, input_dir, field).map_err(invalid);
        match job_type {
            COMPARE => {
                let p: ComparePayload = serde_json::from_value(payload.clone()).map_err(invalid)?;
                Ok(JobKind::Compare {
                    image_a: path(&p.image_a, "image_a")?,
                    image_b: path(&p.image_b, "image_b")?,
                    threshold: check_threshold(p.threshold)?,
                })
            }
            PIC_TO_VIDEO => {
                let p: PicToVideoPayload = serde_json::from_value(payload.clone()).map_err(invalid)?;
                Ok(JobKind::PicToVideo {
                    image: path(&p.image, "image")?,
                    video: path(&p.video, "video")?,
                    threshold: check_threshold(p.threshold)?,
                    sample_fps: check_sample_fps(p.sample_fps)?,
                })
            }
            VIDEO_ANALYSIS => {
                let p: VideoAnalysisPayload = serde_json::from_value(payload.clone()).map_err(invalid)?;
                Ok(JobKind::VideoAnalysis {
                    video: path(&p.video, "video")?,
                    options: VideoAnalysisOptions {
                        threshold: check_threshold(p.threshold)?,
                        use_watchlist: p.use_watchlist,
                        sample_fps: check_sample_fps(p.sample_fps)?,
                    },
                })
            }
            VIDEO_TO_VIDEO => {
                let p: VideoToVideoPayload = serde_json::from_value(payload.clone()).map_err(invalid)?;
                Ok(JobKind::VideoToVideo {
                    video_a: path(&p.video_a, "video_a")?,
                    video_b: path(&p.video_b, "video_b")?,
                    threshold: check_threshold(p.threshold)?,
                    sample_fps: check_sample_fps(p.sample_fps)?,
                })
            }
            other => Err(JobError::Invalid(format!("unknown job type '{}'", other))),
        }
    }

    async fn run(self, ctx: &AnalysisContext, job_id: &str) -> anyhow::Result<Value> {
        match self {
            JobKind::Compare {
                image_a,
                image_b,
                threshold,
            } => analysis::compare(ctx, &image_a, &image_b, threshold).await,
            JobKind::PicToVideo {
                image,
                video,
                threshold,
                sample_fps,
            } => analysis::pic_to_video(ctx, job_id, &image, &video, threshold, sample_fps).await,
            JobKind::VideoAnalysis { video, options } => {
                analysis::video_analysis(ctx, job_id, &video, &options).await
            }
            JobKind::VideoToVideo {
                video_a,
                video_b,
                threshold,
                sample_fps,
            } => analysis::video_to_video(ctx, job_id, &video_a, &video_b, threshold, sample_fps).await,
        }
    }
}

/// Accepts job requests and runs each one as a tracked background task
pub struct JobRunner {
    ctx: AnalysisContext,
    input_dir: Option<PathBuf>,
    tracker: TaskTracker,
    token: CancellationToken,
}

impl JobRunner {
    pub fn new(ctx: AnalysisContext) -> Self {
        Self {
            ctx,
            input_dir: None,
            tracker: TaskTracker::new(),
            token: CancellationToken::new(),
        }
    }

    /// Only accept input files below `dir`
    pub fn with_input_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.input_dir = Some(dir.into());
        self
    }

    pub fn store(&self) -> &dyn JobStore {
        self.ctx.store.as_ref()
    }

    /// Validate the request, record it as queued and start it
    pub async fn submit(&self, job_type: &str, payload: Value) -> Result<JobRecord, JobError> {
        if self.tracker.is_closed() {
            return Err(JobError::Invalid("service is shutting down".to_string()));
        }
        let kind = JobKind::parse(job_type, &payload, self.input_dir.as_deref())?;
        let record = self.ctx.store.create(job_type, payload).await?;
        telemetry::metrics::JOBS
            .with_label_values(&[job_type, "queued"])
            .inc();
        info!(job_id = %record.id, job_type = %job_type, "job queued");

        let ctx = self.ctx.clone();
        let token = self.token.clone();
        let job_id = record.id.clone();
        let job_type = job_type.to_string();
        self.tracker.spawn(async move {
            let started = Instant::now();
            let outcome = tokio::select! {
                _ = token.cancelled() => Err(anyhow::anyhow!("cancelled: service shutting down")),
                outcome = execute(&ctx, &job_id, kind) => outcome,
            };

            let (update, status) = match outcome {
                Ok(result) => (JobUpdate::done(result), "done"),
                Err(e) => {
                    error!(job_id = %job_id, job_type = %job_type, error = %format!("{:#}", e), "job failed");
                    (JobUpdate::failed(format!("{:#}", e)), "error")
                }
            };
            if let Err(e) = ctx.store.update(&job_id, update).await {
                error!(job_id = %job_id, error = %e, "failed to record job outcome");
            }

            telemetry::metrics::JOBS
                .with_label_values(&[job_type.as_str(), status])
                .inc();
            telemetry::metrics::JOB_DURATION.observe(started.elapsed().as_secs_f64());
            info!(job_id = %job_id, status, elapsed_ms = started.elapsed().as_millis() as u64, "job finished");
        });

        Ok(record)
    }

    pub async fn get(&self, id: &str) -> Result<Option<JobRecord>, JobError> {
        Ok(self.ctx.store.get(id).await?)
    }

    /// Stop accepting jobs, cancel running ones and wait up to `timeout` for them to record their outcome
    pub async fn shutdown(&self, timeout: Duration) {
        self.tracker.close();
        self.token.cancel();
        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
            warn!(running = self.tracker.len(), "jobs still running at shutdown");
        }
    }
}

async fn execute(ctx: &AnalysisContext, job_id: &str, kind: JobKind) -> anyhow::Result<Value> {
    ctx.store.update(job_id, JobUpdate::running()).await?;
    kind.run(ctx, job_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaStore;
    use crate::recognizer::{Face, ScriptedRecognizer};
    use crate::source::ScriptedSource;
    use crate::store::{GalleryStore, MemoryGalleryStore, MemoryJobStore};
    use common::events::BoundingBox;
    use common::gallery::GalleryEntry;
    use common::jobs::JobStatus;
    use serde_json::json;
    use std::sync::Arc;

    struct Fixture {
        runner: JobRunner,
        recognizer: Arc<ScriptedRecognizer>,
        gallery: Arc<MemoryGalleryStore>,
        dir: tempfile::TempDir,
    }

    fn fixture_with(recognizer: ScriptedRecognizer, frames: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let recognizer = Arc::new(recognizer);
        let gallery = Arc::new(MemoryGalleryStore::new());
        let frame = image::DynamicImage::new_rgb8(64, 64);
        let video = ScriptedSource::new(vec![frame; frames]).with_frame_interval(Duration::from_millis(1));
        let ctx = AnalysisContext {
            store: Arc::new(MemoryJobStore::new()),
            recognizer: recognizer.clone(),
            gallery: gallery.clone(),
            video: Arc::new(video),
            media: MediaStore::new(dir.path().join("media")),
        };
        Fixture {
            runner: JobRunner::new(ctx).with_input_dir(dir.path()),
            recognizer,
            gallery,
            dir,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(ScriptedRecognizer::new(), 3)
    }

    fn write_file(dir: &Path, name: &str) -> String {
        let path = dir.join(name);
        if name.ends_with(".png") {
            image::DynamicImage::new_rgb8(64, 64).save(&path).unwrap();
        } else {
            std::fs::write(&path, b"video").unwrap();
        }
        path.to_string_lossy().into_owned()
    }

    fn face(embedding: Vec<f32>) -> Face {
        Face {
            bbox: BoundingBox::new(8, 8, 40, 40),
            detection_score: 0.9,
            embedding,
        }
    }

    async fn wait_finished(runner: &JobRunner, id: &str) -> JobRecord {
        for _ in 0..200 {
            let record = runner.get(id).await.unwrap().unwrap();
            if record.status.is_terminal() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} did not finish", id);
    }

    #[tokio::test]
    async fn test_compare_job_reports_similarity() {
        let f = fixture();
        f.recognizer.push_faces(vec![face(vec![1.0, 0.0])]);
        f.recognizer.push_faces(vec![face(vec![0.8, 0.6])]);
        let a = write_file(f.dir.path(), "a.png");
        let b = write_file(f.dir.path(), "b.png");

        let record = f
            .runner
            .submit(COMPARE, json!({"image_a": a, "image_b": b}))
            .await
            .unwrap();
        assert_eq!(record.status, JobStatus::Queued);
        assert_eq!(record.progress, 0.0);

        let done = wait_finished(&f.runner, &record.id).await;
        assert_eq!(done.status, JobStatus::Done);
        assert_eq!(done.progress, 1.0);
        let result = done.result.unwrap();
        let similarity = result["similarity"].as_f64().unwrap();
        assert!((similarity - 0.8).abs() < 1e-4);
        assert_eq!(result["is_same_person"], json!(true));
    }

    #[tokio::test]
    async fn test_invalid_requests_are_rejected_without_a_job() {
        let f = fixture();
        let a = write_file(f.dir.path(), "a.png");
        let outside = tempfile::NamedTempFile::new().unwrap();

        let cases = vec![
            ("teleport", json!({})),
            (COMPARE, json!({"image_a": a})),
            (COMPARE, json!({"image_a": a, "image_b": "/no/such/file.png"})),
            (COMPARE, json!({"image_a": a, "image_b": outside.path()})),
            (COMPARE, json!({"image_a": a, "image_b": a, "threshold": 2.0})),
            (VIDEO_ANALYSIS, json!({"video": a, "sample_fps": 0.0})),
            (VIDEO_TO_VIDEO, json!({"video_a": a})),
        ];
        for (job_type, payload) in cases {
            let result = f.runner.submit(job_type, payload.clone()).await;
            assert!(matches!(result, Err(JobError::Invalid(_))), "{} {}", job_type, payload);
        }
        assert!(f.runner.store().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_is_recorded_on_the_job() {
        let f = fixture();
        // no faces in either image
        let a = write_file(f.dir.path(), "a.png");
        let record = f
            .runner
            .submit(COMPARE, json!({"image_a": a, "image_b": a}))
            .await
            .unwrap();

        let failed = wait_finished(&f.runner, &record.id).await;
        assert_eq!(failed.status, JobStatus::Error);
        assert!(failed.error.unwrap().contains("no face detected"));
        assert!(failed.result.is_none());
    }

    #[tokio::test]
    async fn test_pic_to_video_finds_matching_frames() {
        let f = fixture();
        f.recognizer.push_faces(vec![face(vec![1.0, 0.0])]);
        f.recognizer.push_faces(vec![face(vec![0.9, 0.436])]);
        f.recognizer.push_faces(vec![face(vec![0.2, 0.98])]);
        f.recognizer.push_faces(vec![face(vec![0.7, 0.714]), face(vec![0.1, 0.995])]);
        let image = write_file(f.dir.path(), "known.png");
        let video = write_file(f.dir.path(), "clip.mp4");

        let record = f
            .runner
            .submit(PIC_TO_VIDEO, json!({"image": image, "video": video}))
            .await
            .unwrap();
        let done = wait_finished(&f.runner, &record.id).await;
        assert_eq!(done.status, JobStatus::Done, "{:?}", done.error);

        let result = done.result.unwrap();
        let matches = result["matches"].as_array().unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0]["frame"], json!(0));
        assert_eq!(matches[1]["frame"], json!(2));
        let time = matches[1]["time"].as_f64().unwrap();
        assert!((time - 2.0 / 3.0).abs() < 1e-6);
        assert_eq!(result["frames_scanned"], json!(3));
    }

    #[tokio::test]
    async fn test_video_analysis_counts_unique_and_matched_faces() {
        let f = fixture();
        f.gallery
            .upsert(&GalleryEntry::new("p1", "Alice").with_embedding(vec![1.0, 0.0]))
            .await
            .unwrap();
        f.recognizer.push_faces(vec![face(vec![1.0, 0.0])]);
        f.recognizer.push_faces(vec![face(vec![0.99, 0.141]), face(vec![0.0, 1.0])]);
        f.recognizer.push_faces(vec![]);
        let video = write_file(f.dir.path(), "clip.mp4");

        let record = f
            .runner
            .submit(VIDEO_ANALYSIS, json!({"video": video}))
            .await
            .unwrap();
        let done = wait_finished(&f.runner, &record.id).await;
        assert_eq!(done.status, JobStatus::Done, "{:?}", done.error);

        let result = done.result.unwrap();
        assert_eq!(result["processed_frames"], json!(3));
        assert_eq!(result["total_faces"], json!(3));
        assert_eq!(result["matched_faces"], json!(2));
        assert_eq!(result["unique_faces"], json!(2));
        assert_eq!(result["statistics"]["frames_without_faces"], json!(1));
        assert_eq!(result["statistics"]["max_faces_in_frame"], json!(2));
        assert_eq!(result["detections"][0]["faces"][0]["person_name"], json!("Alice"));
    }

    #[tokio::test]
    async fn test_video_to_video_pairs_similar_faces() {
        let f = fixture();
        // video a
        f.recognizer.push_faces(vec![face(vec![1.0, 0.0])]);
        f.recognizer.push_faces(vec![face(vec![0.0, 1.0])]);
        f.recognizer.push_faces(vec![]);
        // video b
        f.recognizer.push_faces(vec![]);
        f.recognizer.push_faces(vec![face(vec![0.95, 0.312])]);
        f.recognizer.push_faces(vec![face(vec![0.6, 0.8])]);
        let a = write_file(f.dir.path(), "a.mp4");
        let b = write_file(f.dir.path(), "b.mp4");

        let record = f
            .runner
            .submit(VIDEO_TO_VIDEO, json!({"video_a": a, "video_b": b, "threshold": 0.7}))
            .await
            .unwrap();
        let done = wait_finished(&f.runner, &record.id).await;
        assert_eq!(done.status, JobStatus::Done, "{:?}", done.error);

        let result = done.result.unwrap();
        assert_eq!(result["faces_a"], json!(2));
        assert_eq!(result["faces_b"], json!(2));
        let pairs = result["pairs"].as_array().unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0]["a"]["frame"], json!(0));
        assert_eq!(pairs[0]["b"]["frame"], json!(1));
        assert!((pairs[0]["confidence"].as_f64().unwrap() - 0.95).abs() < 1e-3);
        assert_eq!(pairs[1]["a"]["frame"], json!(1));
        assert_eq!(pairs[1]["b"]["frame"], json!(2));
        assert!(pairs[0]["a"]["thumb_relpath"].as_str().unwrap().contains("-a/"));
        assert!(pairs[0]["b"]["thumb_relpath"].as_str().unwrap().contains("-b/"));
    }

    #[tokio::test]
    async fn test_video_without_frames_fails_the_job() {
        let f = fixture_with(ScriptedRecognizer::new(), 0);
        let video = write_file(f.dir.path(), "broken.mp4");

        let record = f
            .runner
            .submit(VIDEO_ANALYSIS, json!({"video": video}))
            .await
            .unwrap();
        let failed = wait_finished(&f.runner, &record.id).await;
        assert_eq!(failed.status, JobStatus::Error);
        assert!(failed.error.unwrap().contains("no frames decoded"));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_running_jobs() {
        let f = fixture_with(ScriptedRecognizer::new().with_latency(Duration::from_secs(30)), 3);
        let a = write_file(f.dir.path(), "a.png");
        let record = f
            .runner
            .submit(COMPARE, json!({"image_a": a, "image_b": a}))
            .await
            .unwrap();

        f.runner.shutdown(Duration::from_secs(2)).await;
        let record = f.runner.get(&record.id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Error);
        assert!(record.error.unwrap().contains("cancelled"));

        assert!(matches!(
            f.runner.submit(COMPARE, json!({"image_a": a, "image_b": a})).await,
            Err(JobError::Invalid(_))
        ));
    }
}
