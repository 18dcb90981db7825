//! The analyses behind each job kind.

use crate::matching::Matcher;
use crate::media::{self, MediaStore};
use crate::recognizer::{cosine_similarity, Face, Recognizer};
use crate::source::{FrameStream, VideoFileSource};
use crate::store::{GalleryStore, JobStore};
use anyhow::{anyhow, bail, Context, Result};
use common::events::BoundingBox;
use common::jobs::JobUpdate;
use image::DynamicImage;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Faces more similar than this are counted as the same person
pub const UNIQUE_FACE_SIMILARITY: f32 = 0.8;
/// Estimated progress never reaches 1.0 before the job is done
const MAX_RUNNING_PROGRESS: f32 = 0.99;
const PROGRESS_STEP_PER_FRAME: f32 = 0.01;
const PROGRESS_REPORT_DELTA: f32 = 0.05;

/// Collaborators shared by all analyses
#[derive(Clone)]
pub struct AnalysisContext {
    pub store: Arc<dyn JobStore>,
    pub recognizer: Arc<dyn Recognizer>,
    pub gallery: Arc<dyn GalleryStore>,
    pub video: Arc<dyn VideoFileSource>,
    pub media: MediaStore,
}

/// Greedy online clustering of face embeddings.
///
/// A face joins the first cluster whose representative is more similar than
/// the threshold, otherwise it starts a new one. Clusters are never merged,
/// so the count depends on arrival order.
#[derive(Debug)]
pub struct FaceClusters {
    representatives: Vec<Vec<f32>>,
    threshold: f32,
}

impl FaceClusters {
    pub fn new(threshold: f32) -> Self {
        Self {
            representatives: Vec::new(),
            threshold,
        }
    }

    /// Cluster index for `embedding`
    pub fn assign(&mut self, embedding: &[f32]) -> usize {
        if let Some(index) = self
            .representatives
            .iter()
            .position(|r| cosine_similarity(r, embedding) > self.threshold)
        {
            return index;
        }
        self.representatives.push(embedding.to_vec());
        self.representatives.len() - 1
    }

    pub fn len(&self) -> usize {
        self.representatives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.representatives.is_empty()
    }
}

/// Advances an estimated progress per frame and writes it every few percent
struct ProgressReporter<'a> {
    store: &'a dyn JobStore,
    job_id: &'a str,
    estimate: f32,
    reported: f32,
}

impl<'a> ProgressReporter<'a> {
    fn new(store: &'a dyn JobStore, job_id: &'a str) -> Self {
        Self {
            store,
            job_id,
            estimate: 0.0,
            reported: 0.0,
        }
    }

    async fn frame_done(&mut self) {
        self.estimate = (self.estimate + PROGRESS_STEP_PER_FRAME).min(MAX_RUNNING_PROGRESS);
        if self.estimate - self.reported >= PROGRESS_REPORT_DELTA {
            match self.store.update(self.job_id, JobUpdate::progress(self.estimate)).await {
                Ok(_) => self.reported = self.estimate,
                Err(e) => warn!(job_id = %self.job_id, error = %e, "failed to report progress"),
            }
        }
    }
}

async fn load_image(path: &Path) -> Result<DynamicImage> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || image::open(&owned))
        .await
        .context("image decode task failed")?
        .with_context(|| format!("failed to read image {}", path.display()))
}

/// The most confident face in `image`
async fn primary_face(recognizer: &dyn Recognizer, image: &DynamicImage, label: &str) -> Result<Face> {
    recognizer
        .detect(image)
        .await?
        .into_iter()
        .max_by(|a, b| a.detection_score.total_cmp(&b.detection_score))
        .ok_or_else(|| anyhow!("no face detected in {}", label))
}

pub async fn compare(ctx: &AnalysisContext, image_a: &Path, image_b: &Path, threshold: f32) -> Result<Value> {
    let a = load_image(image_a).await?;
    let b = load_image(image_b).await?;
    let face_a = primary_face(ctx.recognizer.as_ref(), &a, "image_a").await?;
    let face_b = primary_face(ctx.recognizer.as_ref(), &b, "image_b").await?;

    let similarity = cosine_similarity(&face_a.embedding, &face_b.embedding);
    Ok(json!({
        "similarity": similarity,
        "is_same_person": similarity >= threshold,
        "threshold": threshold,
        "image_a": { "path": image_a, "bbox": face_a.bbox },
        "image_b": { "path": image_b, "bbox": face_b.bbox },
    }))
}

#[derive(Debug, Serialize)]
struct VideoMatch {
    /// Seconds from the start of the video
    time: f64,
    frame: u64,
    bbox: BoundingBox,
    confidence: f32,
    thumb_relpath: Option<String>,
}

/// Thumbnails land under `thumbs/<subject>/`; `subject` is the job id or a per-input variant of it
async fn save_job_thumbnail(
    ctx: &AnalysisContext,
    subject: &str,
    frame: u64,
    index: usize,
    image: &Arc<DynamicImage>,
    bbox: &BoundingBox,
) -> Option<String> {
    let (image, bbox_owned) = (image.clone(), *bbox);
    let encoded = tokio::task::spawn_blocking(move || media::thumbnail_jpeg(&image, &bbox_owned)).await;
    let jpeg = match encoded {
        Ok(Ok(Some(jpeg))) => jpeg,
        Ok(Ok(None)) => return None,
        Ok(Err(e)) => {
            warn!(job_id = %subject, error = %e, "failed to encode thumbnail");
            return None;
        }
        Err(e) => {
            warn!(job_id = %subject, error = %e, "thumbnail task failed");
            return None;
        }
    };
    match ctx.media.save_thumbnail(subject, frame as i64, index, &jpeg).await {
        Ok(path) => Some(path),
        Err(e) => {
            warn!(job_id = %subject, error = %e, "failed to save thumbnail");
            None
        }
    }
}

/// Next sampled frame of `video`, `None` once it has ended.
///
/// A video that ends before its first frame is an error, carrying the decoder's reason.
async fn next_video_frame(stream: &mut dyn FrameStream, frame_index: u64, video: &Path) -> Result<Option<DynamicImage>> {
    if !stream.is_closed() {
        match stream.next_frame().await {
            Ok(frame) => return Ok(Some(frame)),
            Err(e) if !stream.is_closed() => return Err(e.context(format!("failed to read frame {}", frame_index))),
            Err(e) if frame_index == 0 => {
                return Err(e.context(format!("no frames decoded from {}", video.display())))
            }
            Err(_) => return Ok(None),
        }
    }
    if frame_index == 0 {
        bail!("no frames decoded from {}", video.display());
    }
    Ok(None)
}

/// Find the moments in `video` where the person in `image` appears
pub async fn pic_to_video(
    ctx: &AnalysisContext,
    job_id: &str,
    image: &Path,
    video: &Path,
    threshold: f32,
    sample_fps: f64,
) -> Result<Value> {
    let known = load_image(image).await?;
    let known_face = primary_face(ctx.recognizer.as_ref(), &known, "image").await?;
    let mut stream = ctx.video.open_video(video, sample_fps).await?;
    let mut progress = ProgressReporter::new(ctx.store.as_ref(), job_id);

    let mut matches = Vec::new();
    let mut frame_index = 0u64;
    while let Some(frame) = next_video_frame(&mut *stream, frame_index, video).await? {
        let frame = Arc::new(frame);
        let best = ctx
            .recognizer
            .detect(&frame)
            .await?
            .into_iter()
            .map(|face| (cosine_similarity(&known_face.embedding, &face.embedding), face))
            .max_by(|a, b| a.0.total_cmp(&b.0));

        if let Some((similarity, face)) = best.filter(|(s, _)| *s >= threshold) {
            let thumb_relpath = save_job_thumbnail(ctx, job_id, frame_index, 0, &frame, &face.bbox).await;
            matches.push(VideoMatch {
                time: frame_index as f64 / sample_fps,
                frame: frame_index,
                bbox: face.bbox,
                confidence: similarity,
                thumb_relpath,
            });
        }

        frame_index += 1;
        progress.frame_done().await;
    }

    debug!(job_id = %job_id, frames = frame_index, matches = matches.len(), "video scan finished");
    Ok(json!({
        "matches": matches,
        "frames_scanned": frame_index,
        "threshold": threshold,
        "image": image,
        "video": video,
    }))
}

#[derive(Debug, Serialize)]
struct AnalyzedFace {
    bbox: BoundingBox,
    detection_score: f32,
    similarity: f32,
    matched: bool,
    cluster: usize,
    person_id: Option<String>,
    person_name: Option<String>,
    thumb_relpath: Option<String>,
}

#[derive(Debug, Serialize)]
struct AnalyzedFrame {
    frame: u64,
    time: f64,
    faces: Vec<AnalyzedFace>,
}

#[derive(Debug, Default, Serialize)]
struct AnalysisStatistics {
    frames_with_faces: u64,
    frames_without_faces: u64,
    avg_faces_per_frame: f64,
    max_faces_in_frame: usize,
}

#[derive(Debug, Clone)]
pub struct VideoAnalysisOptions {
    pub threshold: f32,
    pub use_watchlist: bool,
    pub sample_fps: f64,
}

/// Detect every face in `video`, match against the gallery and count distinct people
pub async fn video_analysis(ctx: &AnalysisContext, job_id: &str, video: &Path, options: &VideoAnalysisOptions) -> Result<Value> {
    let started = Instant::now();
    let gallery = if options.use_watchlist {
        ctx.gallery.snapshot().await?
    } else {
        Vec::new()
    };
    let matcher = Matcher::Watchlist {
        gallery: Arc::new(gallery),
    };

    let mut stream = ctx.video.open_video(video, options.sample_fps).await?;
    let mut progress = ProgressReporter::new(ctx.store.as_ref(), job_id);
    let mut clusters = FaceClusters::new(UNIQUE_FACE_SIMILARITY);
    let mut stats = AnalysisStatistics::default();
    let mut detections = Vec::new();
    let mut total_faces = 0usize;
    let mut matched_faces = 0usize;
    let mut frame_index = 0u64;

    while let Some(frame) = next_video_frame(&mut *stream, frame_index, video).await? {
        let frame = Arc::new(frame);
        let faces = ctx.recognizer.detect(&frame).await?;

        total_faces += faces.len();
        stats.max_faces_in_frame = stats.max_faces_in_frame.max(faces.len());
        if faces.is_empty() {
            stats.frames_without_faces += 1;
        } else {
            stats.frames_with_faces += 1;
        }

        let mut analyzed = Vec::with_capacity(faces.len());
        for (index, face) in faces.iter().enumerate() {
            let cluster = clusters.assign(&face.embedding);
            let outcome = matcher.best_match(&face.embedding);
            let matched = outcome.person_id.is_some() && outcome.similarity >= options.threshold;
            if matched {
                matched_faces += 1;
            }
            let thumb_relpath = save_job_thumbnail(ctx, job_id, frame_index, index, &frame, &face.bbox).await;
            analyzed.push(AnalyzedFace {
                bbox: face.bbox,
                detection_score: face.detection_score,
                similarity: outcome.similarity,
                matched,
                cluster,
                person_id: outcome.person_id.filter(|_| matched),
                person_name: outcome.person_name.filter(|_| matched),
                thumb_relpath,
            });
        }
        if !analyzed.is_empty() {
            detections.push(AnalyzedFrame {
                frame: frame_index,
                time: frame_index as f64 / options.sample_fps,
                faces: analyzed,
            });
        }

        frame_index += 1;
        progress.frame_done().await;
    }

    if frame_index > 0 {
        stats.avg_faces_per_frame = total_faces as f64 / frame_index as f64;
    }

    Ok(json!({
        "video": PathBuf::from(video),
        "processed_frames": frame_index,
        "total_faces": total_faces,
        "matched_faces": matched_faces,
        "unique_faces": clusters.len(),
        "processing_time_secs": started.elapsed().as_secs_f64(),
        "statistics": stats,
        "detections": detections,
    }))
}

/// Faces kept per video when matching two videos against each other
pub const MAX_SAMPLED_FACES: usize = 1800;

/// A face seen in a sampled frame, with the frame kept for its thumbnail
struct SampledFace {
    frame: u64,
    time: f64,
    index: usize,
    face: Face,
    image: Arc<DynamicImage>,
}

async fn sample_faces(
    ctx: &AnalysisContext,
    video: &Path,
    sample_fps: f64,
    progress: &mut ProgressReporter<'_>,
) -> Result<Vec<SampledFace>> {
    let mut stream = ctx.video.open_video(video, sample_fps).await?;
    let mut sampled = Vec::new();
    let mut frame_index = 0u64;
    while sampled.len() < MAX_SAMPLED_FACES {
        let Some(frame) = next_video_frame(&mut *stream, frame_index, video).await? else {
            break;
        };
        let image = Arc::new(frame);
        for (index, face) in ctx.recognizer.detect(&image).await?.into_iter().enumerate() {
            sampled.push(SampledFace {
                frame: frame_index,
                time: frame_index as f64 / sample_fps,
                index,
                face,
                image: image.clone(),
            });
        }
        frame_index += 1;
        progress.frame_done().await;
    }
    sampled.truncate(MAX_SAMPLED_FACES);
    Ok(sampled)
}

#[derive(Debug, Serialize)]
struct PairSide {
    time: f64,
    frame: u64,
    bbox: BoundingBox,
    thumb_relpath: Option<String>,
}

#[derive(Debug, Serialize)]
struct VideoPair {
    confidence: f32,
    a: PairSide,
    b: PairSide,
}

async fn pair_side(ctx: &AnalysisContext, subject: &str, sampled: &SampledFace) -> PairSide {
    PairSide {
        time: sampled.time,
        frame: sampled.frame,
        bbox: sampled.face.bbox,
        thumb_relpath: save_job_thumbnail(ctx, subject, sampled.frame, sampled.index, &sampled.image, &sampled.face.bbox).await,
    }
}

/// Pair every face in `video_a` with its most similar face in `video_b`, keeping pairs at or above `threshold`
pub async fn video_to_video(
    ctx: &AnalysisContext,
    job_id: &str,
    video_a: &Path,
    video_b: &Path,
    threshold: f32,
    sample_fps: f64,
) -> Result<Value> {
    let mut progress = ProgressReporter::new(ctx.store.as_ref(), job_id);
    let faces_a = sample_faces(ctx, video_a, sample_fps, &mut progress).await?;
    let faces_b = sample_faces(ctx, video_b, sample_fps, &mut progress).await?;

    let (subject_a, subject_b) = (format!("{}-a", job_id), format!("{}-b", job_id));
    let mut pairs = Vec::new();
    for a in &faces_a {
        let best = faces_b
            .iter()
            .map(|b| (cosine_similarity(&a.face.embedding, &b.face.embedding), b))
            .max_by(|x, y| x.0.total_cmp(&y.0));
        if let Some((similarity, b)) = best.filter(|(s, _)| *s >= threshold) {
            pairs.push(VideoPair {
                confidence: similarity,
                a: pair_side(ctx, &subject_a, a).await,
                b: pair_side(ctx, &subject_b, b).await,
            });
        }
    }

    debug!(job_id = %job_id, faces_a = faces_a.len(), faces_b = faces_b.len(), pairs = pairs.len(), "video pairing finished");
    Ok(json!({
        "pairs": pairs,
        "faces_a": faces_a.len(),
        "faces_b": faces_b.len(),
        "threshold": threshold,
        "video_a": video_a,
        "video_b": video_b,
    }))
}
