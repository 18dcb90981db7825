//! Two-stage ONNX face recognizer: a YOLO-style face detector followed by an
//! ArcFace-style embedder run on each detected crop.

use super::{l2_normalize, Face, Recognizer};
use anyhow::{Context, Result};
use async_trait::async_trait;
use common::events::BoundingBox;
use image::DynamicImage;
use ndarray::{Array, IxDyn};
use ort::{
    execution_providers::{CPUExecutionProvider, CUDAExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
    value::Value,
};
use std::time::Instant;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct OnnxRecognizerConfig {
    pub detection_model_path: String,
    pub embedding_model_path: String,
    /// Minimum detector score for a face box
    pub confidence_threshold: f32,
    /// IoU above which overlapping boxes are suppressed
    pub iou_threshold: f32,
    pub max_detections: usize,
    pub detection_input_size: u32,
    pub embedding_input_size: u32,
    /// CPU, CUDA or TensorRT; falls back towards CPU when unavailable
    pub execution_provider: String,
    pub device_id: i32,
    pub intra_threads: usize,
    pub inter_threads: usize,
}

impl Default for OnnxRecognizerConfig {
    fn default() -> Self {
        Self {
            detection_model_path: "models/face_detector.onnx".to_string(),
            embedding_model_path: "models/face_embedding.onnx".to_string(),
            confidence_threshold: 0.6,
            iou_threshold: 0.4,
            max_detections: 50,
            detection_input_size: 640,
            embedding_input_size: 112,
            execution_provider: "CPU".to_string(),
            device_id: 0,
            intra_threads: 4,
            inter_threads: 1,
        }
    }
}

pub struct OnnxRecognizer {
    config: OnnxRecognizerConfig,
    detection_session: Mutex<Session>,
    embedding_session: Mutex<Session>,
    execution_provider: String,
}

impl OnnxRecognizer {
    /// Load both models, trying the preferred execution provider first
    pub fn load(config: OnnxRecognizerConfig) -> Result<Self> {
        let (detection, provider) = create_session(&config, &config.detection_model_path)
            .context("Failed to load face detection model")?;
        let (embedding, _) = create_session(&config, &config.embedding_model_path)
            .context("Failed to load face embedding model")?;

        tracing::info!(
            detection_model = %config.detection_model_path,
            embedding_model = %config.embedding_model_path,
            execution_provider = %provider,
            "onnx recognizer ready"
        );

        Ok(Self {
            config,
            detection_session: Mutex::new(detection),
            embedding_session: Mutex::new(embedding),
            execution_provider: provider,
        })
    }

    pub fn execution_provider(&self) -> &str {
        &self.execution_provider
    }

    fn preprocess_for_detection(&self, img: &DynamicImage) -> (Array<f32, IxDyn>, Letterbox) {
        let size = self.config.detection_input_size;
        let letterbox = Letterbox::fit(img.width(), img.height(), size);
        let resized = img.resize_exact(
            letterbox.scaled_width,
            letterbox.scaled_height,
            image::imageops::FilterType::Triangle,
        );
        let mut canvas = image::RgbImage::from_pixel(size, size, image::Rgb([114, 114, 114]));
        image::imageops::replace(
            &mut canvas,
            &resized.to_rgb8(),
            i64::from(letterbox.pad_x),
            i64::from(letterbox.pad_y),
        );
        let input = to_nchw(&DynamicImage::ImageRgb8(canvas), size, |v| v as f32 / 255.0);
        (input, letterbox)
    }

    /// ArcFace expects inputs scaled to [-1, 1]
    fn preprocess_for_embedding(&self, img: &DynamicImage) -> Array<f32, IxDyn> {
        to_nchw(img, self.config.embedding_input_size, |v| {
            (v as f32 / 127.5) - 1.0
        })
    }

    /// Decode `[batch, 5, N]` (cx, cy, w, h, score) in letterboxed input space into frame-space boxes
    fn postprocess_detection(
        &self,
        output: &Array<f32, IxDyn>,
        letterbox: &Letterbox,
        original_width: u32,
        original_height: u32,
    ) -> Vec<(BoundingBox, f32)> {
        let shape = output.shape();
        if shape.len() != 3 || shape[1] < 5 {
            tracing::warn!(shape = ?shape, "unexpected detector output shape");
            return Vec::new();
        }

        let max_x = original_width as f32;
        let max_y = original_height as f32;

        let mut boxes = Vec::new();
        for i in 0..shape[2] {
            let confidence = output[[0, 4, i]];
            if confidence < self.config.confidence_threshold {
                continue;
            }

            let cx = output[[0, 0, i]];
            let cy = output[[0, 1, i]];
            let w = output[[0, 2, i]];
            let h = output[[0, 3, i]];

            let (x1, y1) = letterbox.frame_point(cx - w / 2.0, cy - h / 2.0);
            let (x2, y2) = letterbox.frame_point(cx + w / 2.0, cy + h / 2.0);
            let (x1, x2) = (x1.clamp(0.0, max_x), x2.clamp(0.0, max_x));
            let (y1, y2) = (y1.clamp(0.0, max_y), y2.clamp(0.0, max_y));

            let bbox = BoundingBox::new(x1 as i32, y1 as i32, x2 as i32, y2 as i32);
            if bbox.width() > 0 && bbox.height() > 0 {
                boxes.push((bbox, confidence));
            }
        }

        let mut kept = nms(boxes, self.config.iou_threshold);
        kept.truncate(self.config.max_detections);
        kept
    }

    async fn extract_embedding(&self, face_img: &DynamicImage) -> Result<Vec<f32>> {
        let input_tensor = Value::from_array(self.preprocess_for_embedding(face_img))?;

        let mut session = self.embedding_session.lock().await;
        let outputs = session.run(ort::inputs![input_tensor])?;

        let output_value = outputs
            .get("output")
            .or_else(|| outputs.get("output0"))
            .or_else(|| outputs.get("embedding"))
            .context("No embedding output tensor found")?;
        let (_, data) = output_value.try_extract_tensor::<f32>()?;

        let mut embedding = data.to_vec();
        l2_normalize(&mut embedding);
        Ok(embedding)
    }
}

#[async_trait]
impl Recognizer for OnnxRecognizer {
    fn name(&self) -> &str {
        "onnx"
    }

    async fn detect(&self, img: &DynamicImage) -> Result<Vec<Face>> {
        let started = Instant::now();
        let (input, letterbox) = self.preprocess_for_detection(img);
        let input_tensor = Value::from_array(input)?;

        let output = {
            let mut session = self.detection_session.lock().await;
            let outputs = session.run(ort::inputs![input_tensor])?;
            let output_value = outputs
                .get("output0")
                .or_else(|| outputs.get("output"))
                .or_else(|| outputs.get("boxes"))
                .context("No detection output tensor found")?;
            let (shape, data) = output_value.try_extract_tensor::<f32>()?;
            let dims: Vec<usize> = shape.as_ref().iter().map(|&x| x as usize).collect();
            Array::from_shape_vec(IxDyn(&dims), data.to_vec())?
        };

        let boxes = self.postprocess_detection(&output, &letterbox, img.width(), img.height());

        let mut faces = Vec::with_capacity(boxes.len());
        for (bbox, detection_score) in boxes {
            let crop = img.crop_imm(
                bbox.x1 as u32,
                bbox.y1 as u32,
                bbox.width() as u32,
                bbox.height() as u32,
            );
            match self.extract_embedding(&crop).await {
                Ok(embedding) => faces.push(Face {
                    bbox,
                    detection_score,
                    embedding,
                }),
                Err(e) => tracing::warn!(error = %e, "embedding extraction failed"),
            }
        }

        tracing::trace!(
            faces = faces.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            provider = %self.execution_provider,
            "onnx detect"
        );
        Ok(faces)
    }
}

/// Aspect-preserving fit of a frame into a square detector input, centred with padding
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    scaled_width: u32,
    scaled_height: u32,
    pad_x: u32,
    pad_y: u32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, size: u32) -> Self {
        let scale = (size as f32 / width.max(1) as f32).min(size as f32 / height.max(1) as f32);
        let scaled_width = ((width as f32 * scale).round() as u32).clamp(1, size);
        let scaled_height = ((height as f32 * scale).round() as u32).clamp(1, size);
        Self {
            scale,
            scaled_width,
            scaled_height,
            pad_x: (size - scaled_width) / 2,
            pad_y: (size - scaled_height) / 2,
        }
    }

    /// Map a point in detector input space back to the original frame
    fn frame_point(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

fn to_nchw(img: &DynamicImage, size: u32, scale: impl Fn(u8) -> f32) -> Array<f32, IxDyn> {
    let resized = img.resize_exact(size, size, image::imageops::FilterType::Triangle);
    let rgb = resized.to_rgb8();

    let mut input = Array::zeros(IxDyn(&[1, 3, size as usize, size as usize]));
    for (x, y, pixel) in rgb.enumerate_pixels() {
        for c in 0..3 {
            input[[0, c, y as usize, x as usize]] = scale(pixel[c]);
        }
    }
    input
}

/// Greedy non-maximum suppression, highest score first
fn nms(mut boxes: Vec<(BoundingBox, f32)>, iou_threshold: f32) -> Vec<(BoundingBox, f32)> {
    boxes.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut keep: Vec<(BoundingBox, f32)> = Vec::new();
    for candidate in boxes {
        if keep
            .iter()
            .all(|(kept, _)| iou(kept, &candidate.0) < iou_threshold)
        {
            keep.push(candidate);
        }
    }
    keep
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let intersection = if x2 > x1 && y2 > y1 {
        ((x2 - x1) * (y2 - y1)) as f32
    } else {
        0.0
    };

    let area_a = (a.width() * a.height()) as f32;
    let area_b = (b.width() * b.height()) as f32;
    let union = area_a + area_b - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

fn builder(config: &OnnxRecognizerConfig) -> Result<ort::session::builder::SessionBuilder> {
    Session::builder()
        .context("Failed to create session builder")?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .context("Failed to set optimization level")?
        .with_intra_threads(config.intra_threads)
        .context("Failed to set intra threads")?
        .with_inter_threads(config.inter_threads)
        .context("Failed to set inter threads")
}

/// Create a session, falling back TensorRT → CUDA → CPU
fn create_session(config: &OnnxRecognizerConfig, model_path: &str) -> Result<(Session, String)> {
    match config.execution_provider.to_uppercase().as_str() {
        "TENSORRT" => {
            tracing::info!("Attempting TensorRT for {}", model_path);
            let result = builder(config)?
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_device_id(config.device_id)
                        .build(),
                    CUDAExecutionProvider::default()
                        .with_device_id(config.device_id)
                        .build(),
                    CPUExecutionProvider::default().build(),
                ])
                .context("Failed to set execution providers")?
                .commit_from_file(model_path);

            match result {
                Ok(session) => Ok((session, "TensorRT".to_string())),
                Err(e) => {
                    tracing::warn!("TensorRT failed, trying CUDA: {}", e);
                    try_cuda(config, model_path)
                }
            }
        }
        "CUDA" => try_cuda(config, model_path),
        _ => try_cpu(config, model_path),
    }
}

fn try_cuda(config: &OnnxRecognizerConfig, model_path: &str) -> Result<(Session, String)> {
    tracing::info!("Attempting CUDA for {}", model_path);
    let result = builder(config)?
        .with_execution_providers([
            CUDAExecutionProvider::default()
                .with_device_id(config.device_id)
                .build(),
            CPUExecutionProvider::default().build(),
        ])
        .context("Failed to set execution providers")?
        .commit_from_file(model_path);

    match result {
        Ok(session) => Ok((session, "CUDA".to_string())),
        Err(e) => {
            tracing::warn!("CUDA failed, using CPU: {}", e);
            try_cpu(config, model_path)
        }
    }
}

fn try_cpu(config: &OnnxRecognizerConfig, model_path: &str) -> Result<(Session, String)> {
    tracing::info!("Using CPU for {}", model_path);
    let session = builder(config)?
        .commit_from_file(model_path)
        .context("Failed to load model from file")?;
    Ok((session, "CPU".to_string()))
}
