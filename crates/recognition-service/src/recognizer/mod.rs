//! Face detection and embedding.
//!
//! A [`Recognizer`] turns one decoded frame into zero or more [`Face`]s, each
//! carrying an L2-normalised embedding so similarity is a plain dot product.

pub mod onnx;
pub mod scripted;

use anyhow::Result;
use async_trait::async_trait;
use common::events::BoundingBox;
use image::DynamicImage;

pub use onnx::{OnnxRecognizer, OnnxRecognizerConfig};
pub use scripted::ScriptedRecognizer;

/// One detected face
#[derive(Debug, Clone, PartialEq)]
pub struct Face {
    pub bbox: BoundingBox,
    pub detection_score: f32,
    /// L2-normalised embedding
    pub embedding: Vec<f32>,
}

#[async_trait]
pub trait Recognizer: Send + Sync {
    /// Short identifier used in logs and metrics labels
    fn name(&self) -> &str;

    /// Detect faces; a frame without faces yields an empty vec, not an error
    async fn detect(&self, image: &DynamicImage) -> Result<Vec<Face>>;
}

/// Normalise in place; a zero vector is left untouched
pub fn l2_normalize(embedding: &mut [f32]) {
    let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for val in embedding.iter_mut() {
            *val /= norm;
        }
    }
}

pub fn normalized(mut embedding: Vec<f32>) -> Vec<f32> {
    l2_normalize(&mut embedding);
    embedding
}

/// Cosine similarity of two L2-normalised vectors; mismatched lengths score 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}
