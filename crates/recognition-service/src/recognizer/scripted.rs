//! Deterministic recognizer that replays queued responses.
//!
//! Used when no models are configured (`RECOGNIZER=scripted`) and throughout
//! the test suite to drive workers with known embeddings.

use super::{Face, Recognizer};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use image::DynamicImage;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

enum Step {
    Faces(Vec<Face>),
    Fail(String),
}

#[derive(Default)]
pub struct ScriptedRecognizer {
    script: Mutex<VecDeque<Step>>,
    /// Returned once the script is exhausted
    fallback: Vec<Face>,
    latency: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallback(mut self, faces: Vec<Face>) -> Self {
        self.fallback = faces;
        self
    }

    /// Simulated inference time per call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn push_faces(&self, faces: Vec<Face>) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Step::Faces(faces));
    }

    pub fn push_error(&self, message: impl Into<String>) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Step::Fail(message.into()));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Recognizer for ScriptedRecognizer {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn detect(&self, _image: &DynamicImage) -> Result<Vec<Face>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let step = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();

        match step {
            Some(Step::Faces(faces)) => Ok(faces),
            Some(Step::Fail(message)) => Err(anyhow!(message)),
            None => Ok(self.fallback.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::events::BoundingBox;

    fn face(x: f32) -> Face {
        Face {
            bbox: BoundingBox::new(0, 0, 10, 10),
            detection_score: 0.9,
            embedding: vec![x, 0.0],
        }
    }

    #[tokio::test]
    async fn test_replays_script_then_fallback() {
        let recognizer = ScriptedRecognizer::new().with_fallback(vec![face(1.0)]);
        recognizer.push_faces(vec![]);
        recognizer.push_error("decoder exploded");

        let img = DynamicImage::new_rgb8(4, 4);
        assert!(recognizer.detect(&img).await.unwrap().is_empty());
        assert!(recognizer.detect(&img).await.is_err());
        assert_eq!(recognizer.detect(&img).await.unwrap(), vec![face(1.0)]);
        assert_eq!(recognizer.calls(), 3);
    }
}
