use crate::recognizer::cosine_similarity;
use common::cameras::{CameraConfig, RecognitionMode};
use common::gallery::GalleryEntry;
use std::sync::Arc;

/// Best reference found for one face
#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    pub similarity: f32,
    pub person_id: Option<String>,
    pub person_name: Option<String>,
}

impl MatchOutcome {
    fn none() -> Self {
        Self {
            similarity: 0.0,
            person_id: None,
            person_name: None,
        }
    }
}

/// What a camera compares faces against, frozen when the worker starts
#[derive(Debug, Clone)]
pub enum Matcher {
    SingleTarget { embedding: Vec<f32> },
    Watchlist { gallery: Arc<Vec<GalleryEntry>> },
}

impl Matcher {
    /// Build the matcher for `config`; `None` if the mode's reference data is missing
    pub fn for_camera(config: &CameraConfig, gallery: Arc<Vec<GalleryEntry>>) -> Option<Self> {
        match config.mode {
            RecognitionMode::SingleTarget => config
                .target_embedding
                .as_ref()
                .filter(|e| !e.is_empty())
                .map(|e| Matcher::SingleTarget {
                    embedding: crate::recognizer::normalized(e.clone()),
                }),
            RecognitionMode::Watchlist => {
                let has_embeddings = gallery.iter().any(|entry| !entry.embeddings.is_empty());
                has_embeddings.then_some(Matcher::Watchlist { gallery })
            }
        }
    }

    pub fn best_match(&self, embedding: &[f32]) -> MatchOutcome {
        match self {
            Matcher::SingleTarget { embedding: target } => MatchOutcome {
                similarity: cosine_similarity(embedding, target),
                person_id: None,
                person_name: None,
            },
            Matcher::Watchlist { gallery } => {
                let mut best = MatchOutcome::none();
                let mut best_similarity = f32::NEG_INFINITY;
                for entry in gallery.iter() {
                    for reference in &entry.embeddings {
                        let similarity = cosine_similarity(embedding, reference);
                        if similarity > best_similarity {
                            best_similarity = similarity;
                            best = MatchOutcome {
                                similarity,
                                person_id: Some(entry.person_id.clone()),
                                person_name: Some(entry.name.clone()),
                            };
                        }
                    }
                }
                best
            }
        }
    }
}
