//! Known identities matched by watchlist cameras.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub person_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    /// One L2-normalised embedding per registered image
    pub embeddings: Vec<Vec<f32>>,
    #[serde(default)]
    pub reference_images: Vec<String>,
}

impl GalleryEntry {
    pub fn new(person_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            person_id: person_id.into(),
            name: name.into(),
            group_id: None,
            embeddings: Vec::new(),
            reference_images: Vec::new(),
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embeddings.push(embedding);
        self
    }
}
