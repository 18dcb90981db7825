//! Camera configuration contracts.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::events::ParseEnumError;

/// RTSP transport hint passed to the frame source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Tcp,
    Udp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }
}

impl FromStr for Transport {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Transport::Tcp),
            "udp" => Ok(Transport::Udp),
            other => Err(ParseEnumError::new("transport", other)),
        }
    }
}

/// How a camera decides whether a detected face is a match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecognitionMode {
    /// Compare every face against one reference embedding
    SingleTarget,
    /// Compare every face against the whole gallery and keep the best match
    #[default]
    Watchlist,
}

impl RecognitionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecognitionMode::SingleTarget => "single_target",
            RecognitionMode::Watchlist => "watchlist",
        }
    }
}

impl fmt::Display for RecognitionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecognitionMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single_target" | "single-target" | "single" => Ok(RecognitionMode::SingleTarget),
            "watchlist" => Ok(RecognitionMode::Watchlist),
            other => Err(ParseEnumError::new("recognition mode", other)),
        }
    }
}

/// Persisted desired state of one camera
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Source address (rtsp://, http://, file path or device)
    pub url: String,

    #[serde(default)]
    pub transport: Transport,

    /// Recognition sample rate in frames per second
    #[serde(default = "default_fps")]
    pub fps: f64,

    /// Minimum cosine similarity for a match
    #[serde(default = "default_threshold")]
    pub threshold: f32,

    #[serde(default)]
    pub mode: RecognitionMode,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Reference embedding for single-target cameras
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_embedding: Option<Vec<f32>>,

    /// Creation time (Unix ms); filled in by the store when zero
    #[serde(default)]
    pub created_at: i64,
}

pub fn default_fps() -> f64 {
    3.0
}

pub fn default_threshold() -> f32 {
    0.6
}

fn default_enabled() -> bool {
    true
}

impl CameraConfig {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            url: url.into(),
            transport: Transport::default(),
            fps: default_fps(),
            threshold: default_threshold(),
            mode: RecognitionMode::default(),
            enabled: true,
            target_embedding: None,
            created_at: 0,
        }
    }

    pub fn with_mode(mut self, mode: RecognitionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_target(mut self, embedding: Vec<f32>) -> Self {
        self.mode = RecognitionMode::SingleTarget;
        self.target_embedding = Some(embedding);
        self
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_fps(mut self, fps: f64) -> Self {
        self.fps = fps;
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}
