//! Live video sources.
//!
//! A [`FrameSource`] opens a connection and hands back a [`FrameStream`] that
//! yields decoded frames one at a time. Dropping the stream releases the
//! connection.

pub mod ffmpeg;
pub mod scripted;

use anyhow::Result;
use async_trait::async_trait;
use common::cameras::Transport;
use image::DynamicImage;
use std::path::Path;
use std::sync::Arc;

pub use ffmpeg::{FfmpegSource, FfmpegStream};
pub use scripted::ScriptedSource;

/// A decoded frame tagged with its position in the capture sequence
#[derive(Clone)]
pub struct Frame {
    /// Increases by one per frame read from the source, across reconnects
    pub seq: u64,
    pub captured_at_ms: i64,
    pub image: Arc<DynamicImage>,
}

#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn open(&self, url: &str, transport: Transport) -> Result<Box<dyn FrameStream>>;
}

#[async_trait]
pub trait FrameStream: Send {
    async fn next_frame(&mut self) -> Result<DynamicImage>;

    /// True once the underlying connection has ended and reads can no longer succeed
    fn is_closed(&self) -> bool {
        false
    }
}

/// Local video files decoded frame by frame; the stream ends at end of file
#[async_trait]
pub trait VideoFileSource: Send + Sync {
    async fn open_video(&self, path: &Path, sample_fps: f64) -> Result<Box<dyn FrameStream>>;
}
