//! In-process frame source that replays fixed images.
//!
//! Live streams cycle through the images forever; video files play them once.

use super::{FrameSource, FrameStream, VideoFileSource};
use anyhow::{bail, Result};
use async_trait::async_trait;
use common::cameras::Transport;
use image::DynamicImage;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct ScriptedSource {
    frames: Arc<Vec<DynamicImage>>,
    frame_interval: Duration,
    /// Number of initial `open` calls that fail before one succeeds
    failing_opens: AtomicUsize,
    opens: AtomicUsize,
    live_streams: Arc<AtomicUsize>,
}

impl ScriptedSource {
    pub fn new(frames: Vec<DynamicImage>) -> Self {
        Self {
            frames: Arc::new(frames),
            frame_interval: Duration::from_millis(10),
            failing_opens: AtomicUsize::new(0),
            opens: AtomicUsize::new(0),
            live_streams: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A source producing a solid grey frame of the given size
    pub fn solid(width: u32, height: u32) -> Self {
        Self::new(vec![DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            width,
            height,
            image::Rgb([128, 128, 128]),
        ))])
    }

    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    pub fn with_failing_opens(self, count: usize) -> Self {
        self.failing_opens.store(count, Ordering::SeqCst);
        self
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn stream(&self, cycle: bool) -> ScriptedStream {
        self.live_streams.fetch_add(1, Ordering::SeqCst);
        ScriptedStream {
            frames: self.frames.clone(),
            interval: self.frame_interval,
            position: 0,
            cycle,
            live: self.live_streams.clone(),
        }
    }

    /// Streams opened and not yet dropped
    pub fn live_streams(&self) -> usize {
        self.live_streams.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FrameSource for ScriptedSource {
    async fn open(&self, url: &str, _transport: Transport) -> Result<Box<dyn FrameStream>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let should_fail = self
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            bail!("connection refused: {}", url);
        }

        Ok(Box::new(self.stream(true)))
    }
}

#[async_trait]
impl VideoFileSource for ScriptedSource {
    async fn open_video(&self, path: &Path, _sample_fps: f64) -> Result<Box<dyn FrameStream>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if !path.exists() {
            bail!("no such video: {}", path.display());
        }
        Ok(Box::new(self.stream(false)))
    }
}

struct ScriptedStream {
    frames: Arc<Vec<DynamicImage>>,
    interval: Duration,
    position: usize,
    cycle: bool,
    live: Arc<AtomicUsize>,
}

#[async_trait]
impl FrameStream for ScriptedStream {
    async fn next_frame(&mut self) -> Result<DynamicImage> {
        tokio::time::sleep(self.interval).await;
        if self.frames.is_empty() {
            bail!("no frames configured");
        }
        if self.is_closed() {
            bail!("end of video");
        }
        let frame = self.frames[self.position % self.frames.len()].clone();
        self.position += 1;
        Ok(frame)
    }

    fn is_closed(&self) -> bool {
        !self.cycle && self.position >= self.frames.len()
    }
}

impl Drop for ScriptedStream {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}
