//! Frame source backed by an `ffmpeg` child process writing an MJPEG
//! `image2pipe` stream to stdout.

use super::{FrameSource, FrameStream, VideoFileSource};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use common::cameras::Transport;
use image::DynamicImage;
use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::Mutex;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];
const READ_CHUNK: usize = 64 * 1024;
/// Upper bound on a single encoded frame before the buffer is considered corrupt
const MAX_FRAME_BYTES: usize = 32 * 1024 * 1024;
const STDERR_TAIL_LINES: usize = 5;

#[derive(Debug, Clone)]
pub struct FfmpegSource {
    binary: String,
    /// mjpeg quality scale (2-31, lower is better)
    jpeg_quality: u32,
    /// How long `open` waits for the first frame
    open_timeout: Duration,
}

impl Default for FfmpegSource {
    fn default() -> Self {
        Self {
            binary: std::env::var("FFMPEG_BIN").unwrap_or_else(|_| "ffmpeg".to_string()),
            jpeg_quality: 5,
            open_timeout: Duration::from_secs(10),
        }
    }
}

impl FfmpegSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    fn base_args(&self) -> Vec<String> {
        vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-nostdin".into(),
        ]
    }

    fn output_args(&self) -> Vec<String> {
        vec![
            "-f".into(),
            "image2pipe".into(),
            "-vcodec".into(),
            "mjpeg".into(),
            "-q:v".into(),
            self.jpeg_quality.to_string(),
            "-".into(),
        ]
    }

    fn live_args(&self, url: &str, transport: Transport) -> Vec<String> {
        let mut args = self.base_args();
        if url.starts_with("rtsp://") || url.starts_with("rtsps://") {
            args.push("-rtsp_transport".into());
            args.push(transport.as_str().into());
        }
        args.push("-i".into());
        args.push(url.into());
        args.extend(self.output_args());
        args
    }

    fn file_args(&self, path: &Path, sample_fps: Option<f64>) -> Result<Vec<String>> {
        let path = path
            .to_str()
            .ok_or_else(|| anyhow!("video path is not valid UTF-8"))?;
        let mut args = self.base_args();
        args.push("-i".into());
        args.push(path.into());
        if let Some(fps) = sample_fps.filter(|f| *f > 0.0) {
            args.push("-vf".into());
            args.push(format!("fps={}", fps));
        }
        args.extend(self.output_args());
        Ok(args)
    }

    fn spawn(&self, args: &[String]) -> Result<FfmpegStream> {
        tracing::debug!(args = ?args, "spawning ffmpeg");
        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.binary))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("ffmpeg stdout not captured"))?;

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        if let Some(stderr) = child.stderr.take() {
            let tail = stderr_tail.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    push_tail(&mut *tail.lock().await, line);
                }
            });
        }

        Ok(FfmpegStream {
            _child: child,
            stdout,
            stderr_tail,
            buffer: Vec::with_capacity(READ_CHUNK),
            pending: None,
            closed: false,
        })
    }

    /// Decode a video file, optionally resampled to `sample_fps` frames per second
    pub fn open_file(&self, path: &Path, sample_fps: Option<f64>) -> Result<FfmpegStream> {
        let args = self.file_args(path, sample_fps)?;
        self.spawn(&args)
    }
}

#[async_trait]
impl FrameSource for FfmpegSource {
    async fn open(&self, url: &str, transport: Transport) -> Result<Box<dyn FrameStream>> {
        let mut stream = self.spawn(&self.live_args(url, transport))?;

        // The process starts even for unreachable cameras; only a decoded frame proves the connection.
        let first = tokio::time::timeout(self.open_timeout, stream.read_frame())
            .await
            .map_err(|_| anyhow!("no frame within {:?}", self.open_timeout))??;
        stream.pending = Some(first);

        Ok(Box::new(stream))
    }
}

#[async_trait]
impl VideoFileSource for FfmpegSource {
    async fn open_video(&self, path: &Path, sample_fps: f64) -> Result<Box<dyn FrameStream>> {
        Ok(Box::new(self.open_file(path, Some(sample_fps))?))
    }
}

pub struct FfmpegStream {
    _child: Child,
    stdout: ChildStdout,
    /// Last lines ffmpeg wrote to stderr, quoted when the stream ends
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    buffer: Vec<u8>,
    pending: Option<DynamicImage>,
    closed: bool,
}

impl FfmpegStream {
    async fn read_frame(&mut self) -> Result<DynamicImage> {
        loop {
            if let Some(jpeg) = take_jpeg(&mut self.buffer) {
                return tokio::task::spawn_blocking(move || {
                    image::load_from_memory_with_format(&jpeg, image::ImageFormat::Jpeg)
                })
                .await
                .context("decode task failed")?
                .context("failed to decode frame");
            }

            if self.buffer.len() > MAX_FRAME_BYTES {
                self.buffer.clear();
                bail!("frame exceeded {} bytes without end marker", MAX_FRAME_BYTES);
            }

            let mut chunk = vec![0u8; READ_CHUNK];
            let n = self
                .stdout
                .read(&mut chunk)
                .await
                .context("failed to read from ffmpeg")?;
            if n == 0 {
                self.closed = true;
                let tail = self.stderr_tail.lock().await;
                return Err(ended_error(&tail));
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }
}

#[async_trait]
impl FrameStream for FfmpegStream {
    async fn next_frame(&mut self) -> Result<DynamicImage> {
        if let Some(frame) = self.pending.take() {
            return Ok(frame);
        }
        if self.closed {
            bail!("source ended");
        }
        self.read_frame().await
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

fn push_tail(tail: &mut VecDeque<String>, line: String) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    if tail.len() == STDERR_TAIL_LINES {
        tail.pop_front();
    }
    tail.push_back(line.to_string());
}

fn ended_error(tail: &VecDeque<String>) -> anyhow::Error {
    if tail.is_empty() {
        anyhow!("source ended")
    } else {
        let lines: Vec<&str> = tail.iter().map(String::as_str).collect();
        anyhow!("source ended: {}", lines.join("; "))
    }
}

fn find(haystack: &[u8], needle: &[u8; 2], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(2)
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Split the first complete JPEG off the front of `buffer`, discarding leading garbage
fn take_jpeg(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let start = find(buffer, &SOI, 0)?;
    let end = find(buffer, &EOI, start + 2)? + 2;
    let jpeg = buffer[start..end].to_vec();
    buffer.drain(..end);
    Some(jpeg)
}
