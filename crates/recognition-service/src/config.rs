use crate::recognizer::OnnxRecognizerConfig;
use crate::worker::WorkerSettings;
use anyhow::{bail, Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which recognizer backs the workers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognizerKind {
    Onnx,
    /// Deterministic replay recognizer; finds no faces unless scripted
    Scripted,
}

impl FromStr for RecognizerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "onnx" => Ok(RecognizerKind::Onnx),
            "scripted" | "mock" => Ok(RecognizerKind::Scripted),
            other => bail!("unknown recognizer '{}' (expected onnx or scripted)", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address to bind the HTTP server to
    pub bind_addr: String,

    /// Postgres URL; in-memory stores when unset
    pub database_url: Option<String>,

    /// Root for thumbnails and saved frames
    pub data_dir: PathBuf,

    /// Directory of job record files
    pub jobs_dir: PathBuf,

    /// Job inputs must live below this directory when set
    pub job_input_dir: Option<PathBuf>,

    pub recognizer: RecognizerKind,
    pub onnx: OnnxRecognizerConfig,

    /// Initial low-quality threshold
    pub quality_threshold: f32,

    pub worker: WorkerSettings,

    /// How long a camera connection may take to deliver its first frame
    pub source_open_timeout: Duration,

    /// Node ID for this instance
    pub node_id: String,
}

impl Default for ServiceConfig {
    /// In-memory standalone settings rooted at `./data`
    fn default() -> Self {
        let data_dir = PathBuf::from("./data");
        Self {
            bind_addr: "0.0.0.0:8090".to_string(),
            database_url: None,
            jobs_dir: data_dir.join("jobs"),
            data_dir,
            job_input_dir: None,
            recognizer: RecognizerKind::Onnx,
            onnx: OnnxRecognizerConfig::default(),
            quality_threshold: crate::quality::DEFAULT_LOW_QUALITY_THRESHOLD,
            worker: WorkerSettings::default(),
            source_open_timeout: Duration::from_secs(10),
            node_id: "recognition-service".to_string(),
        }
    }
}

fn var_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("Invalid {}: {:?}", name, raw)),
        Err(_) => Ok(default),
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr =
            env::var("RECOGNITION_SERVICE_ADDR").unwrap_or_else(|_| "0.0.0.0:8090".to_string());

        let database_url = env::var("DATABASE_URL").ok().filter(|s| !s.trim().is_empty());

        let data_dir = PathBuf::from(env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string()));
        let jobs_dir = env::var("JOBS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("jobs"));
        let job_input_dir = env::var("JOB_INPUT_DIR").ok().map(PathBuf::from);

        let recognizer = var_or("RECOGNIZER", RecognizerKind::Onnx)?;

        let model_dir = PathBuf::from(env::var("MODEL_DIR").unwrap_or_else(|_| "./models".to_string()));
        let defaults = OnnxRecognizerConfig::default();
        let onnx = OnnxRecognizerConfig {
            detection_model_path: env::var("DETECTION_MODEL")
                .unwrap_or_else(|_| model_dir.join("face_detector.onnx").to_string_lossy().into_owned()),
            embedding_model_path: env::var("EMBEDDING_MODEL")
                .unwrap_or_else(|_| model_dir.join("face_embedding.onnx").to_string_lossy().into_owned()),
            execution_provider: env::var("EXECUTION_PROVIDER")
                .unwrap_or_else(|_| defaults.execution_provider.clone()),
            ..defaults
        };

        let quality_threshold = var_or("QUALITY_THRESHOLD", crate::quality::DEFAULT_LOW_QUALITY_THRESHOLD)?;
        common::validation::validate_range(quality_threshold, 0.0, 1.0, "QUALITY_THRESHOLD")?;

        let base = WorkerSettings::default();
        let worker = WorkerSettings {
            preview_fps: var_or("PREVIEW_FPS", base.preview_fps)?,
            preview_max_width: var_or("PREVIEW_MAX_WIDTH", base.preview_max_width)?,
            cooldown: Duration::from_millis(var_or("EVENT_COOLDOWN_MS", base.cooldown.as_millis() as u64)?),
            max_read_failures: var_or("MAX_READ_FAILURES", base.max_read_failures)?,
            stop_timeout: Duration::from_millis(var_or("STOP_TIMEOUT_MS", base.stop_timeout.as_millis() as u64)?),
            subscriber_capacity: var_or("SUBSCRIBER_CAPACITY", base.subscriber_capacity)?,
            recent_capacity: var_or("RECENT_EVENTS", base.recent_capacity)?,
            ..base
        };
        if !(worker.preview_fps > 0.0) {
            bail!("PREVIEW_FPS must be positive");
        }

        let source_open_timeout = Duration::from_millis(var_or("SOURCE_OPEN_TIMEOUT_MS", 10_000u64)?);

        let node_id = env::var("NODE_ID").unwrap_or_else(|_| {
            format!(
                "recognition-service-{}",
                hostname::get()
                    .ok()
                    .and_then(|h| h.into_string().ok())
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
            )
        });

        Ok(Self {
            bind_addr,
            database_url,
            data_dir,
            jobs_dir,
            job_input_dir,
            recognizer,
            onnx,
            quality_threshold,
            worker,
            source_open_timeout,
            node_id,
        })
    }
}
