use crate::config::ServiceConfig;
use crate::jobs::analysis::AnalysisContext;
use crate::jobs::JobRunner;
use crate::media::MediaStore;
use crate::quality::QualityThreshold;
use crate::recognizer::Recognizer;
use crate::registry::CameraRegistry;
use crate::source::{FrameSource, VideoFileSource};
use crate::store::Stores;
use crate::worker::WorkerDeps;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// How long in-flight jobs get to observe cancellation at shutdown
const JOB_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    node_id: String,
    recognizer_name: String,
    stores: Stores,
    media: MediaStore,
    registry: CameraRegistry,
    jobs: JobRunner,
    quality: Arc<QualityThreshold>,
}

impl AppState {
    pub fn new(
        node_id: String,
        recognizer_name: String,
        stores: Stores,
        media: MediaStore,
        registry: CameraRegistry,
        jobs: JobRunner,
        quality: Arc<QualityThreshold>,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                node_id,
                recognizer_name,
                stores,
                media,
                registry,
                jobs,
                quality,
            }),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn recognizer_name(&self) -> &str {
        &self.inner.recognizer_name
    }

    pub fn stores(&self) -> &Stores {
        &self.inner.stores
    }

    pub fn media(&self) -> &MediaStore {
        &self.inner.media
    }

    pub fn registry(&self) -> &CameraRegistry {
        &self.inner.registry
    }

    pub fn jobs(&self) -> &JobRunner {
        &self.inner.jobs
    }

    pub fn quality(&self) -> &QualityThreshold {
        &self.inner.quality
    }

    /// Stop every camera worker and cancel outstanding jobs
    pub async fn shutdown(&self) {
        info!(node_id = %self.node_id(), "shutting down recognition service");
        self.inner.registry.shutdown().await;
        self.inner.jobs.shutdown(JOB_SHUTDOWN_TIMEOUT).await;
    }
}

/// Wire the registry and job runner over the given stores and collaborators
pub fn build_state(
    config: &ServiceConfig,
    stores: Stores,
    recognizer: Arc<dyn Recognizer>,
    source: Arc<dyn FrameSource>,
    video: Arc<dyn VideoFileSource>,
) -> AppState {
    let quality = Arc::new(QualityThreshold::new(config.quality_threshold));
    let media = MediaStore::new(config.data_dir.clone());
    let recognizer_name = recognizer.name().to_string();

    let deps = WorkerDeps {
        recognizer: recognizer.clone(),
        source,
        events: stores.events.clone(),
        media: media.clone(),
        quality: quality.clone(),
        settings: config.worker.clone(),
    };
    let registry = CameraRegistry::new(stores.cameras.clone(), stores.gallery.clone(), deps);

    let mut jobs = JobRunner::new(AnalysisContext {
        store: stores.jobs.clone(),
        recognizer,
        gallery: stores.gallery.clone(),
        video,
        media: media.clone(),
    });
    if let Some(dir) = &config.job_input_dir {
        jobs = jobs.with_input_dir(dir.clone());
    }

    AppState::new(config.node_id.clone(), recognizer_name, stores, media, registry, jobs, quality)
}
