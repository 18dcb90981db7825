//! Camera registry: persisted camera configs plus the set of running workers.
//!
//! Lifecycle changes (start, stop, reload) are serialised by one async lock so
//! that replacing a worker never leaves two workers for the same camera.

use crate::matching::Matcher;
use crate::recognizer::normalized;
use crate::store::{CameraStore, GalleryStore};
use crate::worker::{CameraWorker, WorkerDeps, WorkerStatus};
use common::cameras::{CameraConfig, RecognitionMode};
use common::gallery::GalleryEntry;
use common::validation::{validate_id, validate_length, validate_range, validate_uri};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid camera config: {0}")]
    Invalid(String),

    #[error("camera '{0}' not found")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct ReloadFailure {
    pub camera_id: String,
    pub error: String,
}

/// Outcome of starting every enabled camera
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReloadReport {
    pub started: Vec<String>,
    pub failed: Vec<ReloadFailure>,
}

pub struct CameraRegistry {
    cameras: Arc<dyn CameraStore>,
    gallery: Arc<dyn GalleryStore>,
    deps: WorkerDeps,
    workers: RwLock<HashMap<String, Arc<CameraWorker>>>,
    lifecycle: Mutex<()>,
}

impl CameraRegistry {
    pub fn new(cameras: Arc<dyn CameraStore>, gallery: Arc<dyn GalleryStore>, deps: WorkerDeps) -> Self {
        Self {
            cameras,
            gallery,
            deps,
            workers: RwLock::new(HashMap::new()),
            lifecycle: Mutex::new(()),
        }
    }

    /// Field checks that do not depend on the gallery
    fn validate_fields(&self, config: &CameraConfig) -> Result<(), RegistryError> {
        let invalid = |e: anyhow::Error| RegistryError::Invalid(e.to_string());
        validate_id(&config.id, "id").map_err(invalid)?;
        validate_uri(&config.url, "url").map_err(invalid)?;
        if let Some(name) = &config.name {
            validate_length(name, 256, "name").map_err(invalid)?;
        }
        validate_range(config.threshold, 0.0, 1.0, "threshold").map_err(invalid)?;
        let max_fps = self.deps.settings.preview_fps;
        if !(config.fps > 0.0 && config.fps <= max_fps) {
            return Err(RegistryError::Invalid(format!(
                "fps must be in (0, {}], got {}",
                max_fps, config.fps
            )));
        }
        Ok(())
    }

    /// Full start-time validation; yields the matcher the worker will use
    fn validate(&self, config: &CameraConfig, gallery: Arc<Vec<GalleryEntry>>) -> Result<Matcher, RegistryError> {
        self.validate_fields(config)?;
        Matcher::for_camera(config, gallery).ok_or_else(|| {
            RegistryError::Invalid(match config.mode {
                RecognitionMode::SingleTarget => "single_target mode requires a target_embedding".to_string(),
                RecognitionMode::Watchlist => "watchlist mode requires a non-empty gallery".to_string(),
            })
        })
    }

    fn prepared(config: &CameraConfig) -> CameraConfig {
        let mut config = config.clone();
        config.target_embedding = config.target_embedding.map(normalized);
        config
    }

    async fn gallery_snapshot(&self) -> Result<Arc<Vec<GalleryEntry>>, RegistryError> {
        Ok(Arc::new(self.gallery.snapshot().await?))
    }

    /// Store a config without starting it
    pub async fn upsert(&self, config: &CameraConfig) -> Result<CameraConfig, RegistryError> {
        self.validate_fields(config)?;
        let stored = self.cameras.upsert(&Self::prepared(config)).await?;
        info!(camera_id = %stored.id, "camera config saved");
        Ok(stored)
    }

    pub async fn list(&self) -> Result<Vec<CameraConfig>, RegistryError> {
        Ok(self.cameras.list().await?)
    }

    pub async fn get(&self, id: &str) -> Result<Option<CameraConfig>, RegistryError> {
        Ok(self.cameras.get(id).await?)
    }

    /// Validate, persist as enabled and (re)start the camera
    pub async fn start(&self, config: &CameraConfig) -> Result<CameraConfig, RegistryError> {
        let _guard = self.lifecycle.lock().await;
        let gallery = self.gallery_snapshot().await?;
        let matcher = self.validate(config, gallery)?;

        let mut config = Self::prepared(config);
        config.enabled = true;
        let stored = self.cameras.upsert(&config).await?;
        self.replace_worker(stored.clone(), matcher).await;
        Ok(stored)
    }

    /// Stop the worker and mark the camera disabled, keeping its settings
    pub async fn stop(&self, id: &str) -> Result<(), RegistryError> {
        let _guard = self.lifecycle.lock().await;
        let was_running = self.stop_worker(id).await;
        let known = self.cameras.set_enabled(id, false).await?;
        if !known && !was_running {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        info!(camera_id = %id, "camera disabled");
        Ok(())
    }

    /// Stop the worker if any and delete the config
    pub async fn remove(&self, id: &str) -> Result<(), RegistryError> {
        let _guard = self.lifecycle.lock().await;
        let was_running = self.stop_worker(id).await;
        let removed = self.cameras.remove(id).await?;
        if !removed && !was_running {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        info!(camera_id = %id, "camera removed");
        Ok(())
    }

    /// Start every enabled camera at process start
    pub async fn boot(&self) -> Result<ReloadReport, RegistryError> {
        let _guard = self.lifecycle.lock().await;
        let (gallery, enabled) = self.load_enabled().await?;
        let report = self.start_enabled(gallery, enabled).await;
        info!(started = report.started.len(), failed = report.failed.len(), "cameras booted");
        Ok(report)
    }

    /// Stop everything, then start every enabled camera against a fresh gallery.
    ///
    /// Running workers are left alone if the gallery or the camera list cannot be read.
    pub async fn reload(&self) -> Result<ReloadReport, RegistryError> {
        let _guard = self.lifecycle.lock().await;
        let (gallery, enabled) = self.load_enabled().await?;
        self.stop_all().await;
        let report = self.start_enabled(gallery, enabled).await;
        info!(started = report.started.len(), failed = report.failed.len(), "cameras reloaded");
        Ok(report)
    }

    /// Delete configs that have no running worker; returns the deleted ids
    pub async fn cleanup(&self) -> Result<Vec<String>, RegistryError> {
        let _guard = self.lifecycle.lock().await;
        let running = self.workers.read().await.keys().cloned().collect::<Vec<_>>();
        let mut removed = Vec::new();
        for config in self.cameras.list().await? {
            if running.contains(&config.id) {
                continue;
            }
            if self.cameras.remove(&config.id).await? {
                removed.push(config.id);
            }
        }
        if !removed.is_empty() {
            info!(removed = ?removed, "orphaned camera configs deleted");
        }
        Ok(removed)
    }

    /// Stop every worker without touching persisted configs
    pub async fn shutdown(&self) {
        let _guard = self.lifecycle.lock().await;
        self.stop_all().await;
    }

    pub async fn running_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn worker(&self, id: &str) -> Option<Arc<CameraWorker>> {
        self.workers.read().await.get(id).cloned()
    }

    pub async fn statuses(&self) -> Vec<WorkerStatus> {
        let mut statuses: Vec<WorkerStatus> = self.workers.read().await.values().map(|w| w.status()).collect();
        statuses.sort_by(|a, b| a.camera_id.cmp(&b.camera_id));
        statuses
    }

    async fn load_enabled(&self) -> Result<(Arc<Vec<GalleryEntry>>, Vec<CameraConfig>), RegistryError> {
        let gallery = self.gallery_snapshot().await?;
        let enabled = self.cameras.list().await?.into_iter().filter(|c| c.enabled).collect();
        Ok((gallery, enabled))
    }

    async fn start_enabled(&self, gallery: Arc<Vec<GalleryEntry>>, enabled: Vec<CameraConfig>) -> ReloadReport {
        let mut report = ReloadReport::default();

        for config in enabled {
            match self.validate(&config, gallery.clone()) {
                Ok(matcher) => {
                    report.started.push(config.id.clone());
                    self.replace_worker(config, matcher).await;
                }
                Err(e) => {
                    warn!(camera_id = %config.id, error = %e, "camera not started");
                    report.failed.push(ReloadFailure {
                        camera_id: config.id,
                        error: e.to_string(),
                    });
                }
            }
        }
        report
    }

    async fn replace_worker(&self, config: CameraConfig, matcher: Matcher) {
        let id = config.id.clone();
        if self.stop_worker(&id).await {
            info!(camera_id = %id, "replacing running worker");
        }
        let worker = Arc::new(CameraWorker::start(config, matcher, self.deps.clone()));
        self.workers.write().await.insert(id, worker);
    }

    async fn stop_worker(&self, id: &str) -> bool {
        let worker = self.workers.write().await.remove(id);
        match worker {
            Some(worker) => {
                worker.stop().await;
                true
            }
            None => false,
        }
    }

    async fn stop_all(&self) {
        let workers: Vec<Arc<CameraWorker>> = self.workers.write().await.drain().map(|(_, w)| w).collect();
        for worker in workers {
            worker.stop().await;
        }
    }
}
