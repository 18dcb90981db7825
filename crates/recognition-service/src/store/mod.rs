//! Persistence behind async traits, with in-memory implementations for
//! standalone mode and tests and Postgres/file implementations for production.

pub mod cameras;
pub mod events;
pub mod gallery;
pub mod jobs;

use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::path::Path;
use std::sync::Arc;

pub use cameras::{CameraStore, MemoryCameraStore, PgCameraStore};
pub use events::{EventStore, MemoryEventStore, PgEventStore};
pub use gallery::{GalleryStore, MemoryGalleryStore, PgGalleryStore};
pub use jobs::{FileJobStore, JobStore, JobStoreError, MemoryJobStore};

/// The full set of stores the service runs against
#[derive(Clone)]
pub struct Stores {
    pub events: Arc<dyn EventStore>,
    pub cameras: Arc<dyn CameraStore>,
    pub gallery: Arc<dyn GalleryStore>,
    pub jobs: Arc<dyn JobStore>,
}

impl Stores {
    /// Everything in memory; nothing survives a restart
    pub fn in_memory() -> Self {
        Self {
            events: Arc::new(MemoryEventStore::new()),
            cameras: Arc::new(MemoryCameraStore::new()),
            gallery: Arc::new(MemoryGalleryStore::new()),
            jobs: Arc::new(MemoryJobStore::new()),
        }
    }

    /// Postgres for events, cameras and gallery; job records as JSON files under `jobs_dir`
    pub async fn postgres(database_url: &str, jobs_dir: &Path) -> Result<Self> {
        let pool = connect(database_url).await?;
        Ok(Self {
            events: Arc::new(PgEventStore::new(pool.clone())),
            cameras: Arc::new(PgCameraStore::new(pool.clone())),
            gallery: Arc::new(PgGalleryStore::new(pool)),
            jobs: Arc::new(FileJobStore::open(jobs_dir).await?),
        })
    }
}

pub async fn connect(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .context("Failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    tracing::info!("database connected and migrated");
    Ok(pool)
}
