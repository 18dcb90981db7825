use anyhow::{Context, Result};
use async_trait::async_trait;
use common::cameras::CameraConfig;
use common::validation::now_millis;
use sqlx::{postgres::PgRow, PgPool, Row};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

#[async_trait]
pub trait CameraStore: Send + Sync {
    /// Insert or replace by id; `created_at` of an existing row is kept
    async fn upsert(&self, config: &CameraConfig) -> Result<CameraConfig>;
    async fn get(&self, id: &str) -> Result<Option<CameraConfig>>;
    async fn list(&self) -> Result<Vec<CameraConfig>>;
    async fn remove(&self, id: &str) -> Result<bool>;
    /// Flip only the enabled flag; returns false for an unknown id
    async fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool>;
}

#[derive(Default)]
pub struct MemoryCameraStore {
    cameras: RwLock<BTreeMap<String, CameraConfig>>,
}

impl MemoryCameraStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CameraStore for MemoryCameraStore {
    async fn upsert(&self, config: &CameraConfig) -> Result<CameraConfig> {
        let mut cameras = self.cameras.write().await;
        let mut stored = config.clone();
        stored.created_at = match cameras.get(&config.id) {
            Some(existing) => existing.created_at,
            None if config.created_at > 0 => config.created_at,
            None => now_millis(),
        };
        cameras.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn get(&self, id: &str) -> Result<Option<CameraConfig>> {
        Ok(self.cameras.read().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<CameraConfig>> {
        let cameras = self.cameras.read().await;
        let mut list: Vec<CameraConfig> = cameras.values().cloned().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(list)
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        Ok(self.cameras.write().await.remove(id).is_some())
    }

    async fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool> {
        let mut cameras = self.cameras.write().await;
        match cameras.get_mut(id) {
            Some(config) => {
                config.enabled = enabled;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

pub struct PgCameraStore {
    pool: PgPool,
}

impl PgCameraStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_camera(row: &PgRow) -> Result<CameraConfig> {
    let transport: String = row.try_get("transport")?;
    let mode: String = row.try_get("mode")?;
    let target: Option<serde_json::Value> = row.try_get("target_embedding")?;
    Ok(CameraConfig {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        transport: transport.parse()?,
        fps: row.try_get("fps")?,
        threshold: row.try_get("threshold")?,
        mode: mode.parse()?,
        enabled: row.try_get("enabled")?,
        target_embedding: target
            .map(serde_json::from_value)
            .transpose()
            .context("invalid target embedding")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl CameraStore for PgCameraStore {
    async fn upsert(&self, config: &CameraConfig) -> Result<CameraConfig> {
        let target = config
            .target_embedding
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        let created_at = if config.created_at > 0 {
            config.created_at
        } else {
            now_millis()
        };

        let row = sqlx::query(
            r#"
            INSERT INTO cameras (id, name, url, transport, fps, threshold, mode, enabled, target_embedding, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
              name = EXCLUDED.name,
              url = EXCLUDED.url,
              transport = EXCLUDED.transport,
              fps = EXCLUDED.fps,
              threshold = EXCLUDED.threshold,
              mode = EXCLUDED.mode,
              enabled = EXCLUDED.enabled,
              target_embedding = EXCLUDED.target_embedding
            RETURNING *
            "#,
        )
        .bind(&config.id)
        .bind(&config.name)
        .bind(&config.url)
        .bind(config.transport.as_str())
        .bind(config.fps)
        .bind(config.threshold)
        .bind(config.mode.as_str())
        .bind(config.enabled)
        .bind(target)
        .bind(created_at)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to upsert camera {}", config.id))?;

        row_to_camera(&row)
    }

    async fn get(&self, id: &str) -> Result<Option<CameraConfig>> {
        let row = sqlx::query("SELECT * FROM cameras WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_camera).transpose()
    }

    async fn list(&self) -> Result<Vec<CameraConfig>> {
        let rows = sqlx::query("SELECT * FROM cameras ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_camera).collect()
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM cameras WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE cameras SET enabled = $2 WHERE id = $1")
            .bind(id)
            .bind(enabled)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
