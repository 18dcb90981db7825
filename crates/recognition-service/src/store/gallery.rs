use anyhow::{Context, Result};
use async_trait::async_trait;
use common::gallery::GalleryEntry;
use common::validation::now_millis;
use sqlx::{PgPool, Row};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use crate::recognizer::normalized;

#[async_trait]
pub trait GalleryStore: Send + Sync {
    /// Every known identity with its embeddings, ordered by person id
    async fn snapshot(&self) -> Result<Vec<GalleryEntry>>;

    /// Replace an identity and its embeddings; embeddings are normalised on write
    async fn upsert(&self, entry: &GalleryEntry) -> Result<()>;

    /// Delete an identity and its embeddings; false if it was unknown
    async fn remove(&self, person_id: &str) -> Result<bool>;
}

fn normalize_entry(entry: &GalleryEntry) -> GalleryEntry {
    let mut entry = entry.clone();
    entry.embeddings = entry.embeddings.into_iter().map(normalized).collect();
    entry
}

#[derive(Default)]
pub struct MemoryGalleryStore {
    entries: RwLock<BTreeMap<String, GalleryEntry>>,
}

impl MemoryGalleryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GalleryStore for MemoryGalleryStore {
    async fn snapshot(&self) -> Result<Vec<GalleryEntry>> {
        Ok(self.entries.read().await.values().cloned().collect())
    }

    async fn upsert(&self, entry: &GalleryEntry) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(entry.person_id.clone(), normalize_entry(entry));
        Ok(())
    }

    async fn remove(&self, person_id: &str) -> Result<bool> {
        Ok(self.entries.write().await.remove(person_id).is_some())
    }
}

pub struct PgGalleryStore {
    pool: PgPool,
}

impl PgGalleryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GalleryStore for PgGalleryStore {
    async fn snapshot(&self) -> Result<Vec<GalleryEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT p.id, p.name, p.group_id, i.image_path, i.embedding
            FROM persons p
            LEFT JOIN person_images i ON i.person_id = p.id
            ORDER BY p.id, i.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut entries: Vec<GalleryEntry> = Vec::new();
        for row in rows {
            let person_id: String = row.try_get("id")?;
            if entries.last().map(|e| e.person_id.as_str()) != Some(person_id.as_str()) {
                let mut entry = GalleryEntry::new(person_id.clone(), row.try_get::<String, _>("name")?);
                entry.group_id = row.try_get("group_id")?;
                entries.push(entry);
            }
            let Some(entry) = entries.last_mut() else {
                continue;
            };

            if let Some(path) = row.try_get::<Option<String>, _>("image_path")? {
                entry.reference_images.push(path);
            }
            if let Some(raw) = row.try_get::<Option<serde_json::Value>, _>("embedding")? {
                match serde_json::from_value::<Vec<f32>>(raw) {
                    Ok(embedding) if !embedding.is_empty() => entry.embeddings.push(normalized(embedding)),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(person_id = %person_id, error = %e, "skipping malformed embedding"),
                }
            }
        }
        Ok(entries)
    }

    async fn upsert(&self, entry: &GalleryEntry) -> Result<()> {
        let entry = normalize_entry(entry);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO persons (id, name, group_id, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, group_id = EXCLUDED.group_id
            "#,
        )
        .bind(&entry.person_id)
        .bind(&entry.name)
        .bind(&entry.group_id)
        .bind(now_millis())
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to upsert person {}", entry.person_id))?;

        sqlx::query("DELETE FROM person_images WHERE person_id = $1")
            .bind(&entry.person_id)
            .execute(&mut *tx)
            .await?;

        for (index, embedding) in entry.embeddings.iter().enumerate() {
            sqlx::query("INSERT INTO person_images (person_id, image_path, embedding) VALUES ($1, $2, $3)")
                .bind(&entry.person_id)
                .bind(entry.reference_images.get(index).cloned())
                .bind(serde_json::to_value(embedding)?)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn remove(&self, person_id: &str) -> Result<bool> {
        // person_images rows go with the person via ON DELETE CASCADE
        let result = sqlx::query("DELETE FROM persons WHERE id = $1")
            .bind(person_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete person {}", person_id))?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_gallery_normalizes_and_orders() {
        let store = MemoryGalleryStore::new();
        store
            .upsert(&GalleryEntry::new("p2", "Bob").with_embedding(vec![0.0, 3.0]))
            .await
            .unwrap();
        store
            .upsert(&GalleryEntry::new("p1", "Alice").with_embedding(vec![4.0, 0.0]))
            .await
            .unwrap();

        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot[0].person_id, "p1");
        assert_eq!(snapshot[0].embeddings[0], vec![1.0, 0.0]);
        assert_eq!(snapshot[1].embeddings[0], vec![0.0, 1.0]);
    }

    #[tokio::test]
    async fn test_memory_gallery_remove() {
        let store = MemoryGalleryStore::new();
        store
            .upsert(&GalleryEntry::new("p1", "Alice").with_embedding(vec![1.0, 0.0]))
            .await
            .unwrap();

        assert!(store.remove("p1").await.unwrap());
        assert!(!store.remove("p1").await.unwrap());
        assert!(store.snapshot().await.unwrap().is_empty());
    }
}
