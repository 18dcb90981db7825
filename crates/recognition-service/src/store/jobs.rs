//! Job status records.
//!
//! Updates are merged into the stored record under a single writer lock and
//! always advance `updated_at`. Status only moves forward
//! (queued → running → done | error) and a finished job is immutable.

use async_trait::async_trait;
use common::jobs::{JobRecord, JobStatus, JobUpdate};
use common::validation::{now_millis, validate_id};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("job '{0}' not found")]
    NotFound(String),

    #[error("job '{id}' cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("job '{0}' has already finished")]
    Finished(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// New record with status `queued` and progress 0
    async fn create(&self, job_type: &str, payload: serde_json::Value) -> Result<JobRecord, JobStoreError>;

    /// Merge `update` into the record atomically and return the result
    async fn update(&self, id: &str, update: JobUpdate) -> Result<JobRecord, JobStoreError>;

    async fn get(&self, id: &str) -> Result<Option<JobRecord>, JobStoreError>;

    /// All jobs, newest first
    async fn list(&self) -> Result<Vec<JobRecord>, JobStoreError>;
}

fn new_record(job_type: &str, payload: serde_json::Value) -> JobRecord {
    let now = now_millis();
    JobRecord {
        id: JobRecord::new_id(),
        job_type: job_type.to_string(),
        status: JobStatus::Queued,
        progress: 0.0,
        payload,
        result: None,
        error: None,
        created_at: now,
        updated_at: now,
    }
}

/// Apply `update` to `record` at time `now`
pub fn apply_update(record: &mut JobRecord, update: JobUpdate, now: i64) -> Result<(), JobStoreError> {
    if record.status.is_terminal() {
        return Err(JobStoreError::Finished(record.id.clone()));
    }

    let previous = record.status;
    if let Some(next) = update.status {
        if !previous.can_transition_to(next) {
            return Err(JobStoreError::InvalidTransition {
                id: record.id.clone(),
                from: previous,
                to: next,
            });
        }
        record.status = next;
    }

    if let Some(progress) = update.progress.filter(|p| p.is_finite()) {
        let progress = progress.clamp(0.0, 1.0);
        let entering_running = previous == JobStatus::Queued && record.status == JobStatus::Running;
        if entering_running || progress >= record.progress {
            record.progress = progress;
        }
    }
    if record.status == JobStatus::Done {
        record.progress = 1.0;
    }

    if update.result.is_some() {
        record.result = update.result;
    }
    if update.error.is_some() {
        record.error = update.error;
    }

    record.updated_at = now.max(record.updated_at + 1);
    Ok(())
}

fn newest_first(mut jobs: Vec<JobRecord>) -> Vec<JobRecord> {
    jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
    jobs
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<String, JobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job_type: &str, payload: serde_json::Value) -> Result<JobRecord, JobStoreError> {
        let record = new_record(job_type, payload);
        self.jobs
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn update(&self, id: &str, update: JobUpdate) -> Result<JobRecord, JobStoreError> {
        let mut jobs = self.jobs.write().await;
        let record = jobs
            .get_mut(id)
            .ok_or_else(|| JobStoreError::NotFound(id.to_string()))?;
        apply_update(record, update, now_millis())?;
        Ok(record.clone())
    }

    async fn get(&self, id: &str) -> Result<Option<JobRecord>, JobStoreError> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<JobRecord>, JobStoreError> {
        Ok(newest_first(self.jobs.read().await.values().cloned().collect()))
    }
}

// ============================================================================
// JSON files
// ============================================================================

/// One `<id>.json` per job; writes go to a temp file and are renamed into place,
/// so readers never see a partial record.
pub struct FileJobStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileJobStore {
    pub async fn open(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        use anyhow::Context;
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create jobs dir {}", dir.display()))?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, JobStoreError> {
        validate_id(id, "job_id")?;
        Ok(self.dir.join(format!("{}.json", id)))
    }

    async fn read(&self, id: &str) -> Result<Option<JobRecord>, JobStoreError> {
        let path = self.path_for(id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let record = serde_json::from_slice(&bytes).map_err(anyhow::Error::from)?;
                Ok(Some(record))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(anyhow::Error::from(e).into()),
        }
    }

    async fn write(&self, record: &JobRecord) -> Result<(), JobStoreError> {
        let path = self.path_for(&record.id)?;
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(record).map_err(anyhow::Error::from)?;
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(anyhow::Error::from)?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(anyhow::Error::from)?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn create(&self, job_type: &str, payload: serde_json::Value) -> Result<JobRecord, JobStoreError> {
        let record = new_record(job_type, payload);
        let _guard = self.write_lock.lock().await;
        self.write(&record).await?;
        Ok(record)
    }

    async fn update(&self, id: &str, update: JobUpdate) -> Result<JobRecord, JobStoreError> {
        let _guard = self.write_lock.lock().await;
        let mut record = self
            .read(id)
            .await?
            .ok_or_else(|| JobStoreError::NotFound(id.to_string()))?;
        apply_update(&mut record, update, now_millis())?;
        self.write(&record).await?;
        Ok(record)
    }

    async fn get(&self, id: &str) -> Result<Option<JobRecord>, JobStoreError> {
        self.read(id).await
    }

    async fn list(&self) -> Result<Vec<JobRecord>, JobStoreError> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(anyhow::Error::from)?;
        let mut jobs = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(anyhow::Error::from)? {
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            match self.read(id).await {
                Ok(Some(record)) => jobs.push(record),
                Ok(None) => {}
                Err(e) => tracing::warn!(job_id = %id, error = %e, "skipping unreadable job file"),
            }
        }
        Ok(newest_first(jobs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    async fn lifecycle(store: &dyn JobStore) {
        let job = store.create("x", json!({"video": "a.mp4"})).await.unwrap();
        let read = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(read.status, JobStatus::Queued);
        assert_eq!(read.progress, 0.0);
        assert_eq!(read.payload, json!({"video": "a.mp4"}));

        store.update(&job.id, JobUpdate::running()).await.unwrap();
        let done = store
            .update(&job.id, JobUpdate::done(json!({"faces": 3})))
            .await
            .unwrap();

        let read = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(read, done);
        assert_eq!(read.status, JobStatus::Done);
        assert_eq!(read.progress, 1.0);
        assert_eq!(read.result, Some(json!({"faces": 3})));
        assert!(read.updated_at > job.updated_at);
    }

    #[tokio::test]
    async fn test_memory_lifecycle() {
        lifecycle(&MemoryJobStore::new()).await;
    }

    #[tokio::test]
    async fn test_file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJobStore::open(dir.path()).await.unwrap();
        lifecycle(&store).await;

        let files: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with(".json"));
    }

    #[tokio::test]
    async fn test_done_directly_from_queued_is_rejected() {
        let store = MemoryJobStore::new();
        let job = store.create("x", json!({})).await.unwrap();
        assert!(matches!(
            store.update(&job.id, JobUpdate::done(json!(null))).await,
            Err(JobStoreError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_status_never_regresses_and_finished_is_final() {
        let store = MemoryJobStore::new();
        let job = store.create("x", json!({})).await.unwrap();
        store.update(&job.id, JobUpdate::running()).await.unwrap();

        let back = JobUpdate {
            status: Some(JobStatus::Queued),
            ..Default::default()
        };
        assert!(matches!(
            store.update(&job.id, back).await,
            Err(JobStoreError::InvalidTransition { .. })
        ));

        store.update(&job.id, JobUpdate::failed("boom")).await.unwrap();
        assert!(matches!(
            store.update(&job.id, JobUpdate::progress(0.5)).await,
            Err(JobStoreError::Finished(_))
        ));
        let read = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(read.status, JobStatus::Error);
        assert_eq!(read.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_progress_monotonic_while_running() {
        let store = MemoryJobStore::new();
        let job = store.create("x", json!({})).await.unwrap();
        store.update(&job.id, JobUpdate::running()).await.unwrap();

        store.update(&job.id, JobUpdate::progress(0.4)).await.unwrap();
        let after_drop = store.update(&job.id, JobUpdate::progress(0.2)).await.unwrap();
        assert_eq!(after_drop.progress, 0.4);

        let clamped = store.update(&job.id, JobUpdate::progress(7.0)).await.unwrap();
        assert_eq!(clamped.progress, 1.0);
        assert_eq!(clamped.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_concurrent_updates_keep_record_consistent() {
        let store = Arc::new(MemoryJobStore::new());
        let job = store.create("x", json!({})).await.unwrap();
        store.update(&job.id, JobUpdate::running()).await.unwrap();

        let mut handles = Vec::new();
        for i in 1..=50 {
            let store = store.clone();
            let id = job.id.clone();
            handles.push(tokio::spawn(async move {
                store.update(&id, JobUpdate::progress(i as f32 / 100.0)).await.unwrap();
                store.get(&id).await.unwrap().unwrap()
            }));
        }
        for handle in handles {
            let record = handle.await.unwrap();
            assert_eq!(record.status, JobStatus::Running);
        }

        let last = store.get(&job.id).await.unwrap().unwrap();
        assert!((last.progress - 0.5).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_unknown_and_invalid_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJobStore::open(dir.path()).await.unwrap();
        assert!(store.get("job-missing").await.unwrap().is_none());
        assert!(matches!(
            store.update("job-missing", JobUpdate::running()).await,
            Err(JobStoreError::NotFound(_))
        ));
        assert!(store.get("../etc/passwd").await.is_err());
    }

    #[test]
    fn test_updated_at_always_advances() {
        let mut record = new_record("x", json!({}));
        record.updated_at = 10_000;
        apply_update(&mut record, JobUpdate::running(), 5_000).unwrap();
        assert_eq!(record.updated_at, 10_001);
    }
}
