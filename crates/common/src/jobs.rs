//! Asynchronous analysis job records.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }

    /// queued → running → {done, error}; a queued job may also fail before it starts
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Queued | Running | Error) | (Running, Running | Done | Error)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub status: JobStatus,
    pub progress: f32,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl JobRecord {
    pub fn new_id() -> String {
        format!("job-{}", uuid::Uuid::new_v4().simple())
    }
}

/// Partial update merged into an existing record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<f32>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl JobUpdate {
    pub fn running() -> Self {
        Self {
            status: Some(JobStatus::Running),
            progress: Some(0.0),
            ..Default::default()
        }
    }

    pub fn progress(progress: f32) -> Self {
        Self {
            progress: Some(progress),
            ..Default::default()
        }
    }

    pub fn done(result: serde_json::Value) -> Self {
        Self {
            status: Some(JobStatus::Done),
            progress: Some(1.0),
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Error),
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Body of a job submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSubmitRequest {
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use JobStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Queued.can_transition_to(Error));
        assert!(Running.can_transition_to(Running));
        assert!(Running.can_transition_to(Done));
        assert!(Running.can_transition_to(Error));

        assert!(!Queued.can_transition_to(Done));
        assert!(!Running.can_transition_to(Queued));
        assert!(!Done.can_transition_to(Running));
        assert!(!Done.can_transition_to(Error));
        assert!(!Error.can_transition_to(Error));
    }

    #[test]
    fn test_job_id_format() {
        let id = JobRecord::new_id();
        assert!(id.starts_with("job-"));
        assert_eq!(id.len(), 4 + 32);
    }

    #[test]
    fn test_record_serializes_type_field() {
        let json = serde_json::to_value(JobRecord {
            id: "job-1".into(),
            job_type: "compare".into(),
            status: JobStatus::Queued,
            progress: 0.0,
            payload: serde_json::json!({}),
            result: None,
            error: None,
            created_at: 1,
            updated_at: 1,
        })
        .unwrap();
        assert_eq!(json["type"], "compare");
        assert_eq!(json["status"], "queued");
    }
}
