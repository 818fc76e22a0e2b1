//! Background AI job records
//!
//! Jobs live in the shared store under `ai_job:{job_id}` so any instance can
//! observe or cancel them. Updates are read-modify-write with last-writer-
//! wins semantics; every write re-arms the TTL, so a record survives one
//! hour past its final transition.

use crate::config_store::{AiConfig, BotConfig, PlatformConfig};
use crate::history::ParsedMessage;
use crate::store::{job_key, SharedStore};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const JOB_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Everything the worker needs, captured at accept time so config changes
/// cannot affect a job already in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub conversation_id: String,
    pub lock_id: String,
    /// The full history that triggered this job; on completion the
    /// processed-history cache advances to it.
    pub full_history: String,
    pub messages: Vec<ParsedMessage>,
    pub bot: BotConfig,
    pub ai: AiConfig,
    pub platform: PlatformConfig,
    pub resources: serde_json::Value,
}

/// Job state held in the shared store under `ai_job:{job_id}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub conversation_id: String,
    pub lock_id: String,
    pub status: JobStatus,
    pub payload: JobPayload,
    pub created_at: f64,
    pub updated_at: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<u64>,
}

#[derive(Clone)]
pub struct JobRegistry {
    store: SharedStore,
}

impl JobRegistry {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub async fn create_job(&self, payload: JobPayload) -> JobRecord {
        let now = crate::history::now_unix();
        let record = JobRecord {
            job_id: uuid::Uuid::new_v4().to_string(),
            conversation_id: payload.conversation_id.clone(),
            lock_id: payload.lock_id.clone(),
            status: JobStatus::Pending,
            payload,
            created_at: now,
            updated_at: now,
            result: None,
            error: None,
            processing_time_ms: None,
        };
        self.write(&record).await;
        tracing::info!(
            job_id = %record.job_id,
            conversation_id = %record.conversation_id,
            message_count = record.payload.messages.len(),
            "AI processing job created"
        );
        record
    }

    pub async fn get(&self, job_id: &str) -> Option<JobRecord> {
        let raw = self.store.get(&job_key(job_id)).await?;
        match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Invalid job record in store");
                None
            }
        }
    }

    /// Read-modify-write update. Returns the stored record, or `None` when
    /// the job has expired or never existed.
    pub async fn update<F>(&self, job_id: &str, mutate: F) -> Option<JobRecord>
    where
        F: FnOnce(&mut JobRecord),
    {
        let mut record = self.get(job_id).await?;
        mutate(&mut record);
        record.updated_at = crate::history::now_unix();
        self.write(&record).await;
        Some(record)
    }

    pub async fn mark_processing(&self, job_id: &str) -> Option<JobRecord> {
        self.update(job_id, |job| job.status = JobStatus::Processing)
            .await
    }

    pub async fn mark_completed(
        &self,
        job_id: &str,
        result: serde_json::Value,
        processing_time_ms: u64,
    ) -> Option<JobRecord> {
        self.update(job_id, |job| {
            job.status = JobStatus::Completed;
            job.result = Some(result);
            job.processing_time_ms = Some(processing_time_ms);
        })
        .await
    }

    pub async fn mark_failed(
        &self,
        job_id: &str,
        error: impl Into<String>,
        processing_time_ms: Option<u64>,
    ) -> Option<JobRecord> {
        let error = error.into();
        self.update(job_id, |job| {
            job.status = JobStatus::Failed;
            job.error = Some(error);
            job.processing_time_ms = processing_time_ms;
        })
        .await
    }

    /// Advisory cancellation: the worker aborts before the AI call if it
    /// observes this, and the dispatcher guard suppresses the side effect
    /// afterwards. Returns false when the job no longer exists.
    pub async fn cancel_job(&self, job_id: &str) -> bool {
        let updated = self
            .update(job_id, |job| {
                if !job.status.is_terminal() {
                    job.status = JobStatus::Cancelled;
                }
            })
            .await;
        match updated {
            Some(job) => {
                tracing::info!(job_id = %job.job_id, status = ?job.status, "Job cancellation requested");
                true
            }
            None => false,
        }
    }

    async fn write(&self, record: &JobRecord) {
        let serialized = serde_json::to_string(record).unwrap();
        self.store
            .set_ex(&job_key(&record.job_id), &serialized, JOB_TTL)
            .await;
    }
}

#[cfg(test)]
pub(crate) fn test_payload(conversation_id: &str) -> JobPayload {
    JobPayload {
        conversation_id: conversation_id.to_string(),
        lock_id: "lock-1".to_string(),
        full_history: "<USER>hi</USER><br>".to_string(),
        messages: vec![ParsedMessage {
            role: crate::db::MessageRole::User,
            content: "hi".to_string(),
            timestamp: 0.0,
        }],
        bot: BotConfig::default_config(),
        ai: AiConfig::default_config(),
        platform: PlatformConfig::default_config(),
        resources: serde_json::json!({}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> JobRegistry {
        JobRegistry::new(SharedStore::in_memory())
    }

    #[tokio::test]
    async fn test_job_lifecycle() {
        let jobs = registry();
        let job = jobs.create_job(test_payload("c1")).await;
        assert_eq!(job.status, JobStatus::Pending);

        let processing = jobs.mark_processing(&job.job_id).await.unwrap();
        assert_eq!(processing.status, JobStatus::Processing);

        let done = jobs
            .mark_completed(&job.job_id, serde_json::json!({"action": "CHAT"}), 42)
            .await
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.processing_time_ms, Some(42));

        let fetched = jobs.get(&job.job_id).await.unwrap();
        assert_eq!(fetched.status, JobStatus::Completed);
        assert!(fetched.result.is_some());
    }

    #[tokio::test]
    async fn test_cancel_pending_job() {
        let jobs = registry();
        let job = jobs.create_job(test_payload("c2")).await;

        assert!(jobs.cancel_job(&job.job_id).await);
        let fetched = jobs.get(&job.job_id).await.unwrap();
        assert_eq!(fetched.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_does_not_resurrect_terminal_job() {
        let jobs = registry();
        let job = jobs.create_job(test_payload("c3")).await;
        jobs.mark_completed(&job.job_id, serde_json::json!({}), 1)
            .await
            .unwrap();

        assert!(jobs.cancel_job(&job.job_id).await);
        let fetched = jobs.get(&job.job_id).await.unwrap();
        assert_eq!(fetched.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancel_missing_job() {
        let jobs = registry();
        assert!(!jobs.cancel_job("nope").await);
    }

    #[tokio::test]
    async fn test_mark_failed_records_reason() {
        let jobs = registry();
        let job = jobs.create_job(test_payload("c4")).await;
        let failed = jobs
            .mark_failed(&job.job_id, "superseded", None)
            .await
            .unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("superseded"));
    }
}
