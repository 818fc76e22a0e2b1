//! Background execution of AI jobs
//!
//! One task per job: call the AI, verify the lock still names this job,
//! dispatch the action, then release the lock and advance the processed
//! history. A job superseded at any checkpoint terminates without side
//! effects and without touching the lock, which by then belongs to the
//! newer arrival.

use crate::ai_client::AiClient;
use crate::db::Database;
use crate::dispatch::{DispatchStatus, PlatformDispatcher};
use crate::jobs::{JobRegistry, JobStatus};
use crate::lock::LockManager;
use crate::store::SharedStore;
use serde_json::json;
use std::sync::Arc;

const SUPERSEDED: &str = "superseded";

pub struct JobWorker {
    store: SharedStore,
    db: Database,
    jobs: JobRegistry,
    locks: LockManager,
    ai: AiClient,
    dispatcher: Arc<PlatformDispatcher>,
}

impl JobWorker {
    pub fn new(
        store: SharedStore,
        db: Database,
        ai: AiClient,
        dispatcher: Arc<PlatformDispatcher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            jobs: JobRegistry::new(store.clone()),
            locks: LockManager::new(store.clone()),
            ai,
            dispatcher,
            store,
            db,
        })
    }

    /// Launch a job on its own task.
    pub fn spawn(self: &Arc<Self>, job_id: String) {
        let worker = Arc::clone(self);
        tokio::spawn(async move {
            worker.run_job(&job_id).await;
        });
    }

    async fn run_job(&self, job_id: &str) {
        let Some(job) = self.jobs.get(job_id).await else {
            tracing::warn!(job_id, "Job disappeared before the worker picked it up");
            return;
        };
        let conversation_id = job.conversation_id.clone();
        let lock_id = job.lock_id.clone();

        // Cancelled before we started: the superseding arrival owns the lock
        if job.status == JobStatus::Cancelled {
            tracing::info!(
                conversation_id = %conversation_id,
                lock_id = %lock_id,
                job_id,
                "Job cancelled before start, aborting"
            );
            return;
        }

        self.jobs.mark_processing(job_id).await;

        let payload = &job.payload;
        let outcome = self
            .ai
            .process(
                &conversation_id,
                &payload.messages,
                &payload.resources,
                &payload.lock_id,
                &payload.ai,
            )
            .await;

        // Re-check ownership after the call: a new arrival may have
        // superseded this job while the AI was thinking
        if self.is_superseded(job_id, &conversation_id).await {
            tracing::info!(
                conversation_id = %conversation_id,
                lock_id = %lock_id,
                job_id,
                "Job superseded during AI call, discarding result"
            );
            self.jobs
                .mark_failed(job_id, SUPERSEDED, Some(outcome.processing_time_ms))
                .await;
            return;
        }

        if !outcome.success {
            let error = outcome
                .error
                .unwrap_or_else(|| "AI processing failed".to_string());
            tracing::error!(conversation_id = %conversation_id, lock_id = %lock_id, job_id, error = %error, "AI job failed");
            self.jobs
                .mark_failed(job_id, error, Some(outcome.processing_time_ms))
                .await;
            self.locks.release(&conversation_id).await;
            return;
        }

        let dispatch = self
            .dispatcher
            .execute(
                job_id,
                &conversation_id,
                &outcome.action,
                &outcome.data,
                &payload.platform,
            )
            .await;

        if dispatch.status == DispatchStatus::Superseded {
            self.jobs
                .mark_failed(job_id, SUPERSEDED, Some(outcome.processing_time_ms))
                .await;
            return;
        }

        // Platform failures (including rate limiting) do not fail the job:
        // the AI call itself completed, and the error is recorded alongside
        let mut result = json!({
            "action": outcome.action,
            "data": outcome.data,
            "dispatch_status": dispatch.status.as_str(),
        });
        if let Some(error) = &dispatch.error {
            result["dispatch_error"] = json!(error);
        }
        self.jobs
            .mark_completed(job_id, result, outcome.processing_time_ms)
            .await;

        tracing::info!(
            conversation_id = %conversation_id,
            lock_id = %lock_id,
            job_id,
            dispatch_status = dispatch.status.as_str(),
            processing_time_ms = outcome.processing_time_ms,
            "AI job completed"
        );

        self.locks.release(&conversation_id).await;
        self.advance_history(&conversation_id, &payload.full_history)
            .await;
    }

    async fn is_superseded(&self, job_id: &str, conversation_id: &str) -> bool {
        if let Some(job) = self.jobs.get(job_id).await {
            if job.status == JobStatus::Cancelled {
                return true;
            }
        }
        let current = self
            .locks
            .get_info(conversation_id)
            .await
            .and_then(|lock| lock.ai_job_id);
        current.as_deref() != Some(job_id)
    }

    async fn advance_history(&self, conversation_id: &str, full_history: &str) {
        self.store
            .advance_processed_history(conversation_id, full_history)
            .await;
        if let Err(e) = self
            .db
            .advance_conversation_history(conversation_id, full_history)
        {
            tracing::warn!(
                conversation_id,
                error = %e,
                "Failed to persist processed history"
            );
        }
    }
}
