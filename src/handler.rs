//! Top-level message handling pipeline
//!
//! One inbound conversation update flows through: processed-history lookup,
//! suffix diff, tag parsing, config resolution, the lock decision, job
//! creation, and the processed-history cache advance. The caller gets an
//! immediate acknowledgement; the AI call and dispatch happen on the job's
//! own task.

use crate::ai_client::AiClient;
use crate::config_store::{ConfigStore, DEFAULT_ID};
use crate::db::{Database, DbError};
use crate::dispatch::{FetchedHistory, PlatformDispatcher};
use crate::history;
use crate::jobs::{JobPayload, JobRecord, JobRegistry};
use crate::lock::{LockDecision, LockManager, LockRecord};
use crate::store::SharedStore;
use crate::worker::JobWorker;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Inbound update for one conversation
#[derive(Debug, Clone)]
pub struct HandleRequest {
    pub conversation_id: Option<String>,
    pub history: String,
    pub resources: Option<Value>,
    pub bot_id: Option<String>,
}

/// Acknowledgement returned to the caller
#[derive(Debug, Clone, Serialize)]
pub struct HandleResponse {
    pub success: bool,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_id: Option<String>,
    pub conversation_id: String,
    pub consolidated_messages: usize,
    pub consolidated_count: u32,
    pub bot_name: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_previous_job: Option<String>,
    pub reprocessing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct MessageHandler {
    db: Database,
    store: SharedStore,
    configs: Arc<ConfigStore>,
    locks: LockManager,
    jobs: JobRegistry,
    ai_client: AiClient,
    dispatcher: Arc<PlatformDispatcher>,
    worker: Arc<JobWorker>,
}

impl MessageHandler {
    pub fn new(db: Database, store: SharedStore, configs: Arc<ConfigStore>) -> Self {
        let locks = LockManager::new(store.clone());
        let ai_client = AiClient::new();
        let dispatcher = Arc::new(PlatformDispatcher::new(locks.clone()));
        let worker = JobWorker::new(
            store.clone(),
            db.clone(),
            ai_client.clone(),
            dispatcher.clone(),
        );
        Self {
            locks,
            jobs: JobRegistry::new(store.clone()),
            ai_client,
            dispatcher,
            worker,
            db,
            store,
            configs,
        }
    }

    /// Accept one conversation update. Never panics; failures come back as
    /// `success = false` after releasing the conversation's lock.
    pub async fn handle(&self, request: HandleRequest) -> HandleResponse {
        let conversation_id = request
            .conversation_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        tracing::info!(
            conversation_id = %conversation_id,
            history_length = request.history.len(),
            "Handling message request"
        );

        match self.process(&conversation_id, &request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(conversation_id = %conversation_id, error = %e, "Message handling failed");
                self.locks.release(&conversation_id).await;
                HandleResponse {
                    success: false,
                    status: "failed".to_string(),
                    ai_job_id: None,
                    lock_id: None,
                    conversation_id,
                    consolidated_messages: 0,
                    consolidated_count: 0,
                    bot_name: String::new(),
                    message: format!("Message processing failed: {e}"),
                    cancelled_previous_job: None,
                    reprocessing: false,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn process(
        &self,
        conversation_id: &str,
        request: &HandleRequest,
    ) -> Result<HandleResponse, DbError> {
        // Step 1: find what part of the transcript is actually new
        let processed = self.processed_history(conversation_id).await;
        let delta = history::diff(&request.history, &processed);
        if delta.len() != request.history.len() {
            tracing::info!(
                conversation_id,
                original_length = request.history.len(),
                effective_length = delta.len(),
                "Cut processed prefix from incoming history"
            );
        }
        let messages = history::parse(delta);

        // Step 2: resolve the routing configuration, defaults on any miss
        let bot = self
            .configs
            .bot_for_conversation(conversation_id, request.bot_id.as_deref());
        let ai = self.configs.core_ai(&bot.core_ai_id);
        let platform = self.configs.platform(&bot.platform_id);

        // Step 3: make sure the conversation row exists
        let bot_ref = (bot.bot_id != DEFAULT_ID).then_some(bot.bot_id.as_str());
        self.db
            .get_or_create_conversation(conversation_id, bot_ref)?;

        // Step 4: lock decision
        let decision = self.locks.check_and_acquire(conversation_id, delta).await;
        if let LockDecision::Acquired { fallback: true, .. } = &decision {
            tracing::warn!(
                conversation_id,
                "Lock acquired through the contested fallback path"
            );
        }
        let reprocessing = decision.is_superseded();
        let cancelled_previous_job = match &decision {
            LockDecision::Superseded {
                previous_job_id: Some(previous),
                ..
            } => {
                if self.jobs.cancel_job(previous).await {
                    tracing::info!(
                        conversation_id,
                        cancelled_job_id = %previous,
                        "Previous AI job cancelled"
                    );
                }
                Some(previous.clone())
            }
            _ => None,
        };

        // Step 5: create the job and hand it to the worker
        let payload = JobPayload {
            conversation_id: conversation_id.to_string(),
            lock_id: decision.lock_id().to_string(),
            full_history: request.history.clone(),
            messages,
            bot: bot.clone(),
            ai,
            platform,
            resources: request
                .resources
                .clone()
                .unwrap_or_else(|| serde_json::json!({})),
        };
        let consolidated_messages = payload.messages.len();
        let job = self.jobs.create_job(payload).await;
        self.locks.attach_job(conversation_id, &job.job_id).await;
        self.worker.spawn(job.job_id.clone());

        // Step 6: remember the full transcript as processed so the next
        // arrival diffs against it
        self.store
            .advance_processed_history(conversation_id, &request.history)
            .await;

        let (status, message) = if reprocessing {
            (
                "reprocessing",
                "Previous job cancelled, reprocessing with new history only",
            )
        } else {
            (
                "ai_processing_started",
                "Message received and AI processing started",
            )
        };

        Ok(HandleResponse {
            success: true,
            status: status.to_string(),
            ai_job_id: Some(job.job_id),
            lock_id: Some(decision.lock_id().to_string()),
            conversation_id: conversation_id.to_string(),
            consolidated_messages,
            consolidated_count: decision.consolidated_count(),
            bot_name: bot.name,
            message: message.to_string(),
            cancelled_previous_job,
            reprocessing,
            error: None,
        })
    }

    /// Last processed history: shared-store cache first, then the
    /// conversation row, then empty (everything is new).
    async fn processed_history(&self, conversation_id: &str) -> String {
        if let Some(cached) = self.store.get_processed_history(conversation_id).await {
            return cached;
        }
        match self.db.get_conversation(conversation_id) {
            Ok(conversation) => conversation.history,
            Err(_) => String::new(),
        }
    }

    // ==================== Monitoring Surface ====================

    pub async fn job_status(&self, job_id: &str) -> Option<JobRecord> {
        self.jobs.get(job_id).await
    }

    pub async fn cancel_job(&self, job_id: &str) -> bool {
        self.jobs.cancel_job(job_id).await
    }

    pub async fn lock_info(&self, conversation_id: &str) -> Option<LockRecord> {
        self.locks.get_info(conversation_id).await
    }

    pub async fn release_lock(&self, conversation_id: &str) -> bool {
        self.locks.release(conversation_id).await
    }

    pub async fn cleanup_stale_locks(&self, max_age: Duration) -> usize {
        self.locks.cleanup_stale(max_age).await
    }

    /// Ping the configured AI endpoint's `/health`.
    pub async fn core_ai_health(&self, core_ai_id: &str) -> bool {
        let config = self.configs.core_ai(core_ai_id);
        self.ai_client.health_check(&config).await
    }

    /// Ping the configured platform's `/health`.
    pub async fn platform_health(&self, platform_id: &str) -> bool {
        let config = self.configs.platform(platform_id);
        self.dispatcher.health(&config).await
    }

    /// Pull the conversation transcript from its platform.
    pub async fn platform_history(&self, conversation_id: &str) -> Result<FetchedHistory, String> {
        let bot = self.configs.bot_for_conversation(conversation_id, None);
        let platform = self.configs.platform(&bot.platform_id);
        self.dispatcher.fetch_history(conversation_id, &platform).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobStatus;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::Mutex;

    type Calls = Arc<Mutex<Vec<(String, Value)>>>;

    /// One server playing both the AI and the platform. The AI leg sleeps
    /// for `ai_delay` before answering CHAT.
    async fn stub_backends(ai_delay: Duration) -> (String, Calls) {
        let calls: Calls = Arc::new(Mutex::new(Vec::new()));

        let ai_calls = calls.clone();
        let chat_calls = calls.clone();
        let router = Router::new()
            .route(
                "/ai/:session",
                post(move |Json(body): Json<Value>| {
                    let calls = ai_calls.clone();
                    async move {
                        tokio::time::sleep(ai_delay).await;
                        calls.lock().unwrap().push(("/ai".to_string(), body));
                        Json(serde_json::json!({
                            "action": "CHAT",
                            "data": {"answer": ["hello there"]}
                        }))
                    }
                }),
            )
            .route(
                "/send-message",
                post(move |Json(body): Json<Value>| {
                    let calls = chat_calls.clone();
                    async move {
                        calls
                            .lock()
                            .unwrap()
                            .push(("/send-message".to_string(), body));
                        Json(serde_json::json!({"ok": true}))
                    }
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (format!("http://{addr}"), calls)
    }

    /// Handler wired to the stub server through a real bot/AI/platform row.
    fn handler_against(base: &str, db: &Database, store: &SharedStore) -> MessageHandler {
        let ai = db
            .create_core_ai(&crate::db::NewCoreAi {
                name: "stub-ai".to_string(),
                description: None,
                api_endpoint: format!("{base}/ai/{{session_id}}"),
                auth_required: false,
                auth_token: None,
                timeout_seconds: 5,
                meta_data: serde_json::json!({}),
            })
            .unwrap();
        let platform = db
            .create_platform(&crate::db::NewPlatform {
                name: "stub-platform".to_string(),
                description: None,
                base_url: base.to_string(),
                rate_limit_per_minute: 60,
                auth_required: false,
                auth_token: None,
                meta_data: serde_json::json!({}),
            })
            .unwrap();
        db.create_bot(&crate::db::NewBot {
            name: "stub-bot".to_string(),
            description: None,
            language: "vi".to_string(),
            core_ai_id: ai.id,
            platform_id: platform.id,
            meta_data: serde_json::json!({}),
        })
        .unwrap();

        let configs = Arc::new(ConfigStore::new(db.clone()));
        MessageHandler::new(db.clone(), store.clone(), configs)
    }

    async fn wait_terminal(handler: &MessageHandler, job_id: &str) -> JobRecord {
        for _ in 0..300 {
            if let Some(job) = handler.job_status(job_id).await {
                if job.status.is_terminal() {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} never reached a terminal status");
    }

    fn request(conversation_id: &str, history: &str) -> HandleRequest {
        HandleRequest {
            conversation_id: Some(conversation_id.to_string()),
            history: history.to_string(),
            resources: None,
            bot_id: None,
        }
    }

    #[tokio::test]
    async fn test_single_message_cold_cache() {
        let db = Database::open_in_memory().unwrap();
        let store = SharedStore::in_memory();
        let (base, calls) = stub_backends(Duration::ZERO).await;
        let handler = handler_against(&base, &db, &store);

        let response = handler
            .handle(request("c1", "<USER>hi</USER><br>"))
            .await;

        assert!(response.success);
        assert_eq!(response.status, "ai_processing_started");
        assert_eq!(response.consolidated_count, 1);
        assert_eq!(response.consolidated_messages, 1);
        assert!(response.cancelled_previous_job.is_none());
        assert!(!response.reprocessing);
        assert_eq!(response.bot_name, "stub-bot");

        // Lock carries the job id until completion
        let job_id = response.ai_job_id.clone().unwrap();
        let finished = wait_terminal(&handler, &job_id).await;
        assert_eq!(finished.status, JobStatus::Completed);

        // The conversation row was auto-created and its history advanced
        // (lock release and history writes land just after the terminal
        // status, so give them a moment)
        tokio::time::sleep(Duration::from_millis(150)).await;
        let conversation = db.get_conversation("c1").unwrap();
        assert_eq!(conversation.history, "<USER>hi</USER><br>");
        assert!(handler.lock_info("c1").await.is_none());

        let calls = calls.lock().unwrap();
        let paths: Vec<&str> = calls.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(paths, vec!["/ai", "/send-message"]);
    }

    #[tokio::test]
    async fn test_supersession_of_in_flight_job() {
        let db = Database::open_in_memory().unwrap();
        let store = SharedStore::in_memory();
        let (base, calls) = stub_backends(Duration::from_millis(400)).await;
        let handler = handler_against(&base, &db, &store);

        let first = handler
            .handle(request("c2", "<USER>a</USER><br>"))
            .await;
        let first_job = first.ai_job_id.clone().unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = handler
            .handle(request("c2", "<USER>a</USER><br><USER>b</USER><br>"))
            .await;

        assert!(second.success);
        assert!(second.reprocessing);
        assert_eq!(second.status, "reprocessing");
        assert_eq!(second.consolidated_count, 2);
        assert_eq!(second.cancelled_previous_job.as_deref(), Some(first_job.as_str()));
        assert_eq!(second.lock_id, first.lock_id);

        // First job dies superseded; second completes and dispatches
        let first_terminal = wait_terminal(&handler, &first_job).await;
        assert!(matches!(
            first_terminal.status,
            JobStatus::Cancelled | JobStatus::Failed
        ));
        let second_terminal =
            wait_terminal(&handler, second.ai_job_id.as_deref().unwrap()).await;
        assert_eq!(second_terminal.status, JobStatus::Completed);

        // Exactly one action reached the platform
        tokio::time::sleep(Duration::from_millis(200)).await;
        let calls = calls.lock().unwrap();
        let chat_count = calls.iter().filter(|(p, _)| p == "/send-message").count();
        assert_eq!(chat_count, 1);
    }

    #[tokio::test]
    async fn test_incremental_dispatch_sends_only_new_messages() {
        let db = Database::open_in_memory().unwrap();
        let store = SharedStore::in_memory();
        let (base, calls) = stub_backends(Duration::ZERO).await;
        let handler = handler_against(&base, &db, &store);

        let first = handler
            .handle(request("c3", "<USER>hi</USER><br>"))
            .await;
        wait_terminal(&handler, first.ai_job_id.as_deref().unwrap()).await;

        let second = handler
            .handle(request(
                "c3",
                "<USER>hi</USER><br><BOT>hello</BOT><br><USER>how are you</USER><br>",
            ))
            .await;
        assert_eq!(second.consolidated_messages, 2);
        wait_terminal(&handler, second.ai_job_id.as_deref().unwrap()).await;

        let calls = calls.lock().unwrap();
        let ai_bodies: Vec<&Value> = calls
            .iter()
            .filter(|(p, _)| p == "/ai")
            .map(|(_, b)| b)
            .collect();
        assert_eq!(ai_bodies.len(), 2);

        let second_messages = ai_bodies[1]["messages"].as_array().unwrap();
        assert_eq!(second_messages.len(), 2);
        assert_eq!(second_messages[0]["role"], "assistant");
        assert_eq!(second_messages[0]["content"], "hello");
        assert_eq!(second_messages[1]["role"], "user");
        assert_eq!(second_messages[1]["content"], "how are you");
    }

    #[tokio::test]
    async fn test_empty_history_still_locks_and_creates_job() {
        let db = Database::open_in_memory().unwrap();
        let store = SharedStore::in_memory();
        let (base, _calls) = stub_backends(Duration::ZERO).await;
        let handler = handler_against(&base, &db, &store);

        let response = handler.handle(request("c4", "")).await;
        assert!(response.success);
        assert_eq!(response.consolidated_messages, 0);
        assert!(response.ai_job_id.is_some());
        assert!(response.lock_id.is_some());
    }

    #[tokio::test]
    async fn test_generated_conversation_id_when_absent() {
        let db = Database::open_in_memory().unwrap();
        let store = SharedStore::in_memory();
        let (base, _calls) = stub_backends(Duration::ZERO).await;
        let handler = handler_against(&base, &db, &store);

        let response = handler
            .handle(HandleRequest {
                conversation_id: None,
                history: "<USER>hi</USER><br>".to_string(),
                resources: None,
                bot_id: None,
            })
            .await;
        assert!(response.success);
        assert!(!response.conversation_id.is_empty());
        assert!(db.get_conversation(&response.conversation_id).is_ok());
    }

    #[tokio::test]
    async fn test_defaults_when_no_bot_configured() {
        // No bot rows at all: the default config routes to localhost and the
        // job fails on connect, but the caller is still acknowledged
        let db = Database::open_in_memory().unwrap();
        let store = SharedStore::in_memory();
        let configs = Arc::new(ConfigStore::new(db.clone()));
        let handler = MessageHandler::new(db, store, configs);

        let response = handler
            .handle(request("c5", "<USER>hi</USER><br>"))
            .await;
        assert!(response.success);
        assert_eq!(response.bot_name, "Default Bot");
    }
}
