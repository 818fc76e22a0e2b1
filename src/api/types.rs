//! API request and response types

use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_timeout() -> u64 {
    30
}

fn default_rate_limit() -> u32 {
    60
}

fn default_language() -> String {
    "vi".to_string()
}

fn default_meta() -> Value {
    serde_json::json!({})
}

/// Inbound conversation update
#[derive(Debug, Deserialize)]
pub struct ChatMessageRequest {
    pub conversation_id: Option<String>,
    pub history: String,
    pub resources: Option<Value>,
    pub bot_id: Option<String>,
}

/// Trimmed job view for the monitoring surface; the raw record carries the
/// captured configs (auth tokens included), which must not leave the store.
#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: String,
    pub conversation_id: String,
    pub lock_id: String,
    pub status: crate::jobs::JobStatus,
    pub message_count: usize,
    pub created_at: f64,
    pub updated_at: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<u64>,
}

impl From<crate::jobs::JobRecord> for JobStatusResponse {
    fn from(job: crate::jobs::JobRecord) -> Self {
        Self {
            job_id: job.job_id,
            conversation_id: job.conversation_id,
            lock_id: job.lock_id,
            status: job.status,
            message_count: job.payload.messages.len(),
            created_at: job.created_at,
            updated_at: job.updated_at,
            result: job.result,
            error: job.error,
            processing_time_ms: job.processing_time_ms,
        }
    }
}

/// Response for lock release
#[derive(Debug, Serialize)]
pub struct LockReleaseResponse {
    pub released: bool,
}

/// Response for stale-lock cleanup
#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub removed: usize,
}

/// Service health summary
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub distributed_store: bool,
    pub store_degraded: bool,
}

/// Reachability of one configured AI endpoint or platform
#[derive(Debug, Serialize)]
pub struct ComponentHealthResponse {
    pub healthy: bool,
}

/// Transcript pulled from the platform for one conversation
#[derive(Debug, Serialize)]
pub struct PlatformHistoryResponse {
    pub conversation_id: String,
    pub history: String,
    pub resources: Value,
}

/// Response for lifecycle actions
#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}

// ============================================================
// Admin request bodies
// ============================================================

#[derive(Debug, Deserialize)]
pub struct CreateCoreAiRequest {
    pub name: String,
    pub description: Option<String>,
    pub api_endpoint: String,
    #[serde(default)]
    pub auth_required: bool,
    pub auth_token: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_meta")]
    pub meta_data: Value,
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateCoreAiRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub api_endpoint: Option<String>,
    pub auth_required: Option<bool>,
    pub auth_token: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub is_active: Option<bool>,
    pub meta_data: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct CreatePlatformRequest {
    pub name: String,
    pub description: Option<String>,
    pub base_url: String,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,
    #[serde(default)]
    pub auth_required: bool,
    pub auth_token: Option<String>,
    #[serde(default = "default_meta")]
    pub meta_data: Value,
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdatePlatformRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub base_url: Option<String>,
    pub rate_limit_per_minute: Option<u32>,
    pub auth_required: Option<bool>,
    pub auth_token: Option<String>,
    pub is_active: Option<bool>,
    pub meta_data: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct CreatePlatformActionRequest {
    pub name: String,
    pub description: Option<String>,
    pub method: String,
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateBotRequest {
    pub name: String,
    pub description: Option<String>,
    #[serde(default = "default_language")]
    pub language: String,
    pub core_ai_id: String,
    pub platform_id: String,
    #[serde(default = "default_meta")]
    pub meta_data: Value,
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateBotRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub language: Option<String>,
    pub core_ai_id: Option<String>,
    pub platform_id: Option<String>,
    pub is_active: Option<bool>,
    pub meta_data: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct CreateMessageRequest {
    pub role: String,
    pub content: String,
    pub content_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateConversationStatusRequest {
    pub status: String,
}
