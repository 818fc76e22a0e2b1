//! HTTP request handlers for the chat and monitoring surfaces

use super::auth::verify_bearer;
use super::types::{
    ChatMessageRequest, CleanupResponse, ComponentHealthResponse, ErrorResponse, HealthResponse,
    JobStatusResponse, LockReleaseResponse, PlatformHistoryResponse,
};
use super::AppState;
use crate::db::DbError;
use crate::handler::{HandleRequest, HandleResponse};

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::time::Duration;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Core pipeline entry point
        .route("/api/v1/chat/message", post(send_message))
        // Monitoring
        .route("/api/v1/monitor/jobs/:job_id", get(get_job_status))
        .route("/api/v1/monitor/jobs/:job_id/cancel", post(cancel_job))
        .route(
            "/api/v1/monitor/locks/:conversation_id",
            get(get_lock_info),
        )
        .route(
            "/api/v1/monitor/locks/:conversation_id/release",
            post(release_lock),
        )
        .route("/api/v1/monitor/locks/cleanup", post(cleanup_locks))
        .route("/api/v1/monitor/health", get(health))
        .route("/api/v1/monitor/health/core-ai/:id", get(core_ai_health))
        .route(
            "/api/v1/monitor/health/platform/:id",
            get(platform_health),
        )
        .route(
            "/api/v1/monitor/conversations/:conversation_id/platform-history",
            get(platform_history),
        )
        // Admin CRUD over the configuration entities
        .nest("/api/v1/admin", super::admin::router())
        // Version
        .route("/version", get(get_version))
        .with_state(state)
}

// ============================================================
// Chat
// ============================================================

/// Accept a conversation update and start (or supersede) AI processing.
///
/// Returns 200 for every accepted update, including superseding ones; 500
/// only when the orchestrator itself failed and released the lock.
async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatMessageRequest>,
) -> Result<Response, AppError> {
    verify_bearer(&headers, &state.settings.platform_access_token)?;

    let response: HandleResponse = state
        .handler
        .handle(HandleRequest {
            conversation_id: request.conversation_id,
            history: request.history,
            resources: request.resources,
            bot_id: request.bot_id,
        })
        .await;

    let status = if response.success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    Ok((status, Json(response)).into_response())
}

// ============================================================
// Monitoring
// ============================================================

async fn get_job_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusResponse>, AppError> {
    verify_bearer(&headers, &state.settings.admin_access_token)?;
    match state.handler.job_status(&job_id).await {
        Some(job) => Ok(Json(job.into())),
        None => Err(AppError::NotFound(format!("Job not found: {job_id}"))),
    }
}

async fn cancel_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Result<Json<super::types::SuccessResponse>, AppError> {
    verify_bearer(&headers, &state.settings.admin_access_token)?;
    if !state.handler.cancel_job(&job_id).await {
        return Err(AppError::NotFound(format!("Job not found: {job_id}")));
    }
    Ok(Json(super::types::SuccessResponse { success: true }))
}

async fn get_lock_info(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> Result<Json<crate::lock::LockRecord>, AppError> {
    verify_bearer(&headers, &state.settings.admin_access_token)?;
    match state.handler.lock_info(&conversation_id).await {
        Some(lock) => Ok(Json(lock)),
        None => Err(AppError::NotFound(format!(
            "No lock for conversation: {conversation_id}"
        ))),
    }
}

async fn release_lock(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> Result<Json<LockReleaseResponse>, AppError> {
    verify_bearer(&headers, &state.settings.admin_access_token)?;
    let released = state.handler.release_lock(&conversation_id).await;
    Ok(Json(LockReleaseResponse { released }))
}

async fn cleanup_locks(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<CleanupResponse>, AppError> {
    verify_bearer(&headers, &state.settings.admin_access_token)?;
    let max_age = Duration::from_secs(state.settings.max_conversation_age_hours * 3600);
    let removed = state.handler.cleanup_stale_locks(max_age).await;
    Ok(Json(CleanupResponse { removed }))
}

async fn core_ai_health(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ComponentHealthResponse>, AppError> {
    verify_bearer(&headers, &state.settings.admin_access_token)?;
    let healthy = state.handler.core_ai_health(&id).await;
    Ok(Json(ComponentHealthResponse { healthy }))
}

async fn platform_health(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ComponentHealthResponse>, AppError> {
    verify_bearer(&headers, &state.settings.admin_access_token)?;
    let healthy = state.handler.platform_health(&id).await;
    Ok(Json(ComponentHealthResponse { healthy }))
}

async fn platform_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> Result<Json<PlatformHistoryResponse>, AppError> {
    verify_bearer(&headers, &state.settings.admin_access_token)?;
    match state.handler.platform_history(&conversation_id).await {
        Ok(fetched) => Ok(Json(PlatformHistoryResponse {
            conversation_id,
            history: fetched.history,
            resources: fetched.resources,
        })),
        Err(e) => Err(AppError::Internal(format!(
            "Failed to fetch platform history: {e}"
        ))),
    }
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let degraded = state.store.is_degraded();
    Json(HealthResponse {
        status: if degraded { "degraded" } else { "healthy" },
        distributed_store: state.store.has_distributed_backend(),
        store_degraded: degraded,
    })
}

// ============================================================
// Version
// ============================================================

async fn get_version() -> &'static str {
    concat!("chat-orchestrator ", env!("CARGO_PKG_VERSION"))
}

// ============================================================
// Error Handling
// ============================================================

pub enum AppError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Internal(String),
}

impl From<DbError> for AppError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound(entity, id) => Self::NotFound(format!("{entity} not found: {id}")),
            DbError::NameExists(_) | DbError::InUse(_) | DbError::InactiveReference(_) => {
                Self::BadRequest(e.to_string())
            }
            DbError::Sqlite(_) => Self::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse::new(message));
        (status, body).into_response()
    }
}
