//! Admin CRUD surface over the configuration entities
//!
//! Standard REST per entity. Validation failures are 400, unknown entities
//! 404, name or reference conflicts 400. Mutations clear the config cache
//! so the pipeline sees them on the next lookup.

use super::auth::verify_bearer;
use super::handlers::AppError;
use super::types::{
    CreateBotRequest, CreateCoreAiRequest, CreateMessageRequest, CreatePlatformActionRequest,
    CreatePlatformRequest, SuccessResponse, UpdateBotRequest, UpdateConversationStatusRequest,
    UpdateCoreAiRequest, UpdatePlatformRequest,
};
use super::AppState;
use crate::db::{
    Bot, BotUpdate, Conversation, ConversationStatus, CoreAi, CoreAiUpdate, HttpMethod,
    MessageRole, NewBot, NewCoreAi, NewPlatform, NewPlatformAction, Platform, PlatformAction,
    PlatformUpdate, StoredMessage,
};

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    routing::{delete, get, post},
    Json, Router,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/core-ai", post(create_core_ai).get(list_core_ai))
        .route(
            "/core-ai/:id",
            get(get_core_ai).put(update_core_ai).delete(delete_core_ai),
        )
        .route("/platform", post(create_platform).get(list_platforms))
        .route(
            "/platform/:id",
            get(get_platform)
                .put(update_platform)
                .delete(delete_platform),
        )
        .route(
            "/platform/:id/actions",
            post(create_platform_action).get(list_platform_actions),
        )
        .route(
            "/platform/:id/actions/:action_id",
            delete(delete_platform_action),
        )
        .route("/bot", post(create_bot).get(list_bots))
        .route("/bot/:id", get(get_bot).put(update_bot).delete(delete_bot))
        .route("/conversation", get(list_conversations))
        .route(
            "/conversation/:id",
            get(get_conversation).delete(delete_conversation),
        )
        .route(
            "/conversation/:id/status",
            post(update_conversation_status),
        )
        .route(
            "/conversation/:id/messages",
            post(add_message).get(list_messages),
        )
        .route("/cache/clear", post(clear_cache))
}

fn require_name(name: &str) -> Result<(), AppError> {
    if name.trim().is_empty() {
        return Err(AppError::BadRequest("name must not be empty".to_string()));
    }
    Ok(())
}

// ============================================================
// CoreAI
// ============================================================

async fn create_core_ai(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateCoreAiRequest>,
) -> Result<Json<CoreAi>, AppError> {
    verify_bearer(&headers, &state.settings.admin_access_token)?;
    require_name(&request.name)?;
    if request.timeout_seconds < 1 {
        return Err(AppError::BadRequest(
            "timeout_seconds must be at least 1".to_string(),
        ));
    }

    let created = state.db.create_core_ai(&NewCoreAi {
        name: request.name,
        description: request.description,
        api_endpoint: request.api_endpoint,
        auth_required: request.auth_required,
        auth_token: request.auth_token,
        timeout_seconds: request.timeout_seconds,
        meta_data: request.meta_data,
    })?;
    Ok(Json(created))
}

async fn list_core_ai(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<CoreAi>>, AppError> {
    verify_bearer(&headers, &state.settings.admin_access_token)?;
    Ok(Json(state.db.list_core_ai()?))
}

async fn get_core_ai(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<CoreAi>, AppError> {
    verify_bearer(&headers, &state.settings.admin_access_token)?;
    Ok(Json(state.db.get_core_ai(&id)?))
}

async fn update_core_ai(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<UpdateCoreAiRequest>,
) -> Result<Json<CoreAi>, AppError> {
    verify_bearer(&headers, &state.settings.admin_access_token)?;
    if let Some(name) = &request.name {
        require_name(name)?;
    }
    if matches!(request.timeout_seconds, Some(0)) {
        return Err(AppError::BadRequest(
            "timeout_seconds must be at least 1".to_string(),
        ));
    }

    let updated = state.db.update_core_ai(
        &id,
        &CoreAiUpdate {
            name: request.name,
            description: request.description,
            api_endpoint: request.api_endpoint,
            auth_required: request.auth_required,
            auth_token: request.auth_token,
            timeout_seconds: request.timeout_seconds,
            is_active: request.is_active,
            meta_data: request.meta_data,
        },
    )?;
    state.configs.clear_cache();
    Ok(Json(updated))
}

async fn delete_core_ai(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, AppError> {
    verify_bearer(&headers, &state.settings.admin_access_token)?;
    state.db.delete_core_ai(&id)?;
    state.configs.clear_cache();
    Ok(Json(SuccessResponse { success: true }))
}

// ============================================================
// Platform
// ============================================================

async fn create_platform(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreatePlatformRequest>,
) -> Result<Json<Platform>, AppError> {
    verify_bearer(&headers, &state.settings.admin_access_token)?;
    require_name(&request.name)?;
    if request.rate_limit_per_minute < 1 {
        return Err(AppError::BadRequest(
            "rate_limit_per_minute must be at least 1".to_string(),
        ));
    }

    let created = state.db.create_platform(&NewPlatform {
        name: request.name,
        description: request.description,
        base_url: request.base_url,
        rate_limit_per_minute: request.rate_limit_per_minute,
        auth_required: request.auth_required,
        auth_token: request.auth_token,
        meta_data: request.meta_data,
    })?;
    Ok(Json(created))
}

async fn list_platforms(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Platform>>, AppError> {
    verify_bearer(&headers, &state.settings.admin_access_token)?;
    Ok(Json(state.db.list_platforms()?))
}

async fn get_platform(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Platform>, AppError> {
    verify_bearer(&headers, &state.settings.admin_access_token)?;
    Ok(Json(state.db.get_platform(&id)?))
}

async fn update_platform(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<UpdatePlatformRequest>,
) -> Result<Json<Platform>, AppError> {
    verify_bearer(&headers, &state.settings.admin_access_token)?;
    if let Some(name) = &request.name {
        require_name(name)?;
    }
    if matches!(request.rate_limit_per_minute, Some(0)) {
        return Err(AppError::BadRequest(
            "rate_limit_per_minute must be at least 1".to_string(),
        ));
    }

    let updated = state.db.update_platform(
        &id,
        &PlatformUpdate {
            name: request.name,
            description: request.description,
            base_url: request.base_url,
            rate_limit_per_minute: request.rate_limit_per_minute,
            auth_required: request.auth_required,
            auth_token: request.auth_token,
            is_active: request.is_active,
            meta_data: request.meta_data,
        },
    )?;
    state.configs.clear_cache();
    Ok(Json(updated))
}

async fn delete_platform(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, AppError> {
    verify_bearer(&headers, &state.settings.admin_access_token)?;
    state.db.delete_platform(&id)?;
    state.configs.clear_cache();
    Ok(Json(SuccessResponse { success: true }))
}

// ============================================================
// PlatformAction
// ============================================================

async fn create_platform_action(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(platform_id): Path<String>,
    Json(request): Json<CreatePlatformActionRequest>,
) -> Result<Json<PlatformAction>, AppError> {
    verify_bearer(&headers, &state.settings.admin_access_token)?;
    require_name(&request.name)?;
    let Some(method) = HttpMethod::parse(&request.method) else {
        return Err(AppError::BadRequest(format!(
            "invalid method: {}",
            request.method
        )));
    };

    let created = state.db.create_platform_action(&NewPlatformAction {
        platform_id,
        name: request.name,
        description: request.description,
        method,
        path: request.path,
    })?;
    Ok(Json(created))
}

async fn list_platform_actions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(platform_id): Path<String>,
) -> Result<Json<Vec<PlatformAction>>, AppError> {
    verify_bearer(&headers, &state.settings.admin_access_token)?;
    // 404 for an unknown platform rather than an empty list
    state.db.get_platform(&platform_id)?;
    Ok(Json(state.db.list_platform_actions(&platform_id)?))
}

async fn delete_platform_action(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((_platform_id, action_id)): Path<(String, String)>,
) -> Result<Json<SuccessResponse>, AppError> {
    verify_bearer(&headers, &state.settings.admin_access_token)?;
    state.db.delete_platform_action(&action_id)?;
    Ok(Json(SuccessResponse { success: true }))
}

// ============================================================
// Bot
// ============================================================

async fn create_bot(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateBotRequest>,
) -> Result<Json<Bot>, AppError> {
    verify_bearer(&headers, &state.settings.admin_access_token)?;
    require_name(&request.name)?;

    let created = state.db.create_bot(&NewBot {
        name: request.name,
        description: request.description,
        language: request.language,
        core_ai_id: request.core_ai_id,
        platform_id: request.platform_id,
        meta_data: request.meta_data,
    })?;
    Ok(Json(created))
}

async fn list_bots(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Bot>>, AppError> {
    verify_bearer(&headers, &state.settings.admin_access_token)?;
    Ok(Json(state.db.list_bots()?))
}

async fn get_bot(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Bot>, AppError> {
    verify_bearer(&headers, &state.settings.admin_access_token)?;
    Ok(Json(state.db.get_bot(&id)?))
}

async fn update_bot(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<UpdateBotRequest>,
) -> Result<Json<Bot>, AppError> {
    verify_bearer(&headers, &state.settings.admin_access_token)?;
    if let Some(name) = &request.name {
        require_name(name)?;
    }

    let updated = state.db.update_bot(
        &id,
        &BotUpdate {
            name: request.name,
            description: request.description,
            language: request.language,
            core_ai_id: request.core_ai_id,
            platform_id: request.platform_id,
            is_active: request.is_active,
            meta_data: request.meta_data,
        },
    )?;
    state.configs.clear_cache();
    Ok(Json(updated))
}

async fn delete_bot(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, AppError> {
    verify_bearer(&headers, &state.settings.admin_access_token)?;
    state.db.delete_bot(&id)?;
    state.configs.clear_cache();
    Ok(Json(SuccessResponse { success: true }))
}

// ============================================================
// Conversation
// ============================================================

async fn list_conversations(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Conversation>>, AppError> {
    verify_bearer(&headers, &state.settings.admin_access_token)?;
    Ok(Json(state.db.list_conversations()?))
}

async fn get_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Conversation>, AppError> {
    verify_bearer(&headers, &state.settings.admin_access_token)?;
    Ok(Json(state.db.get_conversation(&id)?))
}

async fn delete_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, AppError> {
    verify_bearer(&headers, &state.settings.admin_access_token)?;
    state.db.delete_conversation(&id)?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn update_conversation_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<UpdateConversationStatusRequest>,
) -> Result<Json<SuccessResponse>, AppError> {
    verify_bearer(&headers, &state.settings.admin_access_token)?;
    let Some(status) = ConversationStatus::parse(&request.status) else {
        return Err(AppError::BadRequest(format!(
            "invalid status: {}",
            request.status
        )));
    };
    state.db.update_conversation_status(&id, status)?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn add_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<CreateMessageRequest>,
) -> Result<Json<StoredMessage>, AppError> {
    verify_bearer(&headers, &state.settings.admin_access_token)?;
    let Some(role) = MessageRole::parse(&request.role) else {
        return Err(AppError::BadRequest(format!(
            "invalid role: {}",
            request.role
        )));
    };
    let message = state.db.add_message(
        &id,
        role,
        &request.content,
        request.content_type.as_deref(),
    )?;
    Ok(Json(message))
}

async fn list_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Vec<StoredMessage>>, AppError> {
    verify_bearer(&headers, &state.settings.admin_access_token)?;
    Ok(Json(state.db.get_messages(&id)?))
}

// ============================================================
// Cache
// ============================================================

async fn clear_cache(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SuccessResponse>, AppError> {
    verify_bearer(&headers, &state.settings.admin_access_token)?;
    state.configs.clear_cache();
    Ok(Json(SuccessResponse { success: true }))
}
