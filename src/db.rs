//! Database module for the chat orchestrator
//!
//! Provides persistence for AI endpoint, platform, bot, and conversation
//! configuration. The coalescing pipeline reads these entities through the
//! config store; the admin API mutates them directly.

mod schema;

pub use schema::*;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("{0} not found: {1}")]
    NotFound(&'static str, String),
    #[error("Name already exists: {0}")]
    NameExists(String),
    #[error("{0}")]
    InUse(String),
    #[error("{0}")]
    InactiveReference(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    #[allow(dead_code)] // Used in tests
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ==================== CoreAI Operations ====================

    pub fn create_core_ai(&self, new: &NewCoreAi) -> DbResult<CoreAi> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();

        if name_taken(&conn, "core_ai", &new.name, None)? {
            return Err(DbError::NameExists(new.name.clone()));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let meta = serde_json::to_string(&new.meta_data).unwrap();
        conn.execute(
            "INSERT INTO core_ai (id, name, description, api_endpoint, auth_required, auth_token,
                                  timeout_seconds, is_active, meta_data, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?9, ?9)",
            params![
                id,
                new.name,
                new.description,
                new.api_endpoint,
                new.auth_required,
                new.auth_token,
                new.timeout_seconds,
                meta,
                now.to_rfc3339(),
            ],
        )?;

        get_core_ai_locked(&conn, &id)
    }

    pub fn get_core_ai(&self, id: &str) -> DbResult<CoreAi> {
        let conn = self.conn.lock().unwrap();
        get_core_ai_locked(&conn, id)
    }

    /// First active CoreAI, if any. Used when a bot references no specific one.
    pub fn first_active_core_ai(&self) -> DbResult<Option<CoreAi>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, description, api_endpoint, auth_required, auth_token,
                    timeout_seconds, is_active, meta_data, created_at, updated_at
             FROM core_ai WHERE is_active = 1 ORDER BY created_at ASC LIMIT 1",
        )?;
        let mut rows = stmt.query_map([], parse_core_ai_row)?;
        rows.next().transpose().map_err(DbError::from)
    }

    pub fn list_core_ai(&self) -> DbResult<Vec<CoreAi>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, description, api_endpoint, auth_required, auth_token,
                    timeout_seconds, is_active, meta_data, created_at, updated_at
             FROM core_ai ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], parse_core_ai_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    pub fn update_core_ai(&self, id: &str, update: &CoreAiUpdate) -> DbResult<CoreAi> {
        let conn = self.conn.lock().unwrap();
        let current = get_core_ai_locked(&conn, id)?;

        if let Some(name) = &update.name {
            if name_taken(&conn, "core_ai", name, Some(id))? {
                return Err(DbError::NameExists(name.clone()));
            }
        }

        let now = Utc::now();
        let meta = update
            .meta_data
            .as_ref()
            .map(|m| serde_json::to_string(m).unwrap());
        conn.execute(
            "UPDATE core_ai
             SET name = ?1, description = ?2, api_endpoint = ?3, auth_required = ?4,
                 auth_token = ?5, timeout_seconds = ?6, is_active = ?7, meta_data = ?8,
                 updated_at = ?9
             WHERE id = ?10",
            params![
                update.name.as_ref().unwrap_or(&current.name),
                update.description.as_ref().or(current.description.as_ref()),
                update.api_endpoint.as_ref().unwrap_or(&current.api_endpoint),
                update.auth_required.unwrap_or(current.auth_required),
                update.auth_token.as_ref().or(current.auth_token.as_ref()),
                update.timeout_seconds.unwrap_or(current.timeout_seconds),
                update.is_active.unwrap_or(current.is_active),
                meta.unwrap_or_else(|| serde_json::to_string(&current.meta_data).unwrap()),
                now.to_rfc3339(),
                id,
            ],
        )?;

        get_core_ai_locked(&conn, id)
    }

    /// Hard delete. Refused while an active bot references this CoreAI.
    pub fn delete_core_ai(&self, id: &str) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let referenced: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM bots WHERE core_ai_id = ?1 AND is_active = 1)",
            params![id],
            |row| row.get(0),
        )?;
        if referenced {
            return Err(DbError::InUse(format!(
                "CoreAI {id} is referenced by an active bot"
            )));
        }

        let deleted = conn.execute("DELETE FROM core_ai WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(DbError::NotFound("CoreAI", id.to_string()));
        }
        Ok(())
    }

    // ==================== Platform Operations ====================

    pub fn create_platform(&self, new: &NewPlatform) -> DbResult<Platform> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();

        if name_taken(&conn, "platforms", &new.name, None)? {
            return Err(DbError::NameExists(new.name.clone()));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let meta = serde_json::to_string(&new.meta_data).unwrap();
        conn.execute(
            "INSERT INTO platforms (id, name, description, base_url, rate_limit_per_minute,
                                    auth_required, auth_token, is_active, meta_data,
                                    created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?9, ?9)",
            params![
                id,
                new.name,
                new.description,
                new.base_url,
                new.rate_limit_per_minute,
                new.auth_required,
                new.auth_token,
                meta,
                now.to_rfc3339(),
            ],
        )?;

        get_platform_locked(&conn, &id)
    }

    pub fn get_platform(&self, id: &str) -> DbResult<Platform> {
        let conn = self.conn.lock().unwrap();
        get_platform_locked(&conn, id)
    }

    pub fn first_active_platform(&self) -> DbResult<Option<Platform>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, description, base_url, rate_limit_per_minute, auth_required,
                    auth_token, is_active, meta_data, created_at, updated_at
             FROM platforms WHERE is_active = 1 ORDER BY created_at ASC LIMIT 1",
        )?;
        let mut rows = stmt.query_map([], parse_platform_row)?;
        rows.next().transpose().map_err(DbError::from)
    }

    pub fn list_platforms(&self) -> DbResult<Vec<Platform>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, description, base_url, rate_limit_per_minute, auth_required,
                    auth_token, is_active, meta_data, created_at, updated_at
             FROM platforms ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], parse_platform_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    pub fn update_platform(&self, id: &str, update: &PlatformUpdate) -> DbResult<Platform> {
        let conn = self.conn.lock().unwrap();
        let current = get_platform_locked(&conn, id)?;

        if let Some(name) = &update.name {
            if name_taken(&conn, "platforms", name, Some(id))? {
                return Err(DbError::NameExists(name.clone()));
            }
        }

        let now = Utc::now();
        let meta = update
            .meta_data
            .as_ref()
            .map(|m| serde_json::to_string(m).unwrap());
        conn.execute(
            "UPDATE platforms
             SET name = ?1, description = ?2, base_url = ?3, rate_limit_per_minute = ?4,
                 auth_required = ?5, auth_token = ?6, is_active = ?7, meta_data = ?8,
                 updated_at = ?9
             WHERE id = ?10",
            params![
                update.name.as_ref().unwrap_or(&current.name),
                update.description.as_ref().or(current.description.as_ref()),
                update.base_url.as_ref().unwrap_or(&current.base_url),
                update
                    .rate_limit_per_minute
                    .unwrap_or(current.rate_limit_per_minute),
                update.auth_required.unwrap_or(current.auth_required),
                update.auth_token.as_ref().or(current.auth_token.as_ref()),
                update.is_active.unwrap_or(current.is_active),
                meta.unwrap_or_else(|| serde_json::to_string(&current.meta_data).unwrap()),
                now.to_rfc3339(),
                id,
            ],
        )?;

        get_platform_locked(&conn, id)
    }

    /// Hard delete. Actions are removed by CASCADE; refused while an active
    /// bot references this platform.
    pub fn delete_platform(&self, id: &str) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let referenced: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM bots WHERE platform_id = ?1 AND is_active = 1)",
            params![id],
            |row| row.get(0),
        )?;
        if referenced {
            return Err(DbError::InUse(format!(
                "Platform {id} is referenced by an active bot"
            )));
        }

        let deleted = conn.execute("DELETE FROM platforms WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(DbError::NotFound("Platform", id.to_string()));
        }
        Ok(())
    }

    // ==================== PlatformAction Operations ====================

    pub fn create_platform_action(&self, new: &NewPlatformAction) -> DbResult<PlatformAction> {
        let conn = self.conn.lock().unwrap();
        // FK check up front for a readable error
        get_platform_locked(&conn, &new.platform_id)?;

        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO platform_actions (id, platform_id, name, description, method, path,
                                           is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)",
            params![
                id,
                new.platform_id,
                new.name,
                new.description,
                new.method.to_string(),
                new.path,
                now.to_rfc3339(),
            ],
        )?;

        conn.query_row(
            "SELECT id, platform_id, name, description, method, path, is_active, created_at
             FROM platform_actions WHERE id = ?1",
            params![id],
            parse_platform_action_row,
        )
        .map_err(DbError::from)
    }

    pub fn list_platform_actions(&self, platform_id: &str) -> DbResult<Vec<PlatformAction>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, platform_id, name, description, method, path, is_active, created_at
             FROM platform_actions WHERE platform_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![platform_id], parse_platform_action_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    pub fn delete_platform_action(&self, id: &str) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM platform_actions WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(DbError::NotFound("PlatformAction", id.to_string()));
        }
        Ok(())
    }

    // ==================== Bot Operations ====================

    /// Create a bot. Its CoreAI and Platform must exist and be active.
    pub fn create_bot(&self, new: &NewBot) -> DbResult<Bot> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();

        if name_taken(&conn, "bots", &new.name, None)? {
            return Err(DbError::NameExists(new.name.clone()));
        }

        let core_ai = get_core_ai_locked(&conn, &new.core_ai_id)?;
        if !core_ai.is_active {
            return Err(DbError::InactiveReference(format!(
                "CoreAI {} is inactive",
                new.core_ai_id
            )));
        }
        let platform = get_platform_locked(&conn, &new.platform_id)?;
        if !platform.is_active {
            return Err(DbError::InactiveReference(format!(
                "Platform {} is inactive",
                new.platform_id
            )));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let meta = serde_json::to_string(&new.meta_data).unwrap();
        conn.execute(
            "INSERT INTO bots (id, name, description, language, core_ai_id, platform_id,
                               is_active, meta_data, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8, ?8)",
            params![
                id,
                new.name,
                new.description,
                new.language,
                new.core_ai_id,
                new.platform_id,
                meta,
                now.to_rfc3339(),
            ],
        )?;

        get_bot_locked(&conn, &id)
    }

    pub fn get_bot(&self, id: &str) -> DbResult<Bot> {
        let conn = self.conn.lock().unwrap();
        get_bot_locked(&conn, id)
    }

    pub fn first_active_bot(&self) -> DbResult<Option<Bot>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, description, language, core_ai_id, platform_id, is_active,
                    meta_data, created_at, updated_at
             FROM bots WHERE is_active = 1 ORDER BY created_at ASC LIMIT 1",
        )?;
        let mut rows = stmt.query_map([], parse_bot_row)?;
        rows.next().transpose().map_err(DbError::from)
    }

    pub fn list_bots(&self) -> DbResult<Vec<Bot>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, description, language, core_ai_id, platform_id, is_active,
                    meta_data, created_at, updated_at
             FROM bots ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], parse_bot_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    pub fn update_bot(&self, id: &str, update: &BotUpdate) -> DbResult<Bot> {
        let conn = self.conn.lock().unwrap();
        let current = get_bot_locked(&conn, id)?;

        if let Some(name) = &update.name {
            if name_taken(&conn, "bots", name, Some(id))? {
                return Err(DbError::NameExists(name.clone()));
            }
        }
        if let Some(core_ai_id) = &update.core_ai_id {
            let core_ai = get_core_ai_locked(&conn, core_ai_id)?;
            if !core_ai.is_active {
                return Err(DbError::InactiveReference(format!(
                    "CoreAI {core_ai_id} is inactive"
                )));
            }
        }
        if let Some(platform_id) = &update.platform_id {
            let platform = get_platform_locked(&conn, platform_id)?;
            if !platform.is_active {
                return Err(DbError::InactiveReference(format!(
                    "Platform {platform_id} is inactive"
                )));
            }
        }

        let now = Utc::now();
        let meta = update
            .meta_data
            .as_ref()
            .map(|m| serde_json::to_string(m).unwrap());
        conn.execute(
            "UPDATE bots
             SET name = ?1, description = ?2, language = ?3, core_ai_id = ?4,
                 platform_id = ?5, is_active = ?6, meta_data = ?7, updated_at = ?8
             WHERE id = ?9",
            params![
                update.name.as_ref().unwrap_or(&current.name),
                update.description.as_ref().or(current.description.as_ref()),
                update.language.as_ref().unwrap_or(&current.language),
                update.core_ai_id.as_ref().unwrap_or(&current.core_ai_id),
                update.platform_id.as_ref().unwrap_or(&current.platform_id),
                update.is_active.unwrap_or(current.is_active),
                meta.unwrap_or_else(|| serde_json::to_string(&current.meta_data).unwrap()),
                now.to_rfc3339(),
                id,
            ],
        )?;

        get_bot_locked(&conn, id)
    }

    /// Hard delete. Refused while a conversation references this bot.
    pub fn delete_bot(&self, id: &str) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let referenced: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM conversations WHERE bot_id = ?1)",
            params![id],
            |row| row.get(0),
        )?;
        if referenced {
            return Err(DbError::InUse(format!(
                "Bot {id} is referenced by a conversation"
            )));
        }

        let deleted = conn.execute("DELETE FROM bots WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(DbError::NotFound("Bot", id.to_string()));
        }
        Ok(())
    }

    // ==================== Conversation Operations ====================

    /// Find a conversation by its external id, creating it if unseen.
    pub fn get_or_create_conversation(
        &self,
        external_id: &str,
        bot_id: Option<&str>,
    ) -> DbResult<Conversation> {
        let conn = self.conn.lock().unwrap();

        if let Some(conv) = find_conversation_locked(&conn, external_id)? {
            return Ok(conv);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        // OR IGNORE: concurrent first-contact arrivals may race this insert
        conn.execute(
            "INSERT OR IGNORE INTO conversations (id, conversation_id, bot_id, status, context,
                                                  history, message_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'active', '{}', '', 0, ?4, ?4)",
            params![id, external_id, bot_id, now.to_rfc3339()],
        )?;

        find_conversation_locked(&conn, external_id)?
            .ok_or_else(|| DbError::NotFound("Conversation", external_id.to_string()))
    }

    pub fn get_conversation(&self, external_id: &str) -> DbResult<Conversation> {
        let conn = self.conn.lock().unwrap();
        find_conversation_locked(&conn, external_id)?
            .ok_or_else(|| DbError::NotFound("Conversation", external_id.to_string()))
    }

    pub fn list_conversations(&self) -> DbResult<Vec<Conversation>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, bot_id, status, context, history, message_count,
                    created_at, updated_at
             FROM conversations ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map([], parse_conversation_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    pub fn update_conversation_status(
        &self,
        external_id: &str,
        status: ConversationStatus,
    ) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        let updated = conn.execute(
            "UPDATE conversations SET status = ?1, updated_at = ?2 WHERE conversation_id = ?3",
            params![status.to_string(), now.to_rfc3339(), external_id],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound("Conversation", external_id.to_string()));
        }
        Ok(())
    }

    /// Advance the processed history. The write is skipped when the new value
    /// does not extend the stored one, so a slow job completion can never
    /// rewind past a newer arrival (I3).
    pub fn advance_conversation_history(
        &self,
        external_id: &str,
        history: &str,
    ) -> DbResult<bool> {
        let conn = self.conn.lock().unwrap();
        let Some(current) = find_conversation_locked(&conn, external_id)? else {
            return Err(DbError::NotFound("Conversation", external_id.to_string()));
        };

        if !history.contains(current.history.as_str()) {
            return Ok(false);
        }

        let now = Utc::now();
        conn.execute(
            "UPDATE conversations SET history = ?1, updated_at = ?2 WHERE conversation_id = ?3",
            params![history, now.to_rfc3339(), external_id],
        )?;
        Ok(true)
    }

    pub fn delete_conversation(&self, external_id: &str) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        // Messages are deleted by CASCADE
        let deleted = conn.execute(
            "DELETE FROM conversations WHERE conversation_id = ?1",
            params![external_id],
        )?;
        if deleted == 0 {
            return Err(DbError::NotFound("Conversation", external_id.to_string()));
        }
        Ok(())
    }

    // ==================== Message Operations ====================

    pub fn add_message(
        &self,
        external_id: &str,
        role: MessageRole,
        content: &str,
        content_type: Option<&str>,
    ) -> DbResult<StoredMessage> {
        let conn = self.conn.lock().unwrap();
        let Some(conv) = find_conversation_locked(&conn, external_id)? else {
            return Err(DbError::NotFound("Conversation", external_id.to_string()));
        };

        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO messages (id, conversation_id, role, content, content_type, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                conv.id,
                role.to_string(),
                content,
                content_type.unwrap_or("text/plain"),
                now.to_rfc3339(),
            ],
        )?;
        conn.execute(
            "UPDATE conversations SET message_count = message_count + 1, updated_at = ?1
             WHERE id = ?2",
            params![now.to_rfc3339(), conv.id],
        )?;

        Ok(StoredMessage {
            id,
            conversation_id: conv.id,
            role,
            content: content.to_string(),
            content_type: content_type.unwrap_or("text/plain").to_string(),
            created_at: now,
        })
    }

    pub fn get_messages(&self, external_id: &str) -> DbResult<Vec<StoredMessage>> {
        let conn = self.conn.lock().unwrap();
        let Some(conv) = find_conversation_locked(&conn, external_id)? else {
            return Err(DbError::NotFound("Conversation", external_id.to_string()));
        };

        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, role, content, content_type, created_at
             FROM messages WHERE conversation_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![conv.id], parse_message_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }
}

// ==================== Input Types ====================

/// Fields for creating a CoreAI record
#[derive(Debug, Clone)]
pub struct NewCoreAi {
    pub name: String,
    pub description: Option<String>,
    pub api_endpoint: String,
    pub auth_required: bool,
    pub auth_token: Option<String>,
    pub timeout_seconds: u64,
    pub meta_data: serde_json::Value,
}

/// Partial update for a CoreAI record
#[derive(Debug, Clone, Default)]
pub struct CoreAiUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub api_endpoint: Option<String>,
    pub auth_required: Option<bool>,
    pub auth_token: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub is_active: Option<bool>,
    pub meta_data: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct NewPlatform {
    pub name: String,
    pub description: Option<String>,
    pub base_url: String,
    pub rate_limit_per_minute: u32,
    pub auth_required: bool,
    pub auth_token: Option<String>,
    pub meta_data: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct PlatformUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub base_url: Option<String>,
    pub rate_limit_per_minute: Option<u32>,
    pub auth_required: Option<bool>,
    pub auth_token: Option<String>,
    pub is_active: Option<bool>,
    pub meta_data: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct NewPlatformAction {
    pub platform_id: String,
    pub name: String,
    pub description: Option<String>,
    pub method: HttpMethod,
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct NewBot {
    pub name: String,
    pub description: Option<String>,
    pub language: String,
    pub core_ai_id: String,
    pub platform_id: String,
    pub meta_data: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct BotUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub language: Option<String>,
    pub core_ai_id: Option<String>,
    pub platform_id: Option<String>,
    pub is_active: Option<bool>,
    pub meta_data: Option<serde_json::Value>,
}

// ==================== Row Parsers ====================

fn get_core_ai_locked(conn: &Connection, id: &str) -> DbResult<CoreAi> {
    conn.query_row(
        "SELECT id, name, description, api_endpoint, auth_required, auth_token,
                timeout_seconds, is_active, meta_data, created_at, updated_at
         FROM core_ai WHERE id = ?1",
        params![id],
        parse_core_ai_row,
    )
    .map_err(|e| not_found(e, "CoreAI", id))
}

fn get_platform_locked(conn: &Connection, id: &str) -> DbResult<Platform> {
    conn.query_row(
        "SELECT id, name, description, base_url, rate_limit_per_minute, auth_required,
                auth_token, is_active, meta_data, created_at, updated_at
         FROM platforms WHERE id = ?1",
        params![id],
        parse_platform_row,
    )
    .map_err(|e| not_found(e, "Platform", id))
}

fn get_bot_locked(conn: &Connection, id: &str) -> DbResult<Bot> {
    conn.query_row(
        "SELECT id, name, description, language, core_ai_id, platform_id, is_active,
                meta_data, created_at, updated_at
         FROM bots WHERE id = ?1",
        params![id],
        parse_bot_row,
    )
    .map_err(|e| not_found(e, "Bot", id))
}

fn find_conversation_locked(
    conn: &Connection,
    external_id: &str,
) -> DbResult<Option<Conversation>> {
    let mut stmt = conn.prepare(
        "SELECT id, conversation_id, bot_id, status, context, history, message_count,
                created_at, updated_at
         FROM conversations WHERE conversation_id = ?1",
    )?;
    let mut rows = stmt.query_map(params![external_id], parse_conversation_row)?;
    rows.next().transpose().map_err(DbError::from)
}

fn parse_core_ai_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CoreAi> {
    Ok(CoreAi {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        api_endpoint: row.get(3)?,
        auth_required: row.get(4)?,
        auth_token: row.get(5)?,
        timeout_seconds: row.get(6)?,
        is_active: row.get(7)?,
        meta_data: parse_json(&row.get::<_, String>(8)?),
        created_at: parse_datetime(&row.get::<_, String>(9)?),
        updated_at: parse_datetime(&row.get::<_, String>(10)?),
    })
}

fn parse_platform_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Platform> {
    Ok(Platform {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        base_url: row.get(3)?,
        rate_limit_per_minute: row.get(4)?,
        auth_required: row.get(5)?,
        auth_token: row.get(6)?,
        is_active: row.get(7)?,
        meta_data: parse_json(&row.get::<_, String>(8)?),
        created_at: parse_datetime(&row.get::<_, String>(9)?),
        updated_at: parse_datetime(&row.get::<_, String>(10)?),
    })
}

fn parse_platform_action_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PlatformAction> {
    Ok(PlatformAction {
        id: row.get(0)?,
        platform_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        method: HttpMethod::parse(&row.get::<_, String>(4)?).unwrap_or(HttpMethod::Post),
        path: row.get(5)?,
        is_active: row.get(6)?,
        created_at: parse_datetime(&row.get::<_, String>(7)?),
    })
}

fn parse_bot_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Bot> {
    Ok(Bot {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        language: row.get(3)?,
        core_ai_id: row.get(4)?,
        platform_id: row.get(5)?,
        is_active: row.get(6)?,
        meta_data: parse_json(&row.get::<_, String>(7)?),
        created_at: parse_datetime(&row.get::<_, String>(8)?),
        updated_at: parse_datetime(&row.get::<_, String>(9)?),
    })
}

fn parse_conversation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        bot_id: row.get(2)?,
        status: ConversationStatus::parse(&row.get::<_, String>(3)?)
            .unwrap_or(ConversationStatus::Active),
        context: parse_json(&row.get::<_, String>(4)?),
        history: row.get(5)?,
        message_count: row.get(6)?,
        created_at: parse_datetime(&row.get::<_, String>(7)?),
        updated_at: parse_datetime(&row.get::<_, String>(8)?),
    })
}

fn parse_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    Ok(StoredMessage {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role: MessageRole::parse(&row.get::<_, String>(2)?).unwrap_or(MessageRole::User),
        content: row.get(3)?,
        content_type: row.get(4)?,
        created_at: parse_datetime(&row.get::<_, String>(5)?),
    })
}

fn name_taken(
    conn: &Connection,
    table: &str,
    name: &str,
    exclude_id: Option<&str>,
) -> rusqlite::Result<bool> {
    match exclude_id {
        Some(id) => conn.query_row(
            &format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE name = ?1 AND id != ?2)"),
            params![name, id],
            |row| row.get(0),
        ),
        None => conn.query_row(
            &format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE name = ?1)"),
            params![name],
            |row| row.get(0),
        ),
    }
}

fn not_found(e: rusqlite::Error, entity: &'static str, id: &str) -> DbError {
    match e {
        rusqlite::Error::QueryReturnedNoRows => DbError::NotFound(entity, id.to_string()),
        other => DbError::Sqlite(other),
    }
}

fn parse_json(s: &str) -> serde_json::Value {
    serde_json::from_str(s).unwrap_or_else(|_| serde_json::json!({}))
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_ai(db: &Database) -> CoreAi {
        db.create_core_ai(&NewCoreAi {
            name: "primary-ai".to_string(),
            description: None,
            api_endpoint: "http://ai.example/{session_id}".to_string(),
            auth_required: false,
            auth_token: None,
            timeout_seconds: 30,
            meta_data: serde_json::json!({}),
        })
        .unwrap()
    }

    fn seed_platform(db: &Database) -> Platform {
        db.create_platform(&NewPlatform {
            name: "pancake".to_string(),
            description: None,
            base_url: "http://platform.example".to_string(),
            rate_limit_per_minute: 60,
            auth_required: false,
            auth_token: None,
            meta_data: serde_json::json!({}),
        })
        .unwrap()
    }

    fn seed_bot(db: &Database) -> Bot {
        let ai = seed_ai(db);
        let platform = seed_platform(db);
        db.create_bot(&NewBot {
            name: "sales-bot".to_string(),
            description: None,
            language: "vi".to_string(),
            core_ai_id: ai.id,
            platform_id: platform.id,
            meta_data: serde_json::json!({}),
        })
        .unwrap()
    }

    #[test]
    fn test_core_ai_crud() {
        let db = Database::open_in_memory().unwrap();
        let ai = seed_ai(&db);
        assert!(ai.is_active);
        assert_eq!(ai.timeout_seconds, 30);

        let fetched = db.get_core_ai(&ai.id).unwrap();
        assert_eq!(fetched.name, "primary-ai");

        let updated = db
            .update_core_ai(
                &ai.id,
                &CoreAiUpdate {
                    is_active: Some(false),
                    timeout_seconds: Some(10),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(!updated.is_active);
        assert_eq!(updated.timeout_seconds, 10);

        db.delete_core_ai(&ai.id).unwrap();
        assert!(matches!(
            db.get_core_ai(&ai.id),
            Err(DbError::NotFound("CoreAI", _))
        ));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let db = Database::open_in_memory().unwrap();
        seed_ai(&db);
        let err = db
            .create_core_ai(&NewCoreAi {
                name: "primary-ai".to_string(),
                description: None,
                api_endpoint: "http://other".to_string(),
                auth_required: false,
                auth_token: None,
                timeout_seconds: 30,
                meta_data: serde_json::json!({}),
            })
            .unwrap_err();
        assert!(matches!(err, DbError::NameExists(_)));
    }

    #[test]
    fn test_core_ai_delete_refused_while_referenced() {
        let db = Database::open_in_memory().unwrap();
        let bot = seed_bot(&db);
        let err = db.delete_core_ai(&bot.core_ai_id).unwrap_err();
        assert!(matches!(err, DbError::InUse(_)));

        // Deactivating the bot lifts the restriction
        db.update_bot(
            &bot.id,
            &BotUpdate {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .unwrap();
        db.delete_core_ai(&bot.core_ai_id).unwrap();
    }

    #[test]
    fn test_bot_requires_active_references() {
        let db = Database::open_in_memory().unwrap();
        let ai = seed_ai(&db);
        let platform = seed_platform(&db);
        db.update_core_ai(
            &ai.id,
            &CoreAiUpdate {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .unwrap();

        let err = db
            .create_bot(&NewBot {
                name: "b".to_string(),
                description: None,
                language: "vi".to_string(),
                core_ai_id: ai.id,
                platform_id: platform.id,
                meta_data: serde_json::json!({}),
            })
            .unwrap_err();
        assert!(matches!(err, DbError::InactiveReference(_)));
    }

    #[test]
    fn test_bot_delete_refused_while_conversation_references() {
        let db = Database::open_in_memory().unwrap();
        let bot = seed_bot(&db);
        db.get_or_create_conversation("ext-1", Some(&bot.id)).unwrap();

        let err = db.delete_bot(&bot.id).unwrap_err();
        assert!(matches!(err, DbError::InUse(_)));

        db.delete_conversation("ext-1").unwrap();
        db.delete_bot(&bot.id).unwrap();
    }

    #[test]
    fn test_conversation_auto_create_and_messages() {
        let db = Database::open_in_memory().unwrap();
        let conv = db.get_or_create_conversation("ext-42", None).unwrap();
        assert_eq!(conv.conversation_id, "ext-42");
        assert_eq!(conv.status, ConversationStatus::Active);
        assert_eq!(conv.history, "");

        // Idempotent on the external id
        let again = db.get_or_create_conversation("ext-42", None).unwrap();
        assert_eq!(again.id, conv.id);

        db.add_message("ext-42", MessageRole::User, "hi", None).unwrap();
        db.add_message("ext-42", MessageRole::Bot, "hello", None).unwrap();
        let messages = db.get_messages("ext-42").unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);

        let conv = db.get_conversation("ext-42").unwrap();
        assert_eq!(conv.message_count, 2);
    }

    #[test]
    fn test_history_never_rewinds() {
        let db = Database::open_in_memory().unwrap();
        db.get_or_create_conversation("ext-9", None).unwrap();

        assert!(db
            .advance_conversation_history("ext-9", "<USER>a</USER><br>")
            .unwrap());
        assert!(db
            .advance_conversation_history("ext-9", "<USER>a</USER><br><BOT>b</BOT><br>")
            .unwrap());

        // An older, shorter history is refused
        assert!(!db
            .advance_conversation_history("ext-9", "<USER>a</USER><br>")
            .unwrap());
        let conv = db.get_conversation("ext-9").unwrap();
        assert_eq!(conv.history, "<USER>a</USER><br><BOT>b</BOT><br>");
    }
}
