//! Database schema and entity types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// SQL schema for initialization
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS core_ai (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    description TEXT,
    api_endpoint TEXT NOT NULL,
    auth_required BOOLEAN NOT NULL DEFAULT 0,
    auth_token TEXT,
    timeout_seconds INTEGER NOT NULL DEFAULT 30,
    is_active BOOLEAN NOT NULL DEFAULT 1,
    meta_data TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS platforms (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    description TEXT,
    base_url TEXT NOT NULL,
    rate_limit_per_minute INTEGER NOT NULL DEFAULT 60,
    auth_required BOOLEAN NOT NULL DEFAULT 0,
    auth_token TEXT,
    is_active BOOLEAN NOT NULL DEFAULT 1,
    meta_data TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS platform_actions (
    id TEXT PRIMARY KEY,
    platform_id TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT,
    method TEXT NOT NULL,
    path TEXT NOT NULL,
    is_active BOOLEAN NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,

    FOREIGN KEY (platform_id) REFERENCES platforms(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_platform_actions_platform
    ON platform_actions(platform_id);

CREATE TABLE IF NOT EXISTS bots (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    description TEXT,
    language TEXT NOT NULL DEFAULT 'vi',
    core_ai_id TEXT NOT NULL,
    platform_id TEXT NOT NULL,
    is_active BOOLEAN NOT NULL DEFAULT 1,
    meta_data TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,

    FOREIGN KEY (core_ai_id) REFERENCES core_ai(id),
    FOREIGN KEY (platform_id) REFERENCES platforms(id)
);

CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL UNIQUE,
    bot_id TEXT,
    status TEXT NOT NULL DEFAULT 'active',
    context TEXT NOT NULL DEFAULT '{}',
    history TEXT NOT NULL DEFAULT '',
    message_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,

    FOREIGN KEY (bot_id) REFERENCES bots(id)
);

CREATE INDEX IF NOT EXISTS idx_conversations_external
    ON conversations(conversation_id);
CREATE INDEX IF NOT EXISTS idx_conversations_bot ON conversations(bot_id);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    content_type TEXT NOT NULL DEFAULT 'text/plain',
    created_at TEXT NOT NULL,

    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id);
"#;

/// AI endpoint configuration record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreAi {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub api_endpoint: String,
    pub auth_required: bool,
    pub auth_token: Option<String>,
    pub timeout_seconds: u64,
    pub is_active: bool,
    pub meta_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Messaging platform record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Platform {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub base_url: String,
    pub rate_limit_per_minute: u32,
    pub auth_required: bool,
    pub auth_token: Option<String>,
    pub is_active: bool,
    pub meta_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Endpoint exposed by a platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformAction {
    pub id: String,
    pub platform_id: String,
    pub name: String,
    pub description: Option<String>,
    pub method: HttpMethod,
    pub path: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// HTTP method for a platform action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Self::Get),
            "POST" => Some(Self::Post),
            "PUT" => Some(Self::Put),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Post => write!(f, "POST"),
            Self::Put => write!(f, "PUT"),
            Self::Delete => write!(f, "DELETE"),
        }
    }
}

/// Bot record binding a CoreAI to a Platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bot {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub language: String,
    pub core_ai_id: String,
    pub platform_id: String,
    pub is_active: bool,
    pub meta_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Conversation record
///
/// `conversation_id` is the external, platform-scoped identifier; `id` is
/// this service's own primary key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub conversation_id: String,
    pub bot_id: Option<String>,
    pub status: ConversationStatus,
    pub context: serde_json::Value,
    /// The last fully-processed history string. Advances monotonically.
    pub history: String,
    pub message_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Conversation lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    Ended,
    Paused,
    Transferred,
}

impl ConversationStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "ended" => Some(Self::Ended),
            "paused" => Some(Self::Paused),
            "transferred" => Some(Self::Transferred),
            _ => None,
        }
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Ended => write!(f, "ended"),
            Self::Paused => write!(f, "paused"),
            Self::Transferred => write!(f, "transferred"),
        }
    }
}

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Bot,
    Sale,
}

impl MessageRole {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "bot" => Some(Self::Bot),
            "sale" => Some(Self::Sale),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Bot => "bot",
            Self::Sale => "sale",
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored conversation message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    pub content_type: String,
    pub created_at: DateTime<Utc>,
}
