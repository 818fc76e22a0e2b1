//! Read-through cache over the configuration entities
//!
//! The pipeline never sees DB rows or DB errors: lookups return typed
//! snapshot values, falling back to built-in defaults when a record is
//! missing, inactive, or the database is unavailable. Entries expire after
//! five minutes; admin mutations can invalidate explicitly.

use crate::db::Database;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

const CACHE_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_ID: &str = "default";
const DEFAULT_ENDPOINT: &str = "http://localhost:8000";

/// Snapshot of a bot's routing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    pub bot_id: String,
    pub name: String,
    pub language: String,
    pub is_active: bool,
    pub core_ai_id: String,
    pub platform_id: String,
    pub meta_data: serde_json::Value,
}

impl BotConfig {
    pub fn default_config() -> Self {
        Self {
            bot_id: DEFAULT_ID.to_string(),
            name: "Default Bot".to_string(),
            language: "vi".to_string(),
            is_active: true,
            core_ai_id: DEFAULT_ID.to_string(),
            platform_id: DEFAULT_ID.to_string(),
            meta_data: serde_json::json!({}),
        }
    }
}

/// Snapshot of an AI endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    pub id: String,
    pub name: String,
    pub api_endpoint: String,
    pub auth_required: bool,
    pub auth_token: Option<String>,
    pub timeout_seconds: u64,
    pub meta_data: serde_json::Value,
}

impl AiConfig {
    pub fn default_config() -> Self {
        Self {
            id: DEFAULT_ID.to_string(),
            name: "Default AI Service".to_string(),
            api_endpoint: DEFAULT_ENDPOINT.to_string(),
            auth_required: false,
            auth_token: None,
            timeout_seconds: 30,
            meta_data: serde_json::json!({}),
        }
    }
}

/// Snapshot of a platform configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub rate_limit_per_minute: u32,
    pub auth_required: bool,
    pub auth_token: Option<String>,
    pub meta_data: serde_json::Value,
}

impl PlatformConfig {
    pub fn default_config() -> Self {
        Self {
            id: DEFAULT_ID.to_string(),
            name: "Default Platform".to_string(),
            base_url: DEFAULT_ENDPOINT.to_string(),
            rate_limit_per_minute: 60,
            auth_required: false,
            auth_token: None,
            meta_data: serde_json::json!({}),
        }
    }
}

struct Cached<T> {
    value: T,
    loaded_at: Instant,
}

impl<T: Clone> Cached<T> {
    fn fresh(&self, ttl: Duration) -> Option<T> {
        (self.loaded_at.elapsed() < ttl).then(|| self.value.clone())
    }
}

pub struct ConfigStore {
    db: Database,
    ttl: Duration,
    bots: RwLock<HashMap<String, Cached<BotConfig>>>,
    ais: RwLock<HashMap<String, Cached<AiConfig>>>,
    platforms: RwLock<HashMap<String, Cached<PlatformConfig>>>,
}

impl ConfigStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            ttl: CACHE_TTL,
            bots: RwLock::new(HashMap::new()),
            ais: RwLock::new(HashMap::new()),
            platforms: RwLock::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    fn with_ttl(db: Database, ttl: Duration) -> Self {
        Self {
            db,
            ttl,
            bots: RwLock::new(HashMap::new()),
            ais: RwLock::new(HashMap::new()),
            platforms: RwLock::new(HashMap::new()),
        }
    }

    /// Bot configuration for a conversation, or the default when the
    /// conversation, its bot, or the database is unavailable.
    ///
    /// `bot_id` overrides the conversation's stored binding when provided.
    pub fn bot_for_conversation(&self, conversation_id: &str, bot_id: Option<&str>) -> BotConfig {
        let cache_key = bot_id.unwrap_or(conversation_id).to_string();
        if let Some(hit) = self
            .bots
            .read()
            .unwrap()
            .get(&cache_key)
            .and_then(|c| c.fresh(self.ttl))
        {
            return hit;
        }

        let loaded = self.load_bot(conversation_id, bot_id);
        self.bots.write().unwrap().insert(
            cache_key,
            Cached {
                value: loaded.clone(),
                loaded_at: Instant::now(),
            },
        );
        loaded
    }

    fn load_bot(&self, conversation_id: &str, bot_id: Option<&str>) -> BotConfig {
        let bot = match bot_id {
            Some(id) => self.db.get_bot(id),
            None => match self.db.get_conversation(conversation_id) {
                Ok(conv) => match conv.bot_id {
                    Some(id) => self.db.get_bot(&id),
                    None => return self.first_active_bot_or_default(),
                },
                Err(_) => return self.first_active_bot_or_default(),
            },
        };

        match bot {
            Ok(bot) => BotConfig {
                bot_id: bot.id,
                name: bot.name,
                language: bot.language,
                is_active: bot.is_active,
                core_ai_id: bot.core_ai_id,
                platform_id: bot.platform_id,
                meta_data: bot.meta_data,
            },
            Err(e) => {
                tracing::warn!(conversation_id, error = %e, "Bot lookup failed, using default");
                BotConfig::default_config()
            }
        }
    }

    fn first_active_bot_or_default(&self) -> BotConfig {
        match self.db.first_active_bot() {
            Ok(Some(bot)) => BotConfig {
                bot_id: bot.id,
                name: bot.name,
                language: bot.language,
                is_active: bot.is_active,
                core_ai_id: bot.core_ai_id,
                platform_id: bot.platform_id,
                meta_data: bot.meta_data,
            },
            _ => BotConfig::default_config(),
        }
    }

    /// AI configuration by id; inactive or unknown records fall back to the
    /// default endpoint.
    pub fn core_ai(&self, core_ai_id: &str) -> AiConfig {
        if let Some(hit) = self
            .ais
            .read()
            .unwrap()
            .get(core_ai_id)
            .and_then(|c| c.fresh(self.ttl))
        {
            return hit;
        }

        let loaded = self.load_core_ai(core_ai_id);
        self.ais.write().unwrap().insert(
            core_ai_id.to_string(),
            Cached {
                value: loaded.clone(),
                loaded_at: Instant::now(),
            },
        );
        loaded
    }

    fn load_core_ai(&self, core_ai_id: &str) -> AiConfig {
        let row = if core_ai_id == DEFAULT_ID || core_ai_id.is_empty() {
            self.db.first_active_core_ai().ok().flatten()
        } else {
            match self.db.get_core_ai(core_ai_id) {
                Ok(ai) => Some(ai),
                Err(e) => {
                    tracing::warn!(core_ai_id, error = %e, "CoreAI lookup failed, using default");
                    None
                }
            }
        };

        match row {
            Some(ai) if ai.is_active => AiConfig {
                id: ai.id,
                name: ai.name,
                api_endpoint: ai.api_endpoint,
                auth_required: ai.auth_required,
                auth_token: ai.auth_token,
                timeout_seconds: ai.timeout_seconds.max(1),
                meta_data: ai.meta_data,
            },
            Some(ai) => {
                tracing::warn!(core_ai_id = %ai.id, "CoreAI is inactive, using default");
                AiConfig::default_config()
            }
            None => AiConfig::default_config(),
        }
    }

    /// Platform configuration by id; inactive or unknown records fall back
    /// to the default.
    pub fn platform(&self, platform_id: &str) -> PlatformConfig {
        if let Some(hit) = self
            .platforms
            .read()
            .unwrap()
            .get(platform_id)
            .and_then(|c| c.fresh(self.ttl))
        {
            return hit;
        }

        let loaded = self.load_platform(platform_id);
        self.platforms.write().unwrap().insert(
            platform_id.to_string(),
            Cached {
                value: loaded.clone(),
                loaded_at: Instant::now(),
            },
        );
        loaded
    }

    fn load_platform(&self, platform_id: &str) -> PlatformConfig {
        let row = if platform_id == DEFAULT_ID || platform_id.is_empty() {
            self.db.first_active_platform().ok().flatten()
        } else {
            match self.db.get_platform(platform_id) {
                Ok(p) => Some(p),
                Err(e) => {
                    tracing::warn!(platform_id, error = %e, "Platform lookup failed, using default");
                    None
                }
            }
        };

        match row {
            Some(p) if p.is_active => PlatformConfig {
                id: p.id,
                name: p.name,
                base_url: p.base_url,
                rate_limit_per_minute: p.rate_limit_per_minute.max(1),
                auth_required: p.auth_required,
                auth_token: p.auth_token,
                meta_data: p.meta_data,
            },
            Some(p) => {
                tracing::warn!(platform_id = %p.id, "Platform is inactive, using default");
                PlatformConfig::default_config()
            }
            None => PlatformConfig::default_config(),
        }
    }

    /// Drop all cached entries. Called after admin mutations.
    pub fn clear_cache(&self) {
        self.bots.write().unwrap().clear();
        self.ais.write().unwrap().clear();
        self.platforms.write().unwrap().clear();
        tracing::info!("Configuration cache cleared");
    }
}
