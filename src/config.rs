//! Environment-driven configuration
//!
//! All keys are optional; anything unset falls back to a default that works
//! for local development. Unknown environment variables are ignored.

/// Application settings loaded once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub api_host: String,
    pub api_port: u16,
    /// Path to the SQLite database file.
    pub database_path: String,
    /// Redis connection URL; `None` runs the shared store in-memory only.
    pub redis_url: Option<String>,
    /// Bearer token required on admin endpoints. Empty disables the check.
    pub admin_access_token: String,
    /// Bearer token required on the chat endpoint. Empty disables the check.
    pub platform_access_token: String,
    #[allow(dead_code)] // Recognized key, legacy conversation-state cache
    pub conversation_state_ttl_secs: u64,
    /// Parsed for compatibility with existing deployments. The message lock
    /// uses its own fixed 3600s TTL and does not read this value.
    #[allow(dead_code)]
    pub processing_lock_ttl_secs: u64,
    pub max_conversation_age_hours: u64,
    #[allow(dead_code)] // Per-endpoint timeouts come from CoreAI config
    pub ai_processing_timeout_secs: u64,
    #[allow(dead_code)] // SQLite needs no pool; kept for env compatibility
    pub db_pool_size: u32,
    #[allow(dead_code)] // SQLite needs no pool; kept for env compatibility
    pub db_max_overflow: u32,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            api_host: env_or("API_HOST", "0.0.0.0"),
            api_port: env_parse("API_PORT", 8000),
            database_path: std::env::var("DATABASE_URL").unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                format!("{home}/.chat-orchestrator/orchestrator.db")
            }),
            redis_url: redis_url_from_env(),
            admin_access_token: env_or("ADMIN_ACCESS_TOKEN", ""),
            platform_access_token: env_or("PLATFORM_ACCESS_TOKEN", ""),
            conversation_state_ttl_secs: env_parse("CONVERSATION_STATE_TTL", 86_400),
            processing_lock_ttl_secs: env_parse("PROCESSING_LOCK_TTL", 30),
            max_conversation_age_hours: env_parse("MAX_CONVERSATION_AGE_HOURS", 24),
            ai_processing_timeout_secs: env_parse("AI_PROCESSING_TIMEOUT", 30),
            db_pool_size: env_parse("DB_POOL_SIZE", 5),
            db_max_overflow: env_parse("DB_MAX_OVERFLOW", 10),
        }
    }
}

/// Build a Redis URL from `REDIS_URL` or the individual component variables.
///
/// Returns `None` when neither form is present, which puts the shared store
/// into in-memory fallback mode.
fn redis_url_from_env() -> Option<String> {
    if let Ok(url) = std::env::var("REDIS_URL") {
        if !url.is_empty() {
            return Some(url);
        }
    }

    let host = std::env::var("REDIS_HOST").ok()?;
    let port: u16 = std::env::var("REDIS_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(6379);
    let db: u32 = std::env::var("REDIS_DB")
        .ok()
        .and_then(|d| d.parse().ok())
        .unwrap_or(0);

    match std::env::var("REDIS_PASSWORD") {
        Ok(password) if !password.is_empty() => {
            Some(format!("redis://:{password}@{host}:{port}/{db}"))
        }
        _ => Some(format!("redis://{host}:{port}/{db}")),
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
