//! Shared key-value store for locks, jobs, and the processed-history cache
//!
//! Two backends implement the same interface: a Redis-backed one for
//! cross-instance coordination and a process-local in-memory one. The
//! composite `SharedStore` prefers the distributed backend and degrades to
//! the in-memory one when it is unreachable, so callers always get a
//! well-formed answer.

mod memory;
mod redis_backend;

pub use memory::MemoryStore;
pub use redis_backend::RedisStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// TTL of the processed-history cache entries.
pub const HISTORY_TTL: Duration = Duration::from_secs(3600);

pub const LOCK_KEY_PREFIX: &str = "msg_lock:";
pub const JOB_KEY_PREFIX: &str = "ai_job:";
pub const HISTORY_KEY_PREFIX: &str = "processed_history:";

pub fn lock_key(conversation_id: &str) -> String {
    format!("{LOCK_KEY_PREFIX}{conversation_id}")
}

pub fn job_key(job_id: &str) -> String {
    format!("{JOB_KEY_PREFIX}{job_id}")
}

pub fn history_key(conversation_id: &str) -> String {
    format!("{HISTORY_KEY_PREFIX}{conversation_id}")
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store error: {0}")]
    Redis(#[from] redis::RedisError),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Key-value operations the coalescing pipeline relies on.
///
/// The semantics mirror Redis: values expire after their TTL, and
/// `set_nx_ex` is an atomic set-if-absent.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Atomic set-if-absent. Returns true when the key was written.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Returns true when the key existed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// All live keys starting with `prefix`.
    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>>;
}

/// Composite store preferring the distributed backend.
///
/// Every operation that fails against Redis falls back to the in-memory map
/// and flips the degraded flag. Within one process the fallback preserves
/// lock semantics; across instances it does not, which is why the
/// degradation is logged loudly.
#[derive(Clone)]
pub struct SharedStore {
    primary: Option<RedisStore>,
    fallback: MemoryStore,
    degraded: Arc<AtomicBool>,
}

impl SharedStore {
    pub fn new(primary: Option<RedisStore>) -> Self {
        Self {
            primary,
            fallback: MemoryStore::new(),
            degraded: Arc::new(AtomicBool::new(false)),
        }
    }

    /// In-memory only; used in tests and when no Redis URL is configured.
    pub fn in_memory() -> Self {
        Self::new(None)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn has_distributed_backend(&self) -> bool {
        self.primary.is_some()
    }

    fn note_fallback(&self, op: &'static str, err: &StoreError) {
        if !self.degraded.swap(true, Ordering::Relaxed) {
            tracing::warn!(op, error = %err, "Shared store unreachable, using in-memory fallback");
        }
    }

    fn note_recovered(&self) {
        if self.degraded.swap(false, Ordering::Relaxed) {
            tracing::info!("Shared store reachable again");
        }
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        if let Some(primary) = &self.primary {
            match primary.get(key).await {
                Ok(value) => {
                    self.note_recovered();
                    return value;
                }
                Err(e) => self.note_fallback("get", &e),
            }
        }
        self.fallback.get(key).await.ok().flatten()
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl: Duration) {
        if let Some(primary) = &self.primary {
            match primary.set_ex(key, value, ttl).await {
                Ok(()) => {
                    self.note_recovered();
                    return;
                }
                Err(e) => self.note_fallback("set_ex", &e),
            }
        }
        let _ = self.fallback.set_ex(key, value, ttl).await;
    }

    pub async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> bool {
        if let Some(primary) = &self.primary {
            match primary.set_nx_ex(key, value, ttl).await {
                Ok(written) => {
                    self.note_recovered();
                    return written;
                }
                Err(e) => self.note_fallback("set_nx_ex", &e),
            }
        }
        self.fallback
            .set_nx_ex(key, value, ttl)
            .await
            .unwrap_or(true)
    }

    pub async fn delete(&self, key: &str) -> bool {
        if let Some(primary) = &self.primary {
            match primary.delete(key).await {
                Ok(existed) => {
                    self.note_recovered();
                    return existed;
                }
                Err(e) => self.note_fallback("delete", &e),
            }
        }
        self.fallback.delete(key).await.unwrap_or(false)
    }

    pub async fn keys(&self, prefix: &str) -> Vec<String> {
        if let Some(primary) = &self.primary {
            match primary.keys(prefix).await {
                Ok(keys) => {
                    self.note_recovered();
                    return keys;
                }
                Err(e) => self.note_fallback("keys", &e),
            }
        }
        self.fallback.keys(prefix).await.unwrap_or_default()
    }

    // ==================== Processed-History Cache ====================

    /// Last fully-processed history for a conversation, if cached.
    pub async fn get_processed_history(&self, conversation_id: &str) -> Option<String> {
        let raw = self.get(&history_key(conversation_id)).await?;
        let entry: ProcessedHistory = serde_json::from_str(&raw).ok()?;
        Some(entry.history)
    }

    /// Cache `history` as processed, unless the cached value already extends
    /// it. The guard keeps the cache monotonic when a slow writer lands
    /// after a newer arrival.
    pub async fn advance_processed_history(&self, conversation_id: &str, history: &str) -> bool {
        if let Some(current) = self.get_processed_history(conversation_id).await {
            if !history.contains(current.as_str()) {
                tracing::debug!(
                    conversation_id,
                    "Skipping processed-history write that would rewind the cache"
                );
                return false;
            }
        }

        let entry = ProcessedHistory {
            history: history.to_string(),
            processed_at: crate::history::now_unix(),
            conversation_id: conversation_id.to_string(),
        };
        let serialized = serde_json::to_string(&entry).unwrap();
        self.set_ex(&history_key(conversation_id), &serialized, HISTORY_TTL)
            .await;
        true
    }
}

/// Cache entry under `processed_history:{conversation_id}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedHistory {
    pub history: String,
    pub processed_at: f64,
    pub conversation_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_store_round_trip() {
        let store = SharedStore::in_memory();
        store
            .set_ex("msg_lock:c1", "{}", Duration::from_secs(10))
            .await;
        assert_eq!(store.get("msg_lock:c1").await.as_deref(), Some("{}"));
        assert!(store.delete("msg_lock:c1").await);
        assert!(store.get("msg_lock:c1").await.is_none());
        assert!(!store.delete("msg_lock:c1").await);
    }

    #[tokio::test]
    async fn test_set_nx_is_exclusive() {
        let store = SharedStore::in_memory();
        assert!(
            store
                .set_nx_ex("k", "first", Duration::from_secs(10))
                .await
        );
        assert!(
            !store
                .set_nx_ex("k", "second", Duration::from_secs(10))
                .await
        );
        assert_eq!(store.get("k").await.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_processed_history_is_monotonic() {
        let store = SharedStore::in_memory();
        assert!(store.advance_processed_history("c1", "<USER>a</USER><br>").await);
        assert!(
            store
                .advance_processed_history("c1", "<USER>a</USER><br><BOT>b</BOT><br>")
                .await
        );

        // A shorter, older history cannot rewind the cache
        assert!(!store.advance_processed_history("c1", "<USER>a</USER><br>").await);
        assert_eq!(
            store.get_processed_history("c1").await.as_deref(),
            Some("<USER>a</USER><br><BOT>b</BOT><br>")
        );
    }

    #[tokio::test]
    async fn test_keys_by_prefix() {
        let store = SharedStore::in_memory();
        store.set_ex("msg_lock:a", "1", Duration::from_secs(10)).await;
        store.set_ex("msg_lock:b", "2", Duration::from_secs(10)).await;
        store.set_ex("ai_job:x", "3", Duration::from_secs(10)).await;

        let mut keys = store.keys(LOCK_KEY_PREFIX).await;
        keys.sort();
        assert_eq!(keys, vec!["msg_lock:a", "msg_lock:b"]);
    }
}
