//! Process-local store backend

use super::{StoreBackend, StoreResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

struct Entry {
    value: String,
    expires_at: Instant,
}

/// In-memory backend with lazy expiry.
///
/// Expired entries are dropped on access rather than by a sweeper; the
/// handful of keys a single process holds does not justify one.
#[derive(Clone)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreBackend for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut entries = self.entries.lock().await;
        let live = entries
            .get(key)
            .is_some_and(|e| e.expires_at > Instant::now());
        if live {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut entries = self.entries.lock().await;
        let existed = entries
            .remove(key)
            .is_some_and(|e| e.expires_at > Instant::now());
        Ok(existed)
    }

    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        entries.retain(|_, e| e.expires_at > now);
        Ok(entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_expiry() {
        let store = MemoryStore::new();
        store
            .set_ex("k", "v", Duration::from_millis(10))
            .await
            .unwrap();
        assert!(store.get("k").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(store.get("k").await.unwrap().is_none());

        // Expired key no longer blocks NX
        assert!(store
            .set_nx_ex("k", "v2", Duration::from_secs(5))
            .await
            .unwrap());
    }
}
