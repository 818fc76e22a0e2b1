//! Per-conversation message locks
//!
//! A lock admits at most one in-flight AI job per conversation. A new
//! arrival while a lock exists does not wait: it supersedes the current job,
//! inheriting the lock and recording the old job id so the caller can cancel
//! it. Acquisition is an atomic set-if-absent against the shared store, so
//! two racing arrivals resolve to exactly one acquire and one supersession.

use crate::store::{lock_key, SharedStore, LOCK_KEY_PREFIX};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Locks self-heal after an hour if a crash leaks one.
pub const LOCK_TTL: Duration = Duration::from_secs(3600);

/// Lock state held in the shared store under `msg_lock:{conversation_id}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub conversation_id: String,
    pub lock_id: String,
    pub history_hash: String,
    pub created_at: f64,
    pub updated_at: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_ai_job_id: Option<String>,
    pub consolidated_count: u32,
}

/// Outcome of `check_and_acquire`
#[derive(Debug, Clone)]
pub enum LockDecision {
    /// No lock existed; this arrival owns a fresh one.
    Acquired {
        lock_id: String,
        /// Set when the conditional write stayed contested and the lock was
        /// taken unconditionally to guarantee forward progress.
        fallback: bool,
    },
    /// A lock existed; this arrival took it over from the previous job.
    Superseded {
        lock_id: String,
        previous_job_id: Option<String>,
        consolidated_count: u32,
    },
}

impl LockDecision {
    pub fn lock_id(&self) -> &str {
        match self {
            Self::Acquired { lock_id, .. } | Self::Superseded { lock_id, .. } => lock_id,
        }
    }

    /// Arrivals absorbed by this lock, including this one.
    pub fn consolidated_count(&self) -> u32 {
        match self {
            Self::Acquired { .. } => 1,
            Self::Superseded {
                consolidated_count, ..
            } => *consolidated_count,
        }
    }

    pub fn is_superseded(&self) -> bool {
        matches!(self, Self::Superseded { .. })
    }
}

#[derive(Clone)]
pub struct LockManager {
    store: SharedStore,
}

impl LockManager {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Acquire the conversation's lock or supersede its current holder.
    pub async fn check_and_acquire(&self, conversation_id: &str, history: &str) -> LockDecision {
        let key = lock_key(conversation_id);

        if let Some(existing) = self.read(&key).await {
            return self.supersede(&key, existing, history).await;
        }

        let record = LockRecord {
            conversation_id: conversation_id.to_string(),
            lock_id: uuid::Uuid::new_v4().to_string(),
            history_hash: history_hash(history),
            created_at: now_unix(),
            updated_at: now_unix(),
            ai_job_id: None,
            previous_ai_job_id: None,
            consolidated_count: 1,
        };
        let serialized = serde_json::to_string(&record).unwrap();

        if self.store.set_nx_ex(&key, &serialized, LOCK_TTL).await {
            return LockDecision::Acquired {
                lock_id: record.lock_id,
                fallback: false,
            };
        }

        // Lost the race. The winner's record should be visible now.
        if let Some(existing) = self.read(&key).await {
            return self.supersede(&key, existing, history).await;
        }

        // Still contested (winner released within the window, or the store is
        // flapping). Take the lock unconditionally so the message is not
        // dropped; a later arrival supersedes as usual.
        tracing::warn!(
            conversation_id,
            lock_id = %record.lock_id,
            "Contested lock acquire, proceeding with fallback lock"
        );
        self.store.set_ex(&key, &serialized, LOCK_TTL).await;
        LockDecision::Acquired {
            lock_id: record.lock_id,
            fallback: true,
        }
    }

    async fn supersede(&self, key: &str, existing: LockRecord, history: &str) -> LockDecision {
        let previous_job_id = existing.ai_job_id.clone();
        let updated = LockRecord {
            conversation_id: existing.conversation_id,
            lock_id: existing.lock_id.clone(),
            history_hash: history_hash(history),
            created_at: existing.created_at,
            updated_at: now_unix(),
            ai_job_id: None,
            previous_ai_job_id: previous_job_id.clone(),
            consolidated_count: existing.consolidated_count + 1,
        };

        tracing::info!(
            conversation_id = %updated.conversation_id,
            lock_id = %updated.lock_id,
            previous_job_id = ?previous_job_id,
            consolidated_count = updated.consolidated_count,
            "Existing lock found, superseding current job"
        );

        let serialized = serde_json::to_string(&updated).unwrap();
        self.store.set_ex(key, &serialized, LOCK_TTL).await;

        LockDecision::Superseded {
            lock_id: updated.lock_id,
            previous_job_id,
            consolidated_count: updated.consolidated_count,
        }
    }

    /// Record the job currently attached to the lock. Idempotent.
    pub async fn attach_job(&self, conversation_id: &str, job_id: &str) {
        let key = lock_key(conversation_id);
        let Some(mut record) = self.read(&key).await else {
            tracing::warn!(conversation_id, job_id, "No lock to attach job to");
            return;
        };
        record.ai_job_id = Some(job_id.to_string());
        record.updated_at = now_unix();
        let serialized = serde_json::to_string(&record).unwrap();
        self.store.set_ex(&key, &serialized, LOCK_TTL).await;
    }

    /// Delete the lock unconditionally. Returns whether one existed.
    pub async fn release(&self, conversation_id: &str) -> bool {
        self.store.delete(&lock_key(conversation_id)).await
    }

    pub async fn get_info(&self, conversation_id: &str) -> Option<LockRecord> {
        self.read(&lock_key(conversation_id)).await
    }

    /// Delete locks older than `max_age`. Unparseable records are deleted
    /// too. Returns the number removed.
    pub async fn cleanup_stale(&self, max_age: Duration) -> usize {
        let cutoff = now_unix() - max_age.as_secs_f64();
        let mut removed = 0;
        for key in self.store.keys(LOCK_KEY_PREFIX).await {
            let stale = match self.read(&key).await {
                Some(record) => record.created_at < cutoff,
                None => self.store.get(&key).await.is_some(),
            };
            if stale && self.store.delete(&key).await {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "Cleaned up stale locks");
        }
        removed
    }

    async fn read(&self, key: &str) -> Option<LockRecord> {
        let raw = self.store.get(key).await?;
        match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(key, error = %e, "Invalid lock record in store");
                None
            }
        }
    }
}

fn history_hash(history: &str) -> String {
    format!("{:x}", Sha256::digest(history.as_bytes()))
}

fn now_unix() -> f64 {
    crate::history::now_unix()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> LockManager {
        LockManager::new(SharedStore::in_memory())
    }

    #[tokio::test]
    async fn test_fresh_acquire() {
        let locks = manager();
        let decision = locks.check_and_acquire("c1", "<USER>hi</USER><br>").await;

        let LockDecision::Acquired { lock_id, fallback } = decision else {
            panic!("expected Acquired");
        };
        assert!(!fallback);

        let record = locks.get_info("c1").await.unwrap();
        assert_eq!(record.lock_id, lock_id);
        assert_eq!(record.consolidated_count, 1);
        assert!(record.ai_job_id.is_none());
    }

    #[tokio::test]
    async fn test_supersession_carries_previous_job() {
        let locks = manager();
        let first = locks.check_and_acquire("c2", "<USER>a</USER><br>").await;
        locks.attach_job("c2", "job-1").await;

        let second = locks
            .check_and_acquire("c2", "<USER>a</USER><br><USER>b</USER><br>")
            .await;
        let LockDecision::Superseded {
            lock_id,
            previous_job_id,
            consolidated_count,
        } = second
        else {
            panic!("expected Superseded");
        };

        // Lock identity survives supersession
        assert_eq!(lock_id, first.lock_id());
        assert_eq!(previous_job_id.as_deref(), Some("job-1"));
        assert_eq!(consolidated_count, 2);

        // The superseded job is detached until the new one attaches
        let record = locks.get_info("c2").await.unwrap();
        assert!(record.ai_job_id.is_none());
        assert_eq!(record.previous_ai_job_id.as_deref(), Some("job-1"));
    }

    #[tokio::test]
    async fn test_consolidated_count_accumulates() {
        let locks = manager();
        locks.check_and_acquire("c3", "a").await;
        locks.check_and_acquire("c3", "ab").await;
        let third = locks.check_and_acquire("c3", "abc").await;
        assert_eq!(third.consolidated_count(), 3);
    }

    #[tokio::test]
    async fn test_attach_job_is_idempotent() {
        let locks = manager();
        locks.check_and_acquire("c4", "h").await;
        locks.attach_job("c4", "job-9").await;
        locks.attach_job("c4", "job-9").await;

        let record = locks.get_info("c4").await.unwrap();
        assert_eq!(record.ai_job_id.as_deref(), Some("job-9"));
        assert_eq!(record.consolidated_count, 1);
    }

    #[tokio::test]
    async fn test_release_then_reacquire() {
        let locks = manager();
        locks.check_and_acquire("c5", "h").await;
        assert!(locks.release("c5").await);
        assert!(!locks.release("c5").await);

        let decision = locks.check_and_acquire("c5", "h2").await;
        assert!(!decision.is_superseded());
    }

    #[tokio::test]
    async fn test_cleanup_stale_removes_only_old_locks() {
        let store = SharedStore::in_memory();
        let locks = LockManager::new(store.clone());

        locks.check_and_acquire("fresh", "h").await;

        let old = LockRecord {
            conversation_id: "old".to_string(),
            lock_id: "old-lock".to_string(),
            history_hash: String::new(),
            created_at: now_unix() - 7200.0,
            updated_at: now_unix() - 7200.0,
            ai_job_id: None,
            previous_ai_job_id: None,
            consolidated_count: 1,
        };
        store
            .set_ex(
                &lock_key("old"),
                &serde_json::to_string(&old).unwrap(),
                LOCK_TTL,
            )
            .await;

        let removed = locks.cleanup_stale(Duration::from_secs(3600)).await;
        assert_eq!(removed, 1);
        assert!(locks.get_info("old").await.is_none());
        assert!(locks.get_info("fresh").await.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_acquires_resolve_to_one_owner() {
        let locks = manager();
        let l1 = locks.clone();
        let l2 = locks.clone();

        let (a, b) = tokio::join!(
            l1.check_and_acquire("race", "h"),
            l2.check_and_acquire("race", "h"),
        );

        // Exactly one of the two may be a fresh acquire
        let acquired = [&a, &b]
            .iter()
            .filter(|d| !d.is_superseded())
            .count();
        assert!(acquired >= 1, "at least one side must make progress");
        let record = locks.get_info("race").await.unwrap();
        assert!(record.consolidated_count >= 1);
    }
}
