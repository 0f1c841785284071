//! Session persistence seam.
//!
//! Session records are owned by the host application's session layer; this
//! subsystem reads and mutates them through the [`SessionStore`] trait. The
//! in-memory implementation is the default backing and the test double;
//! durable stores are injected by the host.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;

pub type StoreResult<T> = Result<T, Box<dyn StdError + Send + Sync>>;

/// One tracked session and its device snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: String,
    pub device_fingerprint: Option<String>,
    pub user_agent: String,
    pub ip: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub failed_validations: u32,
}

impl SessionRecord {
    pub fn new(
        session_id: &str,
        user_id: &str,
        ip: &str,
        user_agent: &str,
        device_fingerprint: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            device_fingerprint,
            user_agent: user_agent.to_string(),
            ip: ip.to_string(),
            created_at: now,
            last_activity: now,
            failed_validations: 0,
        }
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, record: &SessionRecord) -> StoreResult<()>;
    async fn get(&self, session_id: &str) -> StoreResult<Option<SessionRecord>>;
    async fn update(&self, record: &SessionRecord) -> StoreResult<()>;
    async fn delete(&self, session_id: &str) -> StoreResult<()>;
    async fn user_sessions(&self, user_id: &str) -> StoreResult<Vec<SessionRecord>>;
}

/// Process-local store: primary for single-instance deployments, fallback
/// and test double everywhere else.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<String, SessionRecord>,
    user_index: DashMap<String, Vec<String>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, record: &SessionRecord) -> StoreResult<()> {
        self.sessions
            .insert(record.session_id.clone(), record.clone());
        self.user_index
            .entry(record.user_id.clone())
            .or_default()
            .push(record.session_id.clone());
        Ok(())
    }

    async fn get(&self, session_id: &str) -> StoreResult<Option<SessionRecord>> {
        Ok(self.sessions.get(session_id).map(|e| e.value().clone()))
    }

    async fn update(&self, record: &SessionRecord) -> StoreResult<()> {
        self.sessions
            .insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> StoreResult<()> {
        if let Some((_, record)) = self.sessions.remove(session_id) {
            if let Some(mut ids) = self.user_index.get_mut(&record.user_id) {
                ids.retain(|id| id != session_id);
                let now_empty = ids.is_empty();
                drop(ids);
                if now_empty {
                    self.user_index
                        .remove_if(&record.user_id, |_, ids| ids.is_empty());
                }
            }
        }
        Ok(())
    }

    async fn user_sessions(&self, user_id: &str) -> StoreResult<Vec<SessionRecord>> {
        let ids = match self.user_index.get(user_id) {
            Some(ids) => ids.value().clone(),
            None => return Ok(Vec::new()),
        };
        Ok(ids
            .iter()
            .filter_map(|id| self.sessions.get(id).map(|e| e.value().clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(sid: &str, uid: &str) -> SessionRecord {
        SessionRecord::new(sid, uid, "10.0.0.1", "Mozilla/5.0", None)
    }

    #[tokio::test]
    async fn test_create_get_delete() {
        let store = InMemorySessionStore::new();
        store.create(&record("s1", "alice")).await.unwrap();

        let found = store.get("s1").await.unwrap().unwrap();
        assert_eq!(found.user_id, "alice");
        assert_eq!(found.failed_validations, 0);

        store.delete("s1").await.unwrap();
        assert!(store.get("s1").await.unwrap().is_none());
        assert!(store.user_sessions("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_user_index_tracks_multiple_sessions() {
        let store = InMemorySessionStore::new();
        store.create(&record("s1", "bob")).await.unwrap();
        store.create(&record("s2", "bob")).await.unwrap();
        store.create(&record("s3", "carol")).await.unwrap();

        assert_eq!(store.user_sessions("bob").await.unwrap().len(), 2);
        assert_eq!(store.user_sessions("carol").await.unwrap().len(), 1);

        store.delete("s2").await.unwrap();
        assert_eq!(store.user_sessions("bob").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_missing_session_is_noop() {
        let store = InMemorySessionStore::new();
        store.delete("missing").await.unwrap();
        assert!(store.is_empty());
    }
}
