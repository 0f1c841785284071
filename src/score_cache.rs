//! Optional read-through cache for security scores.
//!
//! Best-effort by contract: a miss or a failing cache backend falls back to
//! the local metrics store, never to denying a request.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};

#[async_trait]
pub trait ScoreCache: Send + Sync {
    async fn get(&self, user_id: &str) -> Option<u8>;
    async fn set(&self, user_id: &str, score: u8, ttl: Duration);
    async fn invalidate(&self, user_id: &str);
}

/// Process-local cache with per-entry TTL.
#[derive(Debug, Default)]
pub struct InMemoryScoreCache {
    entries: DashMap<String, (u8, Instant)>,
}

impl InMemoryScoreCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScoreCache for InMemoryScoreCache {
    async fn get(&self, user_id: &str) -> Option<u8> {
        match self.entries.get(user_id) {
            Some(entry) => {
                let (score, expires_at) = *entry.value();
                if Instant::now() < expires_at {
                    Some(score)
                } else {
                    drop(entry);
                    self.entries.remove(user_id);
                    None
                }
            }
            None => None,
        }
    }

    async fn set(&self, user_id: &str, score: u8, ttl: Duration) {
        self.entries
            .insert(user_id.to_string(), (score, Instant::now() + ttl));
    }

    async fn invalidate(&self, user_id: &str) {
        self.entries.remove(user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_invalidate() {
        let cache = InMemoryScoreCache::new();
        cache.set("alice", 85, Duration::from_secs(60)).await;
        assert_eq!(cache.get("alice").await, Some(85));

        cache.invalidate("alice").await;
        assert_eq!(cache.get("alice").await, None);
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let cache = InMemoryScoreCache::new();
        cache.set("bob", 40, Duration::from_millis(1)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cache.get("bob").await, None);
    }
}
