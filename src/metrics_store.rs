//! Per-entity security metrics: one mutable record per user, independent
//! per-IP failure counters, and the IP blocklist.
//!
//! All state lives in sharded concurrent maps so tracking operations are
//! linearizable per entity without a global lock. Entries are created
//! lazily on the first tracked event and survive until an administrative
//! clear; only failure counters are subject to the periodic reset sweep.

use crate::config::FailureResetScope;
use crate::scoring::SecurityScore;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use std::collections::HashSet;
use std::net::IpAddr;
use tracing::debug;

/// Mutable security counters for a single user.
#[derive(Debug, Clone, Serialize)]
pub struct UserSecurityMetrics {
    pub user_id: String,
    pub failed_login_attempts: u32,
    pub failed_two_factor_attempts: u32,
    pub session_anomalies: u32,
    pub rate_limit_exceeded: u32,
    pub api_error_count: u64,
    pub api_call_count: u64,
    pub unique_ips: HashSet<String>,
    pub known_locations: HashSet<String>,
    pub active_sessions: HashSet<String>,
    pub location_changes: u32,
    pub last_access_time: DateTime<Utc>,
    pub security_score: Option<SecurityScore>,
}

impl UserSecurityMetrics {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            failed_login_attempts: 0,
            failed_two_factor_attempts: 0,
            session_anomalies: 0,
            rate_limit_exceeded: 0,
            api_error_count: 0,
            api_call_count: 0,
            unique_ips: HashSet::new(),
            known_locations: HashSet::new(),
            active_sessions: HashSet::new(),
            location_changes: 0,
            last_access_time: Utc::now(),
            security_score: None,
        }
    }

    /// API error ratio over the life of the current counting window.
    pub fn api_error_rate(&self) -> f64 {
        if self.api_call_count == 0 {
            0.0
        } else {
            self.api_error_count as f64 / self.api_call_count as f64
        }
    }

    fn reset_failure_counters(&mut self) {
        self.failed_login_attempts = 0;
        self.failed_two_factor_attempts = 0;
        self.session_anomalies = 0;
        self.rate_limit_exceeded = 0;
        self.api_error_count = 0;
        self.api_call_count = 0;
    }
}

/// Concurrent store for per-user metrics, per-IP failure counters, and the
/// IP blocklist.
#[derive(Debug, Default)]
pub struct MetricsStore {
    users: DashMap<String, UserSecurityMetrics>,
    ip_failed_logins: DashMap<IpAddr, u32>,
    ip_failed_two_factor: DashMap<IpAddr, u32>,
    blocked_ips: DashSet<IpAddr>,
}

impl MetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against the user's record under the entry lock, creating the
    /// record if this is the first tracked event for the user. Mutation and
    /// any rescoring done inside `f` are linearizable for this user.
    pub fn with_user_mut<R>(
        &self,
        user_id: &str,
        f: impl FnOnce(&mut UserSecurityMetrics) -> R,
    ) -> R {
        let mut entry = self
            .users
            .entry(user_id.to_string())
            .or_insert_with(|| UserSecurityMetrics::new(user_id));
        f(entry.value_mut())
    }

    pub fn get_user(&self, user_id: &str) -> Option<UserSecurityMetrics> {
        self.users.get(user_id).map(|e| e.value().clone())
    }

    pub fn all_users(&self) -> Vec<UserSecurityMetrics> {
        self.users.iter().map(|e| e.value().clone()).collect()
    }

    pub fn user_ids(&self) -> Vec<String> {
        self.users.iter().map(|e| e.key().clone()).collect()
    }

    /// Administrative clear of a user's record.
    pub fn clear_user(&self, user_id: &str) -> bool {
        self.users.remove(user_id).is_some()
    }

    /// Record a failed login from `ip` and return the cumulative count.
    pub fn record_ip_login_failure(&self, ip: IpAddr) -> u32 {
        let mut entry = self.ip_failed_logins.entry(ip).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Record a failed 2FA attempt from `ip` and return the cumulative count.
    pub fn record_ip_two_factor_failure(&self, ip: IpAddr) -> u32 {
        let mut entry = self.ip_failed_two_factor.entry(ip).or_insert(0);
        *entry += 1;
        *entry
    }

    pub fn ip_login_failures(&self, ip: IpAddr) -> u32 {
        self.ip_failed_logins.get(&ip).map(|e| *e.value()).unwrap_or(0)
    }

    /// Add `ip` to the blocklist. Returns `true` only when the IP was not
    /// already blocked, so callers can keep block-side effects idempotent.
    pub fn block_ip(&self, ip: IpAddr) -> bool {
        self.blocked_ips.insert(ip)
    }

    /// Remove `ip` from the blocklist. Returns `true` only when the IP was
    /// actually blocked.
    pub fn unblock_ip(&self, ip: IpAddr) -> bool {
        self.blocked_ips.remove(&ip).is_some()
    }

    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        self.blocked_ips.contains(&ip)
    }

    pub fn blocked_ips(&self) -> Vec<IpAddr> {
        self.blocked_ips.iter().map(|e| *e.key()).collect()
    }

    /// Periodic reset sweep. Clears failure counters per the configured
    /// scope; identity sets and the blocklist always persist. Returns the
    /// ids of users whose records changed so the caller can rescore them.
    pub fn reset_failure_counters(&self, scope: FailureResetScope) -> Vec<String> {
        let mut touched = Vec::new();

        for mut entry in self.users.iter_mut() {
            let metrics = entry.value_mut();
            metrics.reset_failure_counters();
            if scope == FailureResetScope::AllCounters {
                metrics.location_changes = 0;
            }
            touched.push(metrics.user_id.clone());
        }

        self.ip_failed_logins.clear();
        self.ip_failed_two_factor.clear();

        debug!(users = touched.len(), ?scope, "failure counters reset");
        touched
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn test_lazy_user_creation() {
        let store = MetricsStore::new();
        assert!(store.get_user("alice").is_none());

        store.with_user_mut("alice", |m| m.failed_login_attempts += 1);

        let metrics = store.get_user("alice").unwrap();
        assert_eq!(metrics.failed_login_attempts, 1);
        assert_eq!(metrics.user_id, "alice");
    }

    #[test]
    fn test_block_unblock_idempotent() {
        let store = MetricsStore::new();

        assert!(store.block_ip(ip(1)));
        assert!(!store.block_ip(ip(1)));
        assert_eq!(store.blocked_ips().len(), 1);

        assert!(store.unblock_ip(ip(1)));
        assert!(!store.unblock_ip(ip(1)));
        assert!(store.blocked_ips().is_empty());
    }

    #[test]
    fn test_ip_failure_counters_are_per_ip() {
        let store = MetricsStore::new();
        assert_eq!(store.record_ip_login_failure(ip(1)), 1);
        assert_eq!(store.record_ip_login_failure(ip(1)), 2);
        assert_eq!(store.record_ip_login_failure(ip(2)), 1);
    }

    #[test]
    fn test_reset_preserves_identity_sets_and_blocklist() {
        let store = MetricsStore::new();
        store.block_ip(ip(9));
        store.record_ip_login_failure(ip(9));
        store.with_user_mut("bob", |m| {
            m.failed_login_attempts = 4;
            m.api_call_count = 500;
            m.location_changes = 3;
            m.unique_ips.insert("10.0.0.9".to_string());
            m.active_sessions.insert("s1".to_string());
        });

        let touched = store.reset_failure_counters(FailureResetScope::FailureCountersOnly);
        assert_eq!(touched, vec!["bob".to_string()]);

        let metrics = store.get_user("bob").unwrap();
        assert_eq!(metrics.failed_login_attempts, 0);
        assert_eq!(metrics.api_call_count, 0);
        // Identity risk persists across the sweep.
        assert_eq!(metrics.location_changes, 3);
        assert_eq!(metrics.unique_ips.len(), 1);
        assert_eq!(metrics.active_sessions.len(), 1);
        assert!(store.is_blocked(ip(9)));
        assert_eq!(store.ip_login_failures(ip(9)), 0);
    }

    #[test]
    fn test_api_error_rate() {
        let mut metrics = UserSecurityMetrics::new("carol");
        assert_eq!(metrics.api_error_rate(), 0.0);
        metrics.api_call_count = 200;
        metrics.api_error_count = 30;
        assert!((metrics.api_error_rate() - 0.15).abs() < f64::EPSILON);
    }
}
