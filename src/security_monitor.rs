//! Security monitor: the orchestrator of the adaptive control loop.
//!
//! Every tracking operation follows the same shape: mutate the principal's
//! metrics under its entry lock, recompute the score synchronously from the
//! fresh snapshot, then emit alerts and observability updates outside the
//! lock. Tracking calls are total by contract: missing state is initialized
//! lazily, and audit or alert delivery failures are logged, never raised
//! into the request path.

use crate::alerts::{AlertSender, AlertType, SecurityAlert};
use crate::audit::{AuditEntry, AuditSink};
use crate::config::MonitorConfig;
use crate::errors::SecurityError;
use crate::metrics_store::{MetricsStore, UserSecurityMetrics};
use crate::score_cache::ScoreCache;
use crate::scoring::{calculate_score, RiskLevel, SecurityScore};
use crate::security_metrics::SecurityMetrics;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const SCORE_CACHE_TTL: Duration = Duration::from_secs(300);

/// Session anomaly classification used by the manager and validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionAnomalyKind {
    Concurrent,
    Expired,
    Invalid,
}

impl SessionAnomalyKind {
    fn as_str(&self) -> &'static str {
        match self {
            SessionAnomalyKind::Concurrent => "concurrent",
            SessionAnomalyKind::Expired => "expired",
            SessionAnomalyKind::Invalid => "invalid",
        }
    }
}

/// Session lifecycle action for activity tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    Create,
    Terminate,
}

pub struct SecurityMonitor {
    store: Arc<MetricsStore>,
    alerts: AlertSender,
    audit: Arc<dyn AuditSink>,
    cache: Option<Arc<dyn ScoreCache>>,
    obs: Arc<SecurityMetrics>,
    config: MonitorConfig,
}

impl SecurityMonitor {
    pub fn new(
        store: Arc<MetricsStore>,
        alerts: AlertSender,
        audit: Arc<dyn AuditSink>,
        cache: Option<Arc<dyn ScoreCache>>,
        obs: Arc<SecurityMetrics>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            store,
            alerts,
            audit,
            cache,
            obs,
            config,
        }
    }

    pub fn metrics_store(&self) -> &Arc<MetricsStore> {
        &self.store
    }

    /// Record a login attempt. Failures accumulate against the source IP
    /// independently of any user; crossing the threshold blocks the IP and
    /// raises an alert exactly once.
    pub async fn track_login_attempt(
        &self,
        success: bool,
        ip: IpAddr,
        email: &str,
        duration_ms: u64,
        user_id: Option<&str>,
    ) {
        debug!(success, %ip, duration_ms, "login attempt tracked");

        if !success {
            let attempts = self.store.record_ip_login_failure(ip);
            if attempts >= self.config.ip_block_threshold && self.store.block_ip(ip) {
                self.obs.set_blocked_ips(self.store.blocked_ips().len() as i64);
                self.obs.record_incident("ip_auto_blocked", "warning");
                self.alerts.send(
                    SecurityAlert::new(
                        AlertType::Warning,
                        "auth.login",
                        "IP blocked after repeated failed logins",
                        serde_json::json!({ "ip": ip.to_string(), "email": email }),
                    )
                    .threat_level((attempts.saturating_mul(10)).min(100) as u8),
                );
                self.audit_best_effort(
                    AuditEntry::new(
                        "ip.block",
                        "security-monitor",
                        serde_json::json!({ "reason": "failed_login_threshold", "attempts": attempts }),
                    )
                    .target(&ip.to_string(), "ip")
                    .ip(&ip.to_string()),
                )
                .await;
                warn!(%ip, attempts, "source IP auto-blocked");
            }
        }

        if let Some(user_id) = user_id {
            let score = self.store.with_user_mut(user_id, |metrics| {
                metrics.unique_ips.insert(ip.to_string());
                metrics.last_access_time = Utc::now();
                if !success {
                    metrics.failed_login_attempts += 1;
                }
                rescore(metrics)
            });
            self.publish_score(user_id, &score).await;
        }
    }

    /// Record a 2FA attempt. Repeated per-IP failures escalate to a
    /// critical alert; per-user failures feed the score.
    pub async fn track_two_factor_attempt(&self, success: bool, user_id: &str, ip: IpAddr) {
        if !success {
            let attempts = self.store.record_ip_two_factor_failure(ip);
            if attempts >= self.config.two_factor_alert_threshold {
                self.obs.record_incident("two_factor_failures", "critical");
                self.alerts.send(
                    SecurityAlert::new(
                        AlertType::Critical,
                        "auth.two_factor",
                        "Repeated two-factor failures from one IP",
                        serde_json::json!({ "ip": ip.to_string(), "user_id": user_id }),
                    )
                    .threat_level((attempts.saturating_mul(20)).min(100) as u8),
                );
            }
        }

        let score = self.store.with_user_mut(user_id, |metrics| {
            metrics.last_access_time = Utc::now();
            if !success {
                metrics.failed_two_factor_attempts += 1;
            }
            rescore(metrics)
        });
        self.publish_score(user_id, &score).await;
    }

    /// Record a session anomaly observed by the manager or validator.
    pub async fn track_session_anomaly(
        &self,
        user_id: &str,
        kind: SessionAnomalyKind,
        details: serde_json::Value,
    ) {
        let score = self.store.with_user_mut(user_id, |metrics| {
            metrics.session_anomalies += 1;
            rescore(metrics)
        });

        self.obs.record_incident("session_anomaly", "warning");
        self.alerts.send(SecurityAlert::new(
            AlertType::Warning,
            "session.monitor",
            &format!("Session anomaly: {}", kind.as_str()),
            serde_json::json!({ "user_id": user_id, "kind": kind.as_str(), "details": details }),
        ));
        self.publish_score(user_id, &score).await;
    }

    /// Record an API call outcome. Rescoring is sampled: it only runs past
    /// the configured error/call thresholds so hot paths do not pay for a
    /// score recomputation on every request.
    pub async fn track_api_usage(
        &self,
        user_id: &str,
        endpoint: &str,
        status: u16,
        duration_ms: u64,
    ) {
        debug!(user_id, endpoint, status, duration_ms, "api usage tracked");

        let rescored = self.store.with_user_mut(user_id, |metrics| {
            metrics.api_call_count += 1;
            if status >= 400 {
                metrics.api_error_count += 1;
            }
            if metrics.api_error_count > self.config.api_error_rescore_threshold
                || metrics.api_call_count > self.config.api_call_rescore_threshold
            {
                Some(rescore(metrics))
            } else {
                None
            }
        });

        if let Some(score) = rescored {
            self.publish_score(user_id, &score).await;
        }
    }

    /// Record an access location. Only a location not seen before counts as
    /// a change; repeated changes raise a warning alert.
    pub async fn track_location_change(&self, user_id: &str, ip: IpAddr, location: &str) {
        let outcome = self.store.with_user_mut(user_id, |metrics| {
            metrics.unique_ips.insert(ip.to_string());
            if metrics.known_locations.insert(location.to_string()) {
                metrics.location_changes += 1;
                Some((rescore(metrics), metrics.location_changes))
            } else {
                None
            }
        });

        if let Some((score, changes)) = outcome {
            self.obs.record_location_change(user_id);
            if changes > self.config.location_alert_threshold {
                self.alerts.send(
                    SecurityAlert::new(
                        AlertType::Warning,
                        "session.location",
                        "Unusual number of location changes",
                        serde_json::json!({ "user_id": user_id, "location": location }),
                    )
                    .threat_level((changes.saturating_mul(15)).min(90) as u8),
                );
            }
            self.publish_score(user_id, &score).await;
        }
    }

    /// Maintain the active-session set for a user. Always rescored; going
    /// past the concurrency threshold raises a warning alert but never
    /// rejects the session.
    pub async fn track_session_activity(
        &self,
        user_id: &str,
        session_id: &str,
        action: SessionAction,
    ) {
        let (score, count) = self.store.with_user_mut(user_id, |metrics| {
            match action {
                SessionAction::Create => {
                    metrics.active_sessions.insert(session_id.to_string());
                }
                SessionAction::Terminate => {
                    metrics.active_sessions.remove(session_id);
                }
            }
            (rescore(metrics), metrics.active_sessions.len())
        });

        if action == SessionAction::Create && count > self.config.concurrent_session_alert_threshold
        {
            self.alerts.send(
                SecurityAlert::new(
                    AlertType::Warning,
                    "session.monitor",
                    "High concurrent session count",
                    serde_json::json!({ "user_id": user_id, "count": count }),
                )
                .threat_level((count.saturating_mul(20)).min(80) as u8),
            );
        }

        self.obs.set_active_sessions(self.total_active_sessions() as i64);
        self.publish_score(user_id, &score).await;
    }

    /// Called by the rate limiter when a request is rejected.
    pub async fn record_rate_limit_exceeded(&self, user_id: &str) {
        let score = self.store.with_user_mut(user_id, |metrics| {
            metrics.rate_limit_exceeded += 1;
            rescore(metrics)
        });
        self.obs.record_incident("rate_limit_exceeded", "warning");
        self.publish_score(user_id, &score).await;
    }

    // --- query surface -----------------------------------------------------

    pub fn get_security_metrics(&self, user_id: &str) -> Option<UserSecurityMetrics> {
        self.store.get_user(user_id)
    }

    pub fn get_all_security_scores(&self) -> HashMap<String, SecurityScore> {
        self.store
            .all_users()
            .into_iter()
            .filter_map(|m| m.security_score.clone().map(|s| (m.user_id, s)))
            .collect()
    }

    /// Users currently in the critical tier.
    pub fn get_active_threats(&self) -> Vec<(String, SecurityScore)> {
        self.store
            .all_users()
            .into_iter()
            .filter_map(|m| m.security_score.clone().map(|s| (m.user_id, s)))
            .filter(|(_, s)| s.risk_level == RiskLevel::Critical)
            .collect()
    }

    pub fn get_blocked_ips(&self) -> Vec<IpAddr> {
        self.store.blocked_ips()
    }

    pub fn is_ip_blocked(&self, ip: IpAddr) -> bool {
        self.store.is_blocked(ip)
    }

    /// Manual block. Idempotent: re-blocking an already-blocked IP neither
    /// changes the blocklist nor emits a second audit record.
    pub async fn block_ip(&self, ip: IpAddr, actor: &str) -> bool {
        let newly_blocked = self.store.block_ip(ip);
        if newly_blocked {
            self.obs.set_blocked_ips(self.store.blocked_ips().len() as i64);
            self.audit_best_effort(
                AuditEntry::new("ip.block", actor, serde_json::json!({ "manual": true }))
                    .target(&ip.to_string(), "ip"),
            )
            .await;
            info!(%ip, actor, "IP manually blocked");
        }
        newly_blocked
    }

    /// String-keyed variant of [`block_ip`](Self::block_ip) for the admin
    /// route layer. Malformed input is a client error, not a panic.
    pub async fn block_ip_str(&self, ip: &str, actor: &str) -> Result<bool, SecurityError> {
        let parsed: IpAddr = ip
            .parse()
            .map_err(|_| SecurityError::ValidationFailure {
                reason: format!("invalid IP address: {}", ip),
            })?;
        Ok(self.block_ip(parsed, actor).await)
    }

    /// String-keyed variant of [`unblock_ip`](Self::unblock_ip).
    pub async fn unblock_ip_str(&self, ip: &str, actor: &str) -> Result<bool, SecurityError> {
        let parsed: IpAddr = ip
            .parse()
            .map_err(|_| SecurityError::ValidationFailure {
                reason: format!("invalid IP address: {}", ip),
            })?;
        Ok(self.unblock_ip(parsed, actor).await)
    }

    /// Manual unblock, idempotent like [`block_ip`](Self::block_ip).
    pub async fn unblock_ip(&self, ip: IpAddr, actor: &str) -> bool {
        let removed = self.store.unblock_ip(ip);
        if removed {
            self.obs.set_blocked_ips(self.store.blocked_ips().len() as i64);
            self.audit_best_effort(
                AuditEntry::new("ip.unblock", actor, serde_json::json!({ "manual": true }))
                    .target(&ip.to_string(), "ip"),
            )
            .await;
            info!(%ip, actor, "IP unblocked");
        }
        removed
    }

    pub fn get_active_sessions(&self) -> HashMap<String, Vec<String>> {
        self.store
            .all_users()
            .into_iter()
            .filter(|m| !m.active_sessions.is_empty())
            .map(|m| {
                let mut sessions: Vec<String> = m.active_sessions.into_iter().collect();
                sessions.sort();
                (m.user_id, sessions)
            })
            .collect()
    }

    /// Clear the metrics-side active set for a user, rescoring once.
    /// Returns the session ids that were cleared. Destroying the records in
    /// the session store is the session manager's job.
    pub async fn terminate_user_sessions(&self, user_id: &str, reason: &str) -> Vec<String> {
        let (cleared, score) = self.store.with_user_mut(user_id, |metrics| {
            let mut cleared: Vec<String> = metrics.active_sessions.drain().collect();
            cleared.sort();
            (cleared, rescore(metrics))
        });

        if !cleared.is_empty() {
            self.audit_best_effort(
                AuditEntry::new(
                    "sessions.terminate",
                    "security-monitor",
                    serde_json::json!({ "reason": reason, "sessions": cleared }),
                )
                .target(user_id, "user"),
            )
            .await;
            info!(user_id, reason, count = cleared.len(), "user sessions terminated");
        }
        self.publish_score(user_id, &score).await;
        cleared
    }

    /// Users with at least one rate-limit violation on record.
    pub fn get_rate_limit_status(&self) -> HashMap<String, u32> {
        self.store
            .all_users()
            .into_iter()
            .filter(|m| m.rate_limit_exceeded > 0)
            .map(|m| (m.user_id, m.rate_limit_exceeded))
            .collect()
    }

    /// Current score for an identity, preferring the cache. Principals with
    /// no recorded metrics return `None`; the rate limiter substitutes its
    /// neutral default.
    pub async fn current_score(&self, user_id: &str) -> Option<u8> {
        if let Some(cache) = &self.cache {
            if let Some(score) = cache.get(user_id).await {
                return Some(score);
            }
        }

        let metrics = self.store.get_user(user_id)?;
        let score = match &metrics.security_score {
            Some(score) => score.score,
            None => calculate_score(&metrics).score,
        };
        if let Some(cache) = &self.cache {
            cache.set(user_id, score, SCORE_CACHE_TTL).await;
        }
        Some(score)
    }

    /// Administrative clear of one user's metrics record.
    pub async fn clear_user_metrics(&self, user_id: &str, actor: &str) -> bool {
        let removed = self.store.clear_user(user_id);
        if removed {
            if let Some(cache) = &self.cache {
                cache.invalidate(user_id).await;
            }
            self.audit_best_effort(
                AuditEntry::new("metrics.clear", actor, serde_json::json!({}))
                    .target(user_id, "user"),
            )
            .await;
        }
        removed
    }

    /// Periodic failure-counter reset. Identity sets and the blocklist
    /// survive the sweep; affected users are rescored against their reset
    /// counters.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let period = Duration::from_secs(monitor.config.failure_reset_interval_seconds.max(1));
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // consume the immediate first tick

            loop {
                interval.tick().await;
                let touched = monitor
                    .store
                    .reset_failure_counters(monitor.config.failure_reset_scope);
                for user_id in &touched {
                    let score = monitor.store.with_user_mut(user_id, rescore);
                    monitor.publish_score(user_id, &score).await;
                }
                info!(users = touched.len(), "failure counter reset sweep completed");
            }
        })
    }

    // --- internals ---------------------------------------------------------

    async fn publish_score(&self, user_id: &str, score: &SecurityScore) {
        self.obs.set_user_score(user_id, score.score);
        if let Some(cache) = &self.cache {
            cache.set(user_id, score.score, SCORE_CACHE_TTL).await;
        }
        debug!(user_id, score = score.score, risk = ?score.risk_level, "score updated");
    }

    async fn audit_best_effort(&self, entry: AuditEntry) {
        if let Err(err) = self.audit.record(entry).await {
            error!("audit write failed: {}", err);
        }
    }

    fn total_active_sessions(&self) -> usize {
        self.store
            .all_users()
            .iter()
            .map(|m| m.active_sessions.len())
            .sum()
    }
}

fn rescore(metrics: &mut UserSecurityMetrics) -> SecurityScore {
    let score = calculate_score(metrics);
    metrics.security_score = Some(score.clone());
    score
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertDispatcher;
    use crate::audit::MemoryAuditSink;
    use crate::config::AlertConfig;

    fn test_monitor() -> (Arc<SecurityMonitor>, Arc<MemoryAuditSink>) {
        let sink = Arc::new(MemoryAuditSink::new());
        let (alerts, _feed, _handle) = AlertDispatcher::spawn(sink.clone(), AlertConfig::default());
        let monitor = Arc::new(SecurityMonitor::new(
            Arc::new(MetricsStore::new()),
            alerts,
            sink.clone(),
            None,
            Arc::new(SecurityMetrics::default()),
            MonitorConfig::default(),
        ));
        (monitor, sink)
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(std::net::Ipv4Addr::new(203, 0, 113, last))
    }

    #[tokio::test]
    async fn test_ip_blocked_on_fifth_failure_without_duplicates() {
        let (monitor, sink) = test_monitor();

        for _ in 0..5 {
            monitor
                .track_login_attempt(false, ip(1), "user@example.com", 12, None)
                .await;
        }
        assert_eq!(monitor.get_blocked_ips(), vec![ip(1)]);

        // A sixth failure is still recorded but does not duplicate the block.
        monitor
            .track_login_attempt(false, ip(1), "user@example.com", 12, None)
            .await;
        assert_eq!(monitor.get_blocked_ips().len(), 1);
        assert_eq!(monitor.metrics_store().ip_login_failures(ip(1)), 6);
        assert_eq!(sink.entries_for_action("ip.block").await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_logins_lower_user_score() {
        let (monitor, _sink) = test_monitor();

        for _ in 0..3 {
            monitor
                .track_login_attempt(false, ip(2), "alice@example.com", 10, Some("alice"))
                .await;
        }

        let metrics = monitor.get_security_metrics("alice").unwrap();
        assert_eq!(metrics.failed_login_attempts, 3);
        let score = metrics.security_score.unwrap();
        assert!(score.score <= 70);
        assert!(score
            .factors
            .iter()
            .any(|f| f.name == "failed_login_attempts"));
    }

    #[tokio::test]
    async fn test_api_usage_rescoring_is_sampled() {
        let (monitor, _sink) = test_monitor();

        for _ in 0..1000 {
            monitor.track_api_usage("bob", "/files", 200, 5).await;
        }
        // At exactly the threshold no score has been computed yet.
        let metrics = monitor.get_security_metrics("bob").unwrap();
        assert_eq!(metrics.api_call_count, 1000);
        assert!(metrics.security_score.is_none());

        // Call 1001 crosses the sampling threshold and rescoring runs even
        // with a zero error rate.
        monitor.track_api_usage("bob", "/files", 200, 5).await;
        let metrics = monitor.get_security_metrics("bob").unwrap();
        let score = metrics.security_score.unwrap();
        assert!(score.factors.iter().all(|f| f.name != "api_error_rate"));
    }

    #[tokio::test]
    async fn test_location_change_counts_only_new_locations() {
        let (monitor, _sink) = test_monitor();

        monitor.track_location_change("carol", ip(3), "Berlin").await;
        monitor.track_location_change("carol", ip(3), "Berlin").await;
        monitor.track_location_change("carol", ip(4), "Lisbon").await;

        let metrics = monitor.get_security_metrics("carol").unwrap();
        assert_eq!(metrics.location_changes, 2);
        assert_eq!(metrics.known_locations.len(), 2);
    }

    #[tokio::test]
    async fn test_manual_block_idempotent_audit() {
        let (monitor, sink) = test_monitor();

        assert!(monitor.block_ip(ip(5), "admin").await);
        assert!(!monitor.block_ip(ip(5), "admin").await);
        assert_eq!(sink.entries_for_action("ip.block").await.len(), 1);

        assert!(monitor.unblock_ip(ip(5), "admin").await);
        assert!(!monitor.unblock_ip(ip(5), "admin").await);
        assert_eq!(sink.entries_for_action("ip.unblock").await.len(), 1);
    }

    #[tokio::test]
    async fn test_block_ip_str_rejects_malformed_input() {
        let (monitor, _sink) = test_monitor();

        let result = monitor.block_ip_str("not-an-ip", "admin").await;
        assert!(matches!(
            result,
            Err(SecurityError::ValidationFailure { .. })
        ));
        assert!(monitor.get_blocked_ips().is_empty());

        assert!(monitor.block_ip_str("203.0.113.77", "admin").await.unwrap());
        assert!(monitor.unblock_ip_str("203.0.113.77", "admin").await.unwrap());
    }

    #[tokio::test]
    async fn test_terminate_clears_active_set() {
        let (monitor, sink) = test_monitor();

        monitor
            .track_session_activity("dave", "s1", SessionAction::Create)
            .await;
        monitor
            .track_session_activity("dave", "s2", SessionAction::Create)
            .await;

        let cleared = monitor.terminate_user_sessions("dave", "admin request").await;
        assert_eq!(cleared, vec!["s1".to_string(), "s2".to_string()]);
        assert!(monitor.get_active_sessions().get("dave").is_none());
        assert_eq!(sink.entries_for_action("sessions.terminate").await.len(), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_status_lists_violators() {
        let (monitor, _sink) = test_monitor();

        monitor.record_rate_limit_exceeded("erin").await;
        monitor.record_rate_limit_exceeded("erin").await;

        let status = monitor.get_rate_limit_status();
        assert_eq!(status.get("erin"), Some(&2));
        assert!(status.get("frank").is_none());
    }

    #[tokio::test]
    async fn test_active_threats_lists_critical_users() {
        let (monitor, _sink) = test_monitor();

        // Pile on enough signals to drive the score into critical.
        for _ in 0..5 {
            monitor
                .track_login_attempt(false, ip(6), "mallory@example.com", 10, Some("mallory"))
                .await;
            monitor
                .track_two_factor_attempt(false, "mallory", ip(6))
                .await;
            monitor
                .track_session_anomaly(
                    "mallory",
                    SessionAnomalyKind::Invalid,
                    serde_json::json!({}),
                )
                .await;
        }

        let threats = monitor.get_active_threats();
        assert_eq!(threats.len(), 1);
        assert_eq!(threats[0].0, "mallory");
        assert_eq!(threats[0].1.risk_level, RiskLevel::Critical);
    }

    #[tokio::test]
    async fn test_current_score_defaults_to_none_for_unknown() {
        let (monitor, _sink) = test_monitor();
        assert_eq!(monitor.current_score("ghost").await, None);
    }
}
