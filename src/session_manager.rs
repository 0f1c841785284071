//! Session lifecycle management: per-user active-session bookkeeping with
//! an advisory concurrency cap, and resilient bulk termination.

use crate::audit::{AuditEntry, AuditSink};
use crate::config::SessionConfig;
use crate::errors::SecurityError;
use crate::security_monitor::{SecurityMonitor, SessionAction, SessionAnomalyKind};
use crate::session_store::{SessionRecord, SessionStore};
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    monitor: Arc<SecurityMonitor>,
    audit: Arc<dyn AuditSink>,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        monitor: Arc<SecurityMonitor>,
        audit: Arc<dyn AuditSink>,
        config: SessionConfig,
    ) -> Self {
        Self {
            store,
            monitor,
            audit,
            config,
        }
    }

    /// Register a new session.
    ///
    /// The concurrency cap is advisory: a user already at the cap gets a
    /// `concurrent` anomaly raised *before* the session is admitted, but
    /// the session is admitted all the same. Detection over blocking: a
    /// shared family account and an account takeover look identical here,
    /// and only one of them deserves a lockout.
    pub async fn add_session(&self, record: SessionRecord) -> Result<(), SecurityError> {
        let user_id = record.user_id.clone();
        let session_id = record.session_id.clone();

        let current = self
            .monitor
            .get_security_metrics(&user_id)
            .map(|m| m.active_sessions.len())
            .unwrap_or(0);

        if current >= self.config.max_concurrent_sessions {
            warn!(
                user_id = %user_id,
                current,
                cap = self.config.max_concurrent_sessions,
                "session cap reached, admitting with anomaly"
            );
            self.monitor
                .track_session_anomaly(
                    &user_id,
                    SessionAnomalyKind::Concurrent,
                    serde_json::json!({ "session_id": session_id, "active": current }),
                )
                .await;
        }

        self.store
            .create(&record)
            .await
            .map_err(|source| SecurityError::SessionStoreError {
                operation: "create".to_string(),
                source,
            })?;

        self.monitor
            .track_session_activity(&user_id, &session_id, SessionAction::Create)
            .await;
        Ok(())
    }

    /// Remove a single session. The metrics entry for the user is
    /// independent bookkeeping and is never dropped here.
    pub async fn remove_session(&self, user_id: &str, session_id: &str) {
        if let Err(err) = self.store.delete(session_id).await {
            error!(session_id, "failed to delete session from store: {}", err);
        }
        self.monitor
            .track_session_activity(user_id, session_id, SessionAction::Terminate)
            .await;
    }

    /// Terminate all of a user's sessions, optionally sparing one (the
    /// session that requested the termination, typically). Each destroy is
    /// independent: one store failure is logged and the iteration
    /// continues. Returns the number of sessions terminated.
    pub async fn terminate_user_sessions(
        &self,
        user_id: &str,
        except_session_id: Option<&str>,
        reason: &str,
    ) -> usize {
        let sessions = match self.store.user_sessions(user_id).await {
            Ok(sessions) => sessions,
            Err(err) => {
                error!(user_id, "failed to enumerate user sessions: {}", err);
                Vec::new()
            }
        };

        let mut terminated = 0usize;
        for session in sessions {
            if Some(session.session_id.as_str()) == except_session_id {
                continue;
            }
            match self.store.delete(&session.session_id).await {
                Ok(()) => {
                    info!(
                        user_id,
                        session_id = %session.session_id,
                        reason,
                        "session terminated"
                    );
                    terminated += 1;
                }
                Err(err) => {
                    error!(
                        user_id,
                        session_id = %session.session_id,
                        "failed to destroy session: {}", err
                    );
                }
            }
            self.monitor
                .track_session_activity(user_id, &session.session_id, SessionAction::Terminate)
                .await;
        }

        if let Err(err) = self
            .audit
            .record(
                AuditEntry::new(
                    "sessions.terminate",
                    "session-manager",
                    serde_json::json!({ "reason": reason, "terminated": terminated }),
                )
                .target(user_id, "user"),
            )
            .await
        {
            error!("audit write failed: {}", err);
        }

        terminated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertDispatcher;
    use crate::audit::MemoryAuditSink;
    use crate::config::{AlertConfig, MonitorConfig};
    use crate::metrics_store::MetricsStore;
    use crate::security_metrics::SecurityMetrics;
    use crate::session_store::InMemorySessionStore;

    fn setup() -> (SessionManager, Arc<SecurityMonitor>, Arc<InMemorySessionStore>) {
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
        let store = Arc::new(InMemorySessionStore::new());
        let manager = SessionManager::new(
            store.clone(),
            monitor.clone(),
            sink,
            SessionConfig::default(),
        );
        (manager, monitor, store)
    }

    fn record(sid: &str, uid: &str) -> SessionRecord {
        SessionRecord::new(sid, uid, "10.0.0.1", "Mozilla/5.0", None)
    }

    #[tokio::test]
    async fn test_sixth_session_admitted_with_single_anomaly() {
        let (manager, monitor, store) = setup();

        for i in 0..5 {
            manager
                .add_session(record(&format!("s{}", i), "alice"))
                .await
                .unwrap();
        }
        let before = monitor.get_security_metrics("alice").unwrap();
        assert_eq!(before.session_anomalies, 0);

        // Sixth session: anomaly raised, session still admitted.
        manager.add_session(record("s5", "alice")).await.unwrap();

        let metrics = monitor.get_security_metrics("alice").unwrap();
        assert_eq!(metrics.active_sessions.len(), 6);
        assert_eq!(metrics.session_anomalies, 1);
        assert_eq!(store.len(), 6);
    }

    #[tokio::test]
    async fn test_remove_session_keeps_metrics_entry() {
        let (manager, monitor, store) = setup();

        manager.add_session(record("s1", "bob")).await.unwrap();
        manager.remove_session("bob", "s1").await;

        assert_eq!(store.len(), 0);
        let metrics = monitor.get_security_metrics("bob").unwrap();
        assert!(metrics.active_sessions.is_empty());
    }

    #[tokio::test]
    async fn test_terminate_all_except_current() {
        let (manager, monitor, store) = setup();

        for i in 0..3 {
            manager
                .add_session(record(&format!("s{}", i), "carol"))
                .await
                .unwrap();
        }

        let terminated = manager
            .terminate_user_sessions("carol", Some("s1"), "password change")
            .await;
        assert_eq!(terminated, 2);
        assert_eq!(store.len(), 1);
        assert!(store.get("s1").await.unwrap().is_some());

        let metrics = monitor.get_security_metrics("carol").unwrap();
        assert_eq!(
            metrics.active_sessions,
            std::collections::HashSet::from(["s1".to_string()])
        );
    }

    #[tokio::test]
    async fn test_terminate_unknown_user_is_total() {
        let (manager, _monitor, _store) = setup();
        assert_eq!(
            manager
                .terminate_user_sessions("ghost", None, "cleanup")
                .await,
            0
        );
    }
}
