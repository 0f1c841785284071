//! Per-request session integrity validation.
//!
//! The outermost gate for authenticated requests, run before rate limiting
//! and business logic. A session moves `valid -> expired` on inactivity
//! timeout and `valid -> invalidated` once device-consistency failures
//! exhaust the tolerance counter; both are terminal and destroy the stored
//! session.

use crate::config::SessionConfig;
use crate::errors::SecurityError;
use crate::security_monitor::{SecurityMonitor, SessionAnomalyKind};
use crate::session_store::{SessionRecord, SessionStore};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Device snapshot presented by the current request.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub fingerprint: Option<String>,
    pub user_agent: String,
    pub ip: String,
}

pub struct SessionValidator {
    store: Arc<dyn SessionStore>,
    monitor: Arc<SecurityMonitor>,
    config: RwLock<SessionConfig>,
}

impl SessionValidator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        monitor: Arc<SecurityMonitor>,
        config: SessionConfig,
    ) -> Self {
        Self {
            store,
            monitor,
            config: RwLock::new(config),
        }
    }

    /// Replace the validation policy at runtime (admin surface).
    pub async fn update_config(&self, config: SessionConfig) {
        *self.config.write().await = config;
        info!("session validation configuration updated");
    }

    pub async fn get_config(&self) -> SessionConfig {
        self.config.read().await.clone()
    }

    /// Validate the session presented by an authenticated request.
    ///
    /// On success the stored device snapshot and activity timestamp are
    /// refreshed and the (possibly updated) record is returned. Expiry and
    /// exhausted validation failures are terminal: the session is destroyed
    /// and the caller must force re-authentication.
    pub async fn validate_request(
        &self,
        session_id: &str,
        current: &DeviceInfo,
    ) -> Result<SessionRecord, SecurityError> {
        let config = self.config.read().await.clone();

        let mut session = self
            .store
            .get(session_id)
            .await
            .map_err(|source| SecurityError::SessionStoreError {
                operation: "get".to_string(),
                source,
            })?
            .ok_or(SecurityError::SessionInvalidated)?;

        let now = Utc::now();
        let inactive_seconds = (now - session.last_activity).num_seconds();
        if inactive_seconds > config.max_inactivity_seconds as i64 {
            self.destroy(&session.session_id).await;
            self.monitor
                .track_session_anomaly(
                    &session.user_id,
                    SessionAnomalyKind::Expired,
                    serde_json::json!({
                        "session_id": session.session_id,
                        "inactive_seconds": inactive_seconds,
                    }),
                )
                .await;
            debug!(session_id, inactive_seconds, "session expired on inactivity");
            return Err(SecurityError::SessionExpired);
        }

        // Device consistency. Each mismatched field counts and is reported
        // individually; the fingerprint check is skipped when either side
        // has none.
        let mut mismatches: Vec<&'static str> = Vec::new();
        if session.ip != current.ip {
            mismatches.push("ip");
        }
        if session.user_agent != current.user_agent {
            mismatches.push("user_agent");
        }
        if let (Some(stored), Some(presented)) =
            (&session.device_fingerprint, &current.fingerprint)
        {
            if stored != presented {
                mismatches.push("fingerprint");
            }
        }

        for field in &mismatches {
            session.failed_validations += 1;
            warn!(
                session_id,
                user_id = %session.user_id,
                field,
                failed_validations = session.failed_validations,
                "session device mismatch"
            );
            self.monitor
                .track_session_anomaly(
                    &session.user_id,
                    SessionAnomalyKind::Invalid,
                    serde_json::json!({ "session_id": session.session_id, "field": field }),
                )
                .await;
        }

        if session.failed_validations >= config.max_failed_validations {
            self.destroy(&session.session_id).await;
            warn!(
                session_id,
                user_id = %session.user_id,
                "session invalidated after repeated device mismatches"
            );
            return Err(SecurityError::SessionInvalidated);
        }

        // Below the threshold: trust the new snapshot going forward.
        session.ip = current.ip.clone();
        session.user_agent = current.user_agent.clone();
        if current.fingerprint.is_some() {
            session.device_fingerprint = current.fingerprint.clone();
        }
        session.last_activity = now;

        if let Err(err) = self.store.update(&session).await {
            // Persistence is best-effort here; the admission decision stands.
            error!(session_id, "failed to persist refreshed session: {}", err);
        }

        Ok(session)
    }

    async fn destroy(&self, session_id: &str) {
        if let Err(err) = self.store.delete(session_id).await {
            error!(session_id, "failed to destroy session: {}", err);
        }
    }
}
