//! Adaptive security layer for the file-management platform.
//!
//! A small control loop: tracking operations mutate per-principal metrics,
//! every mutation recomputes an explainable 0-100 security score, and the
//! score feeds back into request admission through a tier-based rate
//! limiter. Session integrity validation gates authenticated requests, and
//! threshold crossings emit deduplicated alerts into the audit trail.
//!
//! All state is process-local and reached through injected handles; build
//! the component graph once with [`SecurityLayer::builder`] and share it.

pub mod alerts;
pub mod audit;
pub mod config;
pub mod errors;
pub mod metrics_store;
pub mod middleware;
pub mod rate_limiter;
pub mod score_cache;
pub mod scoring;
pub mod security_metrics;
pub mod security_monitor;
pub mod session_manager;
pub mod session_store;
pub mod session_validator;
pub mod two_factor;

pub use alerts::{AlertFeed, AlertSender, AlertType, SecurityAlert};
pub use audit::{AuditEntry, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use config::SecurityConfig;
pub use errors::SecurityError;
pub use metrics_store::{MetricsStore, UserSecurityMetrics};
pub use rate_limiter::{effective_limit, tier_for, AdaptiveRateLimiter, RateLimitDecision};
pub use score_cache::{InMemoryScoreCache, ScoreCache};
pub use scoring::{calculate_score, RiskLevel, SecurityFactor, SecurityScore};
pub use security_metrics::SecurityMetrics;
pub use security_monitor::{SecurityMonitor, SessionAction, SessionAnomalyKind};
pub use session_manager::SessionManager;
pub use session_store::{InMemorySessionStore, SessionRecord, SessionStore};
pub use session_validator::{DeviceInfo, SessionValidator};
pub use two_factor::TwoFactorVerifier;

use crate::alerts::AlertDispatcher;
use crate::middleware::SecurityGateState;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// The wired security layer: every component constructed once, sharing one
/// metrics store and one alert pipeline.
pub struct SecurityLayer {
    pub monitor: Arc<SecurityMonitor>,
    pub sessions: Arc<SessionManager>,
    pub validator: Arc<SessionValidator>,
    pub limiter: Arc<AdaptiveRateLimiter>,
    pub alert_feed: AlertFeed,
    dispatcher_handle: JoinHandle<()>,
    maintenance_handle: JoinHandle<()>,
}

impl SecurityLayer {
    pub fn builder() -> SecurityLayerBuilder {
        SecurityLayerBuilder::default()
    }

    /// State bundle for the axum request gate.
    pub fn gate_state(&self) -> SecurityGateState {
        SecurityGateState {
            monitor: self.monitor.clone(),
            validator: self.validator.clone(),
            limiter: self.limiter.clone(),
        }
    }

    /// Stop the background tasks. Dropping the layer without calling this
    /// leaves them running until the runtime shuts down.
    pub fn shutdown(self) {
        self.dispatcher_handle.abort();
        self.maintenance_handle.abort();
    }
}

#[derive(Default)]
pub struct SecurityLayerBuilder {
    config: Option<SecurityConfig>,
    audit: Option<Arc<dyn AuditSink>>,
    session_store: Option<Arc<dyn SessionStore>>,
    score_cache: Option<Arc<dyn ScoreCache>>,
    observability: Option<Arc<SecurityMetrics>>,
}

impl SecurityLayerBuilder {
    pub fn config(mut self, config: SecurityConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.session_store = Some(store);
        self
    }

    pub fn score_cache(mut self, cache: Arc<dyn ScoreCache>) -> Self {
        self.score_cache = Some(cache);
        self
    }

    pub fn observability(mut self, metrics: Arc<SecurityMetrics>) -> Self {
        self.observability = Some(metrics);
        self
    }

    /// Wire and start the layer. Must run inside a tokio runtime: the alert
    /// dispatcher and the failure-reset sweep are spawned here.
    pub fn build(self) -> SecurityLayer {
        let config = self.config.unwrap_or_default();
        let audit = self
            .audit
            .unwrap_or_else(|| Arc::new(TracingAuditSink) as Arc<dyn AuditSink>);
        let session_store = self
            .session_store
            .unwrap_or_else(|| Arc::new(InMemorySessionStore::new()) as Arc<dyn SessionStore>);
        let observability = self.observability.unwrap_or_default();

        let (alert_sender, alert_feed, dispatcher_handle) =
            AlertDispatcher::spawn(audit.clone(), config.alerts.clone());

        let monitor = Arc::new(SecurityMonitor::new(
            Arc::new(MetricsStore::new()),
            alert_sender,
            audit.clone(),
            self.score_cache,
            observability.clone(),
            config.monitor.clone(),
        ));
        let maintenance_handle = monitor.spawn_maintenance();

        let sessions = Arc::new(SessionManager::new(
            session_store.clone(),
            monitor.clone(),
            audit,
            config.session.clone(),
        ));
        let validator = Arc::new(SessionValidator::new(
            session_store,
            monitor.clone(),
            config.session.clone(),
        ));
        let limiter = Arc::new(AdaptiveRateLimiter::new(
            monitor.clone(),
            observability,
            config.rate_limit.clone(),
        ));

        SecurityLayer {
            monitor,
            sessions,
            validator,
            limiter,
            alert_feed,
            dispatcher_handle,
            maintenance_handle,
        }
    }
}
