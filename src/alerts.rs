//! Alert pipeline: a bounded channel from tracking operations to a single
//! dispatcher task that throttles duplicates, keeps a small feed for
//! dashboards, and forwards the durable copy to the audit sink.
//!
//! Emission is fire-and-forget: a full channel drops the alert (counted and
//! logged) rather than blocking or failing the request that produced it.

use crate::audit::{AuditEntry, AuditSink};
use crate::config::AlertConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertType {
    Warning,
    Critical,
}

impl AlertType {
    fn as_str(&self) -> &'static str {
        match self {
            AlertType::Warning => "warning",
            AlertType::Critical => "critical",
        }
    }
}

/// A security alert. Transient: the dispatcher retains the last N in a ring
/// buffer for dashboards, and the durable copy goes to the audit sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityAlert {
    pub id: Uuid,
    pub alert_type: AlertType,
    pub source: String,
    pub message: String,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threat_level: Option<u8>,
}

impl SecurityAlert {
    pub fn new(
        alert_type: AlertType,
        source: &str,
        message: &str,
        details: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            alert_type,
            source: source.to_string(),
            message: message.to_string(),
            details,
            timestamp: Utc::now(),
            threat_level: None,
        }
    }

    pub fn threat_level(mut self, level: u8) -> Self {
        self.threat_level = Some(level.min(100));
        self
    }

    /// Deduplication key: identical (source, type, details) collapse within
    /// the throttle window. The threat level is deliberately excluded so a
    /// climbing counter does not defeat throttling.
    fn dedup_key(&self) -> String {
        format!("{}:{}:{}", self.source, self.alert_type.as_str(), self.details)
    }
}

/// Shared read view of the recent-alert ring buffer.
pub type AlertFeed = Arc<RwLock<VecDeque<SecurityAlert>>>;

/// Producer half handed to tracking operations.
#[derive(Clone)]
pub struct AlertSender {
    tx: mpsc::Sender<SecurityAlert>,
    dropped: Arc<AtomicU64>,
}

impl AlertSender {
    /// Fire-and-forget emission. Never blocks and never fails the caller;
    /// a full channel increments the drop counter instead.
    pub fn send(&self, alert: SecurityAlert) {
        if let Err(err) = self.tx.try_send(alert) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                total_dropped = dropped,
                "alert channel full, dropping alert: {}", err
            );
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Consumer task state.
pub struct AlertDispatcher {
    audit: Arc<dyn AuditSink>,
    config: AlertConfig,
    feed: AlertFeed,
    last_emission: HashMap<String, Instant>,
}

impl AlertDispatcher {
    /// Build the pipeline: returns the producer handle, the dashboard feed,
    /// and the spawned consumer task.
    pub fn spawn(
        audit: Arc<dyn AuditSink>,
        config: AlertConfig,
    ) -> (AlertSender, AlertFeed, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let feed: AlertFeed = Arc::new(RwLock::new(VecDeque::with_capacity(config.feed_capacity)));

        let dispatcher = AlertDispatcher {
            audit,
            config,
            feed: feed.clone(),
            last_emission: HashMap::new(),
        };

        let handle = tokio::spawn(dispatcher.run(rx));

        let sender = AlertSender {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (sender, feed, handle)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<SecurityAlert>) {
        while let Some(alert) = rx.recv().await {
            self.dispatch(alert).await;
        }
        debug!("alert channel closed, dispatcher stopping");
    }

    async fn dispatch(&mut self, alert: SecurityAlert) {
        let window = Duration::from_secs(self.config.throttle_window_seconds);
        let key = alert.dedup_key();

        if let Some(last) = self.last_emission.get(&key) {
            if last.elapsed() < window {
                // Silently dropped by design: not queued, not merged.
                debug!(source = %alert.source, "duplicate alert within throttle window");
                return;
            }
        }
        self.last_emission.insert(key, Instant::now());
        self.prune_emission_log(window);

        match alert.alert_type {
            AlertType::Critical => error!(
                alert_id = %alert.id,
                source = %alert.source,
                threat_level = alert.threat_level.unwrap_or(0),
                "critical security alert: {}", alert.message
            ),
            AlertType::Warning => warn!(
                alert_id = %alert.id,
                source = %alert.source,
                threat_level = alert.threat_level.unwrap_or(0),
                "security alert: {}", alert.message
            ),
        }

        self.run_hooks(&alert);

        {
            let mut feed = self.feed.write().await;
            if feed.len() >= self.config.feed_capacity {
                feed.pop_front();
            }
            feed.push_back(alert.clone());
        }

        // Durable copy, bounded so a slow sink cannot stall the consumer.
        let entry = AuditEntry::new(
            "security.alert",
            "security-monitor",
            serde_json::json!({
                "alert_id": alert.id,
                "type": alert.alert_type.as_str(),
                "source": alert.source,
                "message": alert.message,
                "details": alert.details,
                "threat_level": alert.threat_level,
            }),
        );
        let timeout = Duration::from_secs(self.config.audit_timeout_seconds);
        match tokio::time::timeout(timeout, self.audit.record(entry)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!("audit write for alert failed: {}", err),
            Err(_) => error!("audit write for alert timed out"),
        }
    }

    /// Informational pattern hooks. These surface notable attack shapes in
    /// the logs; they never block credentials or mutate state.
    fn run_hooks(&self, alert: &SecurityAlert) {
        match alert.source.as_str() {
            "auth.login" => {
                if alert.threat_level.unwrap_or(0) >= 50 {
                    warn!(
                        details = %alert.details,
                        "brute-force pattern hook: sustained login failures"
                    );
                }
            }
            "auth.two_factor" => {
                warn!(
                    details = %alert.details,
                    "2FA failure hook: repeated second-factor failures"
                );
            }
            _ => {}
        }
    }

    fn prune_emission_log(&mut self, window: Duration) {
        if self.last_emission.len() > 1024 {
            self.last_emission.retain(|_, last| last.elapsed() < window);
        }
    }
}
