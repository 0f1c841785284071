//! Observability gauges and counters for the security layer.
//!
//! Compiled against prometheus behind the `monitoring` feature; with the
//! feature off the same API exists as no-ops so call sites stay clean.

#[cfg(feature = "monitoring")]
use prometheus::{IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

#[cfg(feature = "monitoring")]
pub struct SecurityMetrics {
    pub security_incidents_total: IntCounterVec,
    pub throttled_requests_total: IntCounterVec,
    pub alerts_dropped_total: IntCounterVec,
    pub blocked_ips: IntGauge,
    pub active_sessions: IntGauge,
    pub user_security_score: IntGaugeVec,
    pub location_changes_total: IntCounterVec,
}

#[cfg(feature = "monitoring")]
impl SecurityMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let security_incidents_total = IntCounterVec::new(
            Opts::new("security_incidents_total", "Total security incidents"),
            &["incident_type", "severity"],
        )?;
        let throttled_requests_total = IntCounterVec::new(
            Opts::new("throttled_requests_total", "Requests rejected by the rate limiter"),
            &["route_class", "tier"],
        )?;
        let alerts_dropped_total = IntCounterVec::new(
            Opts::new("alerts_dropped_total", "Alerts dropped before dispatch"),
            &["reason"],
        )?;
        let blocked_ips = IntGauge::new("blocked_ips", "IPs currently on the blocklist")?;
        let active_sessions =
            IntGauge::new("active_sessions", "Currently tracked active sessions")?;
        let user_security_score = IntGaugeVec::new(
            Opts::new("user_security_score", "Current per-user security score"),
            &["user_id"],
        )?;
        let location_changes_total = IntCounterVec::new(
            Opts::new("location_changes_total", "Observed location changes"),
            &["user_id"],
        )?;

        registry.register(Box::new(security_incidents_total.clone()))?;
        registry.register(Box::new(throttled_requests_total.clone()))?;
        registry.register(Box::new(alerts_dropped_total.clone()))?;
        registry.register(Box::new(blocked_ips.clone()))?;
        registry.register(Box::new(active_sessions.clone()))?;
        registry.register(Box::new(user_security_score.clone()))?;
        registry.register(Box::new(location_changes_total.clone()))?;

        Ok(Self {
            security_incidents_total,
            throttled_requests_total,
            alerts_dropped_total,
            blocked_ips,
            active_sessions,
            user_security_score,
            location_changes_total,
        })
    }

    pub fn record_incident(&self, incident_type: &str, severity: &str) {
        self.security_incidents_total
            .with_label_values(&[incident_type, severity])
            .inc();
    }

    pub fn record_throttled(&self, route_class: &str, tier: &str) {
        self.throttled_requests_total
            .with_label_values(&[route_class, tier])
            .inc();
    }

    pub fn set_blocked_ips(&self, count: i64) {
        self.blocked_ips.set(count);
    }

    pub fn set_active_sessions(&self, count: i64) {
        self.active_sessions.set(count);
    }

    pub fn set_user_score(&self, user_id: &str, score: u8) {
        self.user_security_score
            .with_label_values(&[user_id])
            .set(score as i64);
    }

    pub fn record_location_change(&self, user_id: &str) {
        self.location_changes_total
            .with_label_values(&[user_id])
            .inc();
    }
}

#[cfg(feature = "monitoring")]
impl Default for SecurityMetrics {
    fn default() -> Self {
        Self::new(&Registry::new()).expect("failed to create default SecurityMetrics")
    }
}

/// No-op stand-in when the `monitoring` feature is disabled.
#[cfg(not(feature = "monitoring"))]
#[derive(Debug, Default)]
pub struct SecurityMetrics;

#[cfg(not(feature = "monitoring"))]
impl SecurityMetrics {
    pub fn record_incident(&self, _incident_type: &str, _severity: &str) {}
    pub fn record_throttled(&self, _route_class: &str, _tier: &str) {}
    pub fn set_blocked_ips(&self, _count: i64) {}
    pub fn set_active_sessions(&self, _count: i64) {}
    pub fn set_user_score(&self, _user_id: &str, _score: u8) {}
    pub fn record_location_change(&self, _user_id: &str) {}
}

#[cfg(all(test, feature = "monitoring"))]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_once() {
        let registry = Registry::new();
        let metrics = SecurityMetrics::new(&registry).unwrap();
        metrics.record_incident("blocked_ip", "warning");
        metrics.set_user_score("alice", 85);
        assert!(SecurityMetrics::new(&registry).is_err()); // duplicate registration
    }
}
