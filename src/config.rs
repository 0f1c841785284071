use serde::{Deserialize, Serialize};

/// Which counters the periodic reset sweep clears.
///
/// `FailureCountersOnly` is the production default: failed logins, failed
/// 2FA, session anomalies, rate-limit violations, and API call/error
/// counters are zeroed, while per-user identity sets (known IPs, locations,
/// active sessions) and the IP blocklist persist. Brute-force evidence is
/// short-lived; identity risk is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureResetScope {
    FailureCountersOnly,
    AllCounters,
}

/// Thresholds and policy for the security monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Failed logins from a single IP before it is auto-blocked.
    pub ip_block_threshold: u32,
    /// Failed 2FA attempts from a single IP before a critical alert.
    pub two_factor_alert_threshold: u32,
    /// Rescore on API usage only past these counts (sampling policy).
    pub api_error_rescore_threshold: u64,
    pub api_call_rescore_threshold: u64,
    /// Location changes before a warning alert.
    pub location_alert_threshold: u32,
    /// Concurrent sessions before a warning alert.
    pub concurrent_session_alert_threshold: usize,
    /// Interval between failure-counter reset sweeps.
    pub failure_reset_interval_seconds: u64,
    pub failure_reset_scope: FailureResetScope,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            ip_block_threshold: 5,
            two_factor_alert_threshold: 3,
            api_error_rescore_threshold: 50,
            api_call_rescore_threshold: 1000,
            location_alert_threshold: 2,
            concurrent_session_alert_threshold: 3,
            failure_reset_interval_seconds: 86_400, // 24 hours
            failure_reset_scope: FailureResetScope::FailureCountersOnly,
        }
    }
}

/// Session lifecycle and validation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Seconds of inactivity before a session expires.
    pub max_inactivity_seconds: u64,
    /// Device-snapshot mismatches tolerated before forced invalidation.
    pub max_failed_validations: u32,
    /// Concurrent-session cap. Exceeding it raises an anomaly but does not
    /// reject the new session.
    pub max_concurrent_sessions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_inactivity_seconds: 1800, // 30 minutes
            max_failed_validations: 3,
            max_concurrent_sessions: 5,
        }
    }
}

/// Adaptive rate limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Base quota per window before the tier multiplier is applied.
    pub base_limit: u32,
    pub window_seconds: u64,
    /// Recompute the effective limit per request from the live score.
    pub use_dynamic_limit: bool,
    /// Score assumed for principals with no recorded metrics.
    pub default_score: u8,
    /// Path prefixes never limited (health checks, metrics scrapes).
    pub exempt_paths: Vec<String>,
    /// Source ranges never limited, checked by CIDR containment.
    pub exempt_cidrs: Vec<String>,
    pub cleanup_interval_seconds: u64,
    pub max_tracked_keys: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            base_limit: 100,
            window_seconds: 60,
            use_dynamic_limit: true,
            default_score: 60,
            exempt_paths: vec!["/health".to_string(), "/metrics".to_string()],
            exempt_cidrs: Vec::new(),
            cleanup_interval_seconds: 300,
            max_tracked_keys: 100_000,
        }
    }
}

/// Alert pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Window within which identical alerts are silently dropped.
    pub throttle_window_seconds: u64,
    /// In-memory feed size for dashboards.
    pub feed_capacity: usize,
    /// Bounded channel between tracking operations and the dispatcher.
    pub channel_capacity: usize,
    /// Upper bound on a single audit-sink write.
    pub audit_timeout_seconds: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            throttle_window_seconds: 300, // 5 minutes
            feed_capacity: 100,
            channel_capacity: 256,
            audit_timeout_seconds: 5,
        }
    }
}

/// Top-level configuration for the security layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub monitor: MonitorConfig,
    pub session: SessionConfig,
    pub rate_limit: RateLimitConfig,
    pub alerts: AlertConfig,
}

impl SecurityConfig {
    /// Load configuration from environment, falling back to defaults for
    /// anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("SECURITY_IP_BLOCK_THRESHOLD") {
            config.monitor.ip_block_threshold =
                val.parse().unwrap_or(config.monitor.ip_block_threshold);
        }

        if let Ok(val) = std::env::var("SECURITY_FAILURE_RESET_SECONDS") {
            config.monitor.failure_reset_interval_seconds = val
                .parse()
                .unwrap_or(config.monitor.failure_reset_interval_seconds);
        }

        if let Ok(val) = std::env::var("SECURITY_SESSION_MAX_INACTIVITY_SECONDS") {
            config.session.max_inactivity_seconds =
                val.parse().unwrap_or(config.session.max_inactivity_seconds);
        }

        if let Ok(val) = std::env::var("SECURITY_SESSION_MAX_FAILED_VALIDATIONS") {
            config.session.max_failed_validations =
                val.parse().unwrap_or(config.session.max_failed_validations);
        }

        if let Ok(val) = std::env::var("SECURITY_RATE_LIMIT_BASE") {
            config.rate_limit.base_limit = val.parse().unwrap_or(config.rate_limit.base_limit);
        }

        if let Ok(val) = std::env::var("SECURITY_RATE_LIMIT_WINDOW_SECONDS") {
            config.rate_limit.window_seconds =
                val.parse().unwrap_or(config.rate_limit.window_seconds);
        }

        config.rate_limit.use_dynamic_limit = std::env::var("SECURITY_RATE_LIMIT_DYNAMIC")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(config.rate_limit.use_dynamic_limit);

        if let Ok(cidrs) = std::env::var("SECURITY_RATE_LIMIT_EXEMPT_CIDRS") {
            config.rate_limit.exempt_cidrs = cidrs
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Ok(val) = std::env::var("SECURITY_ALERT_THROTTLE_SECONDS") {
            config.alerts.throttle_window_seconds =
                val.parse().unwrap_or(config.alerts.throttle_window_seconds);
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_policy() {
        let config = SecurityConfig::default();
        assert_eq!(config.monitor.ip_block_threshold, 5);
        assert_eq!(config.monitor.failure_reset_interval_seconds, 86_400);
        assert_eq!(
            config.monitor.failure_reset_scope,
            FailureResetScope::FailureCountersOnly
        );
        assert_eq!(config.session.max_concurrent_sessions, 5);
        assert_eq!(config.session.max_failed_validations, 3);
        assert_eq!(config.rate_limit.default_score, 60);
        assert_eq!(config.alerts.throttle_window_seconds, 300);
        assert_eq!(config.alerts.feed_capacity, 100);
    }

    #[test]
    fn test_from_env_overrides() {
        std::env::set_var("SECURITY_IP_BLOCK_THRESHOLD", "7");
        std::env::set_var("SECURITY_RATE_LIMIT_DYNAMIC", "0");

        let config = SecurityConfig::from_env();
        assert_eq!(config.monitor.ip_block_threshold, 7);
        assert!(!config.rate_limit.use_dynamic_limit);

        std::env::remove_var("SECURITY_IP_BLOCK_THRESHOLD");
        std::env::remove_var("SECURITY_RATE_LIMIT_DYNAMIC");
    }
}
