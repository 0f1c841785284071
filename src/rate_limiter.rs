//! Score-driven adaptive rate limiting.
//!
//! A static tier table maps the live security score to a quota multiplier;
//! the effective limit is recomputed per request so a principal whose score
//! collapses mid-window is throttled immediately. Counters are windowed per
//! `(identity, route class)`, where identity defaults to the client IP and
//! callers may substitute the authenticated user.

use crate::config::RateLimitConfig;
use crate::errors::SecurityError;
use crate::security_metrics::SecurityMetrics;
use crate::security_monitor::SecurityMonitor;
use dashmap::DashMap;
use ipnetwork::IpNetwork;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One row of the tier table.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitTier {
    pub name: &'static str,
    pub min_score: u8,
    pub multiplier: f64,
}

/// Ascending by `min_score`; selection is last-matching-wins.
pub const TIERS: [RateLimitTier; 5] = [
    RateLimitTier {
        name: "HIGH_RISK",
        min_score: 0,
        multiplier: 0.2,
    },
    RateLimitTier {
        name: "MEDIUM_RISK",
        min_score: 30,
        multiplier: 0.5,
    },
    RateLimitTier {
        name: "STANDARD",
        min_score: 60,
        multiplier: 1.0,
    },
    RateLimitTier {
        name: "TRUSTED",
        min_score: 80,
        multiplier: 2.0,
    },
    RateLimitTier {
        name: "VIP",
        min_score: 95,
        multiplier: 5.0,
    },
];

/// Highest tier whose `min_score` the score reaches.
pub fn tier_for(score: u8) -> RateLimitTier {
    let mut selected = TIERS[0];
    for tier in TIERS.iter() {
        if score >= tier.min_score {
            selected = *tier;
        }
    }
    selected
}

pub fn effective_limit(base_limit: u32, score: u8) -> u32 {
    (base_limit as f64 * tier_for(score).multiplier).floor() as u32
}

/// Outcome of an admitted request, for response headers and logging.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitDecision {
    pub limit: u32,
    pub remaining: u32,
    pub tier: &'static str,
    pub exempt: bool,
}

#[derive(Debug, Serialize)]
pub struct RateLimiterStats {
    pub tracked_keys: usize,
    pub base_limit: u32,
    pub window_seconds: u64,
}

#[derive(Debug)]
struct Window {
    count: u32,
    started: Instant,
}

pub struct AdaptiveRateLimiter {
    windows: DashMap<(String, String), Window>,
    monitor: Arc<SecurityMonitor>,
    obs: Arc<SecurityMetrics>,
    config: RateLimitConfig,
    exempt_networks: Vec<IpNetwork>,
    last_cleanup: Mutex<Instant>,
}

impl AdaptiveRateLimiter {
    pub fn new(
        monitor: Arc<SecurityMonitor>,
        obs: Arc<SecurityMetrics>,
        config: RateLimitConfig,
    ) -> Self {
        let exempt_networks = config
            .exempt_cidrs
            .iter()
            .filter_map(|cidr| match cidr.parse::<IpNetwork>() {
                Ok(network) => Some(network),
                Err(err) => {
                    warn!(cidr, "ignoring unparseable exempt CIDR: {}", err);
                    None
                }
            })
            .collect();

        Self {
            windows: DashMap::new(),
            monitor,
            obs,
            config,
            exempt_networks,
            last_cleanup: Mutex::new(Instant::now()),
        }
    }

    /// Admission check for one request.
    ///
    /// `identity` keys the counter window (client IP by default; callers
    /// may pass the authenticated user instead). `principal`, when known,
    /// selects the score and receives the violation on rejection. A blocked
    /// source IP short-circuits everything else.
    pub async fn check_request(
        &self,
        identity: &str,
        path: &str,
        principal: Option<&str>,
    ) -> Result<RateLimitDecision, SecurityError> {
        if let Ok(ip) = identity.parse::<IpAddr>() {
            if self.monitor.is_ip_blocked(ip) {
                warn!(%ip, "request denied: source IP is blocked");
                return Err(SecurityError::IpBlocked);
            }
            if self.exempt_networks.iter().any(|net| net.contains(ip)) {
                return Ok(self.exempt_decision());
            }
        }

        if self
            .config
            .exempt_paths
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
        {
            return Ok(self.exempt_decision());
        }

        let score = if self.config.use_dynamic_limit {
            let score_key = principal.unwrap_or(identity);
            self.monitor
                .current_score(score_key)
                .await
                .unwrap_or(self.config.default_score)
        } else {
            self.config.default_score
        };

        let tier = tier_for(score);
        let limit = effective_limit(self.config.base_limit, score);
        let route_class = route_class(path);
        let window = Duration::from_secs(self.config.window_seconds);

        // Counter bookkeeping happens under the entry lock; everything with
        // a suspension point stays outside it.
        let admitted = {
            let key = (identity.to_string(), route_class.to_string());
            let mut entry = self.windows.entry(key).or_insert_with(|| Window {
                count: 0,
                started: Instant::now(),
            });

            if entry.started.elapsed() >= window {
                entry.count = 0;
                entry.started = Instant::now();
            }

            if entry.count >= limit {
                let elapsed = entry.started.elapsed();
                let retry_after = window.saturating_sub(elapsed).as_secs().max(1);
                Err(retry_after)
            } else {
                entry.count += 1;
                Ok(limit - entry.count)
            }
        };

        self.cleanup_if_needed();

        match admitted {
            Ok(remaining) => Ok(RateLimitDecision {
                limit,
                remaining,
                tier: tier.name,
                exempt: false,
            }),
            Err(retry_after_seconds) => {
                warn!(
                    identity,
                    route_class,
                    tier = tier.name,
                    limit,
                    "request rate limited"
                );
                self.obs.record_throttled(route_class, tier.name);
                if let Some(principal) = principal {
                    self.monitor.record_rate_limit_exceeded(principal).await;
                }
                Err(SecurityError::RateLimitExceeded {
                    retry_after_seconds,
                })
            }
        }
    }

    pub fn get_stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            tracked_keys: self.windows.len(),
            base_limit: self.config.base_limit,
            window_seconds: self.config.window_seconds,
        }
    }

    fn exempt_decision(&self) -> RateLimitDecision {
        RateLimitDecision {
            limit: 0,
            remaining: 0,
            tier: "EXEMPT",
            exempt: true,
        }
    }

    fn cleanup_if_needed(&self) {
        let interval = Duration::from_secs(self.config.cleanup_interval_seconds);
        let due = {
            let mut last = match self.last_cleanup.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if last.elapsed() >= interval {
                *last = Instant::now();
                true
            } else {
                false
            }
        };
        if !due {
            return;
        }

        let stale = Duration::from_secs(self.config.window_seconds.saturating_mul(2));
        self.windows.retain(|_, w| w.started.elapsed() < stale);

        if self.windows.len() > self.config.max_tracked_keys {
            let excess = self.windows.len() - self.config.max_tracked_keys;
            let victims: Vec<_> = self
                .windows
                .iter()
                .take(excess)
                .map(|e| e.key().clone())
                .collect();
            for key in victims {
                self.windows.remove(&key);
            }
        }

        debug!(tracked = self.windows.len(), "rate limiter window cleanup");
    }
}

/// Coarse route classification so one noisy endpoint cannot starve the
/// rest of a client's traffic.
pub fn route_class(path: &str) -> &'static str {
    if path.starts_with("/auth") {
        "auth"
    } else if path.starts_with("/admin") {
        "admin"
    } else if path.starts_with("/files") || path.starts_with("/upload") {
        "files"
    } else {
        "general"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertDispatcher;
    use crate::audit::MemoryAuditSink;
    use crate::config::{AlertConfig, MonitorConfig};
    use crate::metrics_store::MetricsStore;

    fn setup(config: RateLimitConfig) -> (AdaptiveRateLimiter, Arc<SecurityMonitor>) {
        let sink = Arc::new(MemoryAuditSink::new());
        let (alerts, _feed, _handle) = AlertDispatcher::spawn(sink.clone(), AlertConfig::default());
        let monitor = Arc::new(SecurityMonitor::new(
            Arc::new(MetricsStore::new()),
            alerts,
            sink,
            None,
            Arc::new(SecurityMetrics::default()),
            MonitorConfig::default(),
        ));
        let limiter =
            AdaptiveRateLimiter::new(monitor.clone(), Arc::new(SecurityMetrics::default()), config);
        (limiter, monitor)
    }

    #[test]
    fn test_tier_selection() {
        assert_eq!(tier_for(0).name, "HIGH_RISK");
        assert_eq!(tier_for(29).name, "HIGH_RISK");
        assert_eq!(tier_for(30).name, "MEDIUM_RISK");
        assert_eq!(tier_for(45).name, "MEDIUM_RISK");
        assert_eq!(tier_for(60).name, "STANDARD");
        assert_eq!(tier_for(80).name, "TRUSTED");
        assert_eq!(tier_for(95).name, "VIP");
        assert_eq!(tier_for(100).name, "VIP");
    }

    #[test]
    fn test_tier_multiplier_monotonic() {
        let mut previous = 0.0;
        for score in 0..=100u8 {
            let multiplier = tier_for(score).multiplier;
            assert!(
                multiplier >= previous,
                "multiplier decreased at score {}",
                score
            );
            previous = multiplier;
        }
    }

    #[test]
    fn test_effective_limit_examples() {
        assert_eq!(effective_limit(100, 45), 50);
        assert_eq!(effective_limit(100, 10), 20);
        assert_eq!(effective_limit(100, 60), 100);
        assert_eq!(effective_limit(100, 97), 500);
        assert_eq!(effective_limit(7, 10), 1); // floor semantics
    }

    #[tokio::test]
    async fn test_unknown_principal_gets_standard_tier() {
        let config = RateLimitConfig {
            base_limit: 3,
            ..RateLimitConfig::default()
        };
        let (limiter, _monitor) = setup(config);

        for _ in 0..3 {
            let decision = limiter
                .check_request("198.51.100.1", "/files/list", None)
                .await
                .unwrap();
            assert_eq!(decision.tier, "STANDARD");
            assert_eq!(decision.limit, 3);
        }
        let result = limiter.check_request("198.51.100.1", "/files/list", None).await;
        assert!(matches!(
            result,
            Err(SecurityError::RateLimitExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn test_rejection_records_principal_violation() {
        let config = RateLimitConfig {
            base_limit: 1,
            ..RateLimitConfig::default()
        };
        let (limiter, monitor) = setup(config);

        limiter
            .check_request("alice", "/files/list", Some("alice"))
            .await
            .unwrap();
        let result = limiter
            .check_request("alice", "/files/list", Some("alice"))
            .await;
        assert!(result.is_err());

        let metrics = monitor.get_security_metrics("alice").unwrap();
        assert_eq!(metrics.rate_limit_exceeded, 1);
    }

    #[tokio::test]
    async fn test_low_score_shrinks_limit() {
        let config = RateLimitConfig {
            base_limit: 10,
            ..RateLimitConfig::default()
        };
        let (limiter, monitor) = setup(config);

        // Drive bob's score down hard before he makes requests.
        for _ in 0..10 {
            monitor
                .track_login_attempt(
                    false,
                    "203.0.113.7".parse().unwrap(),
                    "bob@example.com",
                    10,
                    Some("bob"),
                )
                .await;
            monitor
                .track_two_factor_attempt(false, "bob", "203.0.113.7".parse().unwrap())
                .await;
        }
        let score = monitor.current_score("bob").await.unwrap();
        assert!(score < 30);

        // HIGH_RISK tier: 10 * 0.2 = 2 requests per window.
        assert!(limiter.check_request("bob", "/files", Some("bob")).await.is_ok());
        assert!(limiter.check_request("bob", "/files", Some("bob")).await.is_ok());
        assert!(limiter.check_request("bob", "/files", Some("bob")).await.is_err());
    }

    #[tokio::test]
    async fn test_health_and_metrics_paths_exempt() {
        let config = RateLimitConfig {
            base_limit: 1,
            ..RateLimitConfig::default()
        };
        let (limiter, _monitor) = setup(config);

        for _ in 0..20 {
            let decision = limiter
                .check_request("198.51.100.2", "/health", None)
                .await
                .unwrap();
            assert!(decision.exempt);
            let decision = limiter
                .check_request("198.51.100.2", "/metrics", None)
                .await
                .unwrap();
            assert!(decision.exempt);
        }
    }

    #[tokio::test]
    async fn test_exempt_cidr_containment_not_prefix_match() {
        let config = RateLimitConfig {
            base_limit: 1,
            exempt_cidrs: vec!["192.168.1.0/24".to_string()],
            ..RateLimitConfig::default()
        };
        let (limiter, _monitor) = setup(config);

        // Inside the range: always admitted.
        for _ in 0..5 {
            assert!(limiter
                .check_request("192.168.1.42", "/files", None)
                .await
                .unwrap()
                .exempt);
        }

        // 192.168.10.5 shares the "192.168.1" string prefix but is NOT in
        // 192.168.1.0/24; it must hit the normal limiter.
        assert!(!limiter
            .check_request("192.168.10.5", "/files", None)
            .await
            .unwrap()
            .exempt);
        assert!(limiter
            .check_request("192.168.10.5", "/files", None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_blocked_ip_short_circuits() {
        let (limiter, monitor) = setup(RateLimitConfig::default());
        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        monitor.block_ip(ip, "admin").await;

        let result = limiter.check_request("203.0.113.9", "/health", None).await;
        // Authoritative even for otherwise-exempt paths.
        assert!(matches!(result, Err(SecurityError::IpBlocked)));
    }

    #[tokio::test]
    async fn test_route_classes_have_independent_windows() {
        let config = RateLimitConfig {
            base_limit: 1,
            ..RateLimitConfig::default()
        };
        let (limiter, _monitor) = setup(config);

        assert!(limiter.check_request("carol", "/files/a", Some("carol")).await.is_ok());
        assert!(limiter.check_request("carol", "/auth/refresh", Some("carol")).await.is_ok());
        assert!(limiter.check_request("carol", "/files/b", Some("carol")).await.is_err());
    }

    #[test]
    fn test_route_class_mapping() {
        assert_eq!(route_class("/auth/login"), "auth");
        assert_eq!(route_class("/admin/users"), "admin");
        assert_eq!(route_class("/files/123/download"), "files");
        assert_eq!(route_class("/upload/chunk"), "files");
        assert_eq!(route_class("/anything/else"), "general");
    }
}
