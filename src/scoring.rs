//! Security score calculation.
//!
//! `calculate_score` is a pure function over a metrics snapshot: it starts
//! from full trust (100), applies a fixed weighted-deduction table for each
//! non-zero risk signal, clamps into [0, 100], and derives the risk tier.
//! The score is always recomputed wholesale so the numeric value can never
//! drift from its factor list.

use crate::metrics_store::UserSecurityMetrics;
use chrono::{Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Risk tier derived from the trust score. Higher score means lower risk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Step function over the clamped score. No hysteresis: scores
    /// oscillating around a boundary will flip tiers on every recompute.
    pub fn from_score(score: u8) -> Self {
        if score >= 80 {
            RiskLevel::Low
        } else if score >= 60 {
            RiskLevel::Medium
        } else if score >= 40 {
            RiskLevel::High
        } else {
            RiskLevel::Critical
        }
    }
}

/// One triggered deduction, with a human-readable recommendation for the
/// admin dashboards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityFactor {
    pub name: String,
    /// Signed score impact. Always negative for deductions.
    pub impact: i32,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
}

/// Point-in-time security score for a principal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityScore {
    pub score: u8,
    pub risk_level: RiskLevel,
    pub factors: Vec<SecurityFactor>,
    pub last_updated: chrono::DateTime<Utc>,
}

// Deduction table: weight per signal unit, capped per signal.
const FAILED_LOGIN_WEIGHT: u32 = 10;
const FAILED_LOGIN_CAP: u32 = 40;
const FAILED_2FA_WEIGHT: u32 = 15;
const FAILED_2FA_CAP: u32 = 45;
const IP_DIVERSITY_BASELINE: usize = 3;
const IP_DIVERSITY_WEIGHT: u32 = 5;
const IP_DIVERSITY_CAP: u32 = 25;
const SESSION_ANOMALY_WEIGHT: u32 = 20;
const SESSION_ANOMALY_CAP: u32 = 60;
const RATE_LIMIT_WEIGHT: u32 = 15;
const RATE_LIMIT_CAP: u32 = 45;
const API_ERROR_RATE_THRESHOLD: f64 = 0.10;
const API_ERROR_WEIGHT: u32 = 10;
const API_ERROR_CAP: u32 = 30;
const UNUSUAL_HOUR_PENALTY: u32 = 5;
const LOCATION_CHANGE_WEIGHT: u32 = 10;
const LOCATION_CHANGE_CAP: u32 = 30;
const CONCURRENT_SESSION_BASELINE: usize = 2;
const CONCURRENT_SESSION_WEIGHT: u32 = 10;
const CONCURRENT_SESSION_CAP: u32 = 30;

fn deduction(value: u32, weight: u32, cap: u32) -> u32 {
    value.saturating_mul(weight).min(cap)
}

/// Compute a principal's security score from a metrics snapshot.
///
/// Pure and deterministic: two calls with the same snapshot produce the
/// same score, tier, and factor list in the same order. Signals at zero or
/// below their baseline contribute neither a factor nor a deduction.
pub fn calculate_score(metrics: &UserSecurityMetrics) -> SecurityScore {
    let mut factors = Vec::new();
    let mut total_deduction: u32 = 0;

    if metrics.failed_login_attempts > 0 {
        let impact = deduction(
            metrics.failed_login_attempts,
            FAILED_LOGIN_WEIGHT,
            FAILED_LOGIN_CAP,
        );
        total_deduction += impact;
        factors.push(SecurityFactor {
            name: "failed_login_attempts".to_string(),
            impact: -(impact as i32),
            description: format!(
                "{} failed login attempts in the current window",
                metrics.failed_login_attempts
            ),
            recommendation: Some(
                "Verify account ownership and consider a password reset".to_string(),
            ),
        });
    }

    if metrics.failed_two_factor_attempts > 0 {
        let impact = deduction(
            metrics.failed_two_factor_attempts,
            FAILED_2FA_WEIGHT,
            FAILED_2FA_CAP,
        );
        total_deduction += impact;
        factors.push(SecurityFactor {
            name: "failed_two_factor_attempts".to_string(),
            impact: -(impact as i32),
            description: format!(
                "{} failed two-factor attempts",
                metrics.failed_two_factor_attempts
            ),
            recommendation: Some(
                "Confirm the second factor device is still in the user's possession".to_string(),
            ),
        });
    }

    if metrics.unique_ips.len() > IP_DIVERSITY_BASELINE {
        let extra = (metrics.unique_ips.len() - IP_DIVERSITY_BASELINE) as u32;
        let impact = deduction(extra, IP_DIVERSITY_WEIGHT, IP_DIVERSITY_CAP);
        total_deduction += impact;
        factors.push(SecurityFactor {
            name: "ip_diversity".to_string(),
            impact: -(impact as i32),
            description: format!(
                "Access from {} distinct IP addresses",
                metrics.unique_ips.len()
            ),
            recommendation: Some("Review recent sign-in locations with the user".to_string()),
        });
    }

    if metrics.session_anomalies > 0 {
        let impact = deduction(
            metrics.session_anomalies,
            SESSION_ANOMALY_WEIGHT,
            SESSION_ANOMALY_CAP,
        );
        total_deduction += impact;
        factors.push(SecurityFactor {
            name: "session_anomalies".to_string(),
            impact: -(impact as i32),
            description: format!("{} session anomalies detected", metrics.session_anomalies),
            recommendation: Some(
                "Terminate suspicious sessions and force re-authentication".to_string(),
            ),
        });
    }

    if metrics.rate_limit_exceeded > 0 {
        let impact = deduction(metrics.rate_limit_exceeded, RATE_LIMIT_WEIGHT, RATE_LIMIT_CAP);
        total_deduction += impact;
        factors.push(SecurityFactor {
            name: "rate_limit_violations".to_string(),
            impact: -(impact as i32),
            description: format!(
                "{} rate-limit violations",
                metrics.rate_limit_exceeded
            ),
            recommendation: Some("Check for scripted or abusive client behavior".to_string()),
        });
    }

    let error_rate = metrics.api_error_rate();
    if error_rate > API_ERROR_RATE_THRESHOLD {
        let percent = (error_rate * 100.0).floor() as u32;
        let impact = deduction(percent, API_ERROR_WEIGHT, API_ERROR_CAP);
        total_deduction += impact;
        factors.push(SecurityFactor {
            name: "api_error_rate".to_string(),
            impact: -(impact as i32),
            description: format!("API error rate at {}%", percent),
            recommendation: Some(
                "High error ratios often indicate probing; inspect recent requests".to_string(),
            ),
        });
    }

    let hour = metrics.last_access_time.hour();
    if hour >= 23 || hour < 5 {
        total_deduction += UNUSUAL_HOUR_PENALTY;
        factors.push(SecurityFactor {
            name: "unusual_access_hour".to_string(),
            impact: -(UNUSUAL_HOUR_PENALTY as i32),
            description: format!("Last access at {:02}:00 UTC", hour),
            recommendation: None,
        });
    }

    if metrics.location_changes > 0 {
        let impact = deduction(
            metrics.location_changes,
            LOCATION_CHANGE_WEIGHT,
            LOCATION_CHANGE_CAP,
        );
        total_deduction += impact;
        factors.push(SecurityFactor {
            name: "location_changes".to_string(),
            impact: -(impact as i32),
            description: format!("{} location changes observed", metrics.location_changes),
            recommendation: Some("Confirm travel with the user before trusting new locations".to_string()),
        });
    }

    if metrics.active_sessions.len() > CONCURRENT_SESSION_BASELINE {
        let extra = (metrics.active_sessions.len() - CONCURRENT_SESSION_BASELINE) as u32;
        let impact = deduction(extra, CONCURRENT_SESSION_WEIGHT, CONCURRENT_SESSION_CAP);
        total_deduction += impact;
        factors.push(SecurityFactor {
            name: "concurrent_sessions".to_string(),
            impact: -(impact as i32),
            description: format!(
                "{} concurrent active sessions",
                metrics.active_sessions.len()
            ),
            recommendation: Some("Ask the user to close sessions they do not recognize".to_string()),
        });
    }

    let score = 100i64.saturating_sub(total_deduction as i64).clamp(0, 100) as u8;

    SecurityScore {
        score,
        risk_level: RiskLevel::from_score(score),
        factors,
        last_updated: Utc::now(),
    }
}
