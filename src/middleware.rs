//! Axum integration: the request gate the route layer mounts in front of
//! everything else.
//!
//! Order per request: blocked-IP check, then session validation for
//! requests presenting a session, then adaptive rate limiting. The core
//! components stay transport-agnostic; this module is the only place that
//! knows about HTTP.

use crate::errors::SecurityError;
use crate::rate_limiter::AdaptiveRateLimiter;
use crate::security_monitor::SecurityMonitor;
use crate::session_validator::{DeviceInfo, SessionValidator};
use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::debug;

pub const SESSION_HEADER: &str = "x-session-id";
pub const FINGERPRINT_HEADER: &str = "x-device-fingerprint";

#[derive(Clone)]
pub struct SecurityGateState {
    pub monitor: Arc<SecurityMonitor>,
    pub validator: Arc<SessionValidator>,
    pub limiter: Arc<AdaptiveRateLimiter>,
}

/// Outermost request gate. Mount with `axum::middleware::from_fn_with_state`.
pub async fn security_gate(
    State(state): State<SecurityGateState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let headers = request.headers().clone();
    let client_ip = extract_client_ip(&headers, addr.ip());
    let path = request.uri().path().to_string();

    if state.monitor.is_ip_blocked(client_ip) {
        return SecurityError::IpBlocked.into_response();
    }

    // Session validation first: it may terminate the session, and a dead
    // session must not consume rate-limit quota.
    let mut principal: Option<String> = None;
    if let Some(session_id) = header_value(&headers, SESSION_HEADER) {
        let device = DeviceInfo {
            fingerprint: header_value(&headers, FINGERPRINT_HEADER),
            user_agent: header_value(&headers, "user-agent").unwrap_or_default(),
            ip: client_ip.to_string(),
        };
        match state.validator.validate_request(&session_id, &device).await {
            Ok(session) => principal = Some(session.user_id),
            Err(err) => return err.into_response(),
        }
    }

    let identity = principal
        .clone()
        .unwrap_or_else(|| client_ip.to_string());
    match state
        .limiter
        .check_request(&identity, &path, principal.as_deref())
        .await
    {
        Ok(decision) => {
            debug!(identity, tier = decision.tier, path, "request admitted");
            next.run(request).await
        }
        Err(err) => err.into_response(),
    }
}

/// Prefer the first forwarded address, then fall back to the socket peer.
pub fn extract_client_ip(headers: &HeaderMap, fallback: IpAddr) -> IpAddr {
    if let Some(forwarded) = headers.get("x-forwarded-for") {
        if let Ok(value) = forwarded.to_str() {
            if let Some(first) = value.split(',').next() {
                if let Ok(ip) = first.trim().parse::<IpAddr>() {
                    return ip;
                }
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip") {
        if let Ok(value) = real_ip.to_str() {
            if let Ok(ip) = value.parse::<IpAddr>() {
                return ip;
            }
        }
    }

    fallback
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}
