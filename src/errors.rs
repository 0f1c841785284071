use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Error taxonomy for the adaptive security layer.
///
/// Session and rate-limit variants are fatal to the current request and map
/// to stable status codes so callers can force re-authentication or back
/// off. Tracking-side failures are always caught and logged before they
/// reach the request path; `InternalTrackingError` exists for the few
/// places where a caller explicitly asks for the outcome.
#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("Invalid request: {reason}")]
    ValidationFailure { reason: String },

    #[error("Session expired")]
    SessionExpired,

    #[error("Session invalidated")]
    SessionInvalidated,

    #[error("Rate limit exceeded")]
    RateLimitExceeded { retry_after_seconds: u64 },

    #[error("Access denied")]
    IpBlocked,

    #[error("Two-factor authentication required")]
    TwoFactorRequired,

    #[error("Invalid two-factor code")]
    InvalidTwoFactor,

    #[error("Session store error during {operation}")]
    SessionStoreError {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Internal tracking error: {reason}")]
    InternalTrackingError { reason: String },
}

/// Session-expired status. Non-standard but widely understood by proxies
/// and SPA clients as "log in again".
const STATUS_SESSION_EXPIRED: u16 = 440;
const STATUS_SESSION_INVALIDATED: u16 = 441;

#[derive(Debug, Serialize)]
struct SecurityErrorResponse {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<u64>,
}

impl SecurityError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::ValidationFailure { .. } => "INVALID_REQUEST",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::SessionInvalidated => "SESSION_INVALIDATED",
            Self::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            Self::IpBlocked => "FORBIDDEN",
            Self::TwoFactorRequired => "TWO_FACTOR_REQUIRED",
            Self::InvalidTwoFactor => "INVALID_TWO_FACTOR",
            Self::SessionStoreError { .. } | Self::InternalTrackingError { .. } => {
                "INTERNAL_ERROR"
            }
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::ValidationFailure { .. } => StatusCode::BAD_REQUEST,
            Self::SessionExpired => {
                StatusCode::from_u16(STATUS_SESSION_EXPIRED).unwrap_or(StatusCode::UNAUTHORIZED)
            }
            Self::SessionInvalidated => StatusCode::from_u16(STATUS_SESSION_INVALIDATED)
                .unwrap_or(StatusCode::UNAUTHORIZED),
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            // Deliberately generic: the response must not reveal blocklist
            // membership beyond the fact of denial.
            Self::IpBlocked => StatusCode::FORBIDDEN,
            Self::TwoFactorRequired | Self::InvalidTwoFactor => StatusCode::UNAUTHORIZED,
            Self::SessionStoreError { .. } | Self::InternalTrackingError { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn public_message(&self) -> String {
        match self {
            // Internal detail stays in logs, not in responses.
            Self::SessionStoreError { .. } | Self::InternalTrackingError { .. } => {
                "Internal error".to_string()
            }
            Self::IpBlocked => "Access denied".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for SecurityError {
    fn into_response(self) -> Response {
        let retry_after = match &self {
            Self::RateLimitExceeded {
                retry_after_seconds,
            } => Some(*retry_after_seconds),
            _ => None,
        };

        let body = SecurityErrorResponse {
            error: self.error_code(),
            message: self.public_message(),
            retry_after_seconds: retry_after,
        };

        let mut response = (self.status(), Json(body)).into_response();

        if let Some(secs) = retry_after {
            if let Ok(value) = secs.to_string().parse() {
                response.headers_mut().insert("Retry-After", value);
            }
        }

        response
    }
}
