//! Crate-wide typed error, mapped 1:1 to the ingress error table (§7).
//!
//! Modeled as a closed set of tagged variants rather than exceptions, per the
//! "exceptions for control flow" redesign flag: nothing unwinds across a
//! component boundary, every fallible call returns a `Result`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("validation failed: {code}")]
    Validation { code: &'static str, detail: String },

    #[error("unauthenticated")]
    Authentication,

    #[error("forbidden")]
    Authorization,

    #[error("rate limited, retry after {retry_after_s}s")]
    RateLimited { retry_after_s: u64, limit: u32, reset_at_s: u64 },

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("geolocation failed: {reason}")]
    Geolocation { reason: &'static str },

    #[error("queue full")]
    QueueFull,

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    fn status(&self) -> StatusCode {
        match self {
            GatewayError::Validation { .. } => StatusCode::BAD_REQUEST,
            GatewayError::Authentication => StatusCode::UNAUTHORIZED,
            GatewayError::Authorization => StatusCode::FORBIDDEN,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::Geolocation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            GatewayError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn body(&self) -> serde_json::Value {
        match self {
            GatewayError::Validation { code, detail } => json!({ "error": code, "detail": detail }),
            GatewayError::Authentication => json!({ "error": "unauthenticated" }),
            GatewayError::Authorization => json!({ "error": "forbidden" }),
            GatewayError::RateLimited { .. } => json!({ "error": "rate_limited" }),
            GatewayError::PayloadTooLarge => json!({ "error": "payload_too_large" }),
            GatewayError::Geolocation { reason } => json!({ "error": reason }),
            GatewayError::QueueFull => json!({ "error": "queue_full" }),
            GatewayError::Internal(_) => json!({ "error": "internal_error" }),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let rate_limit = match &self {
            GatewayError::RateLimited { retry_after_s, limit, reset_at_s } => {
                Some((*retry_after_s, *limit, *reset_at_s))
            }
            _ => None,
        };
        let mut resp = (status, Json(self.body())).into_response();
        if let Some((retry_after_s, limit, reset_at_s)) = rate_limit {
            let headers = resp.headers_mut();
            if let Ok(v) = axum::http::HeaderValue::from_str(&retry_after_s.to_string()) {
                headers.insert("Retry-After", v);
            }
            if let Ok(v) = axum::http::HeaderValue::from_str(&limit.to_string()) {
                headers.insert("X-RateLimit-Limit", v);
            }
            headers.insert("X-RateLimit-Remaining", axum::http::HeaderValue::from_static("0"));
            if let Ok(v) = axum::http::HeaderValue::from_str(&reset_at_s.to_string()) {
                headers.insert("X-RateLimit-Reset", v);
            }
        }
        resp
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
