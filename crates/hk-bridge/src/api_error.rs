//! HTTP API error types.
//!
//! One enum covers the whole error taxonomy; `IntoResponse` maps it onto
//! status codes and JSON bodies. Messages stay generic where specificity
//! would leak (wrong account vs wrong password vs missing password all read
//! the same from outside).

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;

use hk_auth::AuthError;
use hk_events::webhook::WebhookError;
use hk_harness::service_keys::TrustError;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed input or an illegal state transition.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    /// Missing or invalid credentials. Optionally carries the remaining
    /// attempt budget (the caller already proved it knows the account).
    #[error("unauthorized")]
    Unauthorized { attempts_remaining: Option<u32> },

    /// Authenticated but not allowed.
    #[error("forbidden")]
    Forbidden,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Credential lockout in effect.
    #[error("account locked")]
    Locked { until: DateTime<Utc> },

    /// Shed by the limiter; carries the wait.
    #[error("rate limited")]
    RateLimited { retry_after_secs: u64 },

    /// A dependency is unreachable or its breaker is open.
    #[error("service unavailable")]
    Unavailable,

    /// Anything unexpected. Logged with context; surfaced without any.
    #[error("internal error")]
    Internal,
}

// ---------------------------------------------------------------------------
// IntoResponse implementation
// ---------------------------------------------------------------------------

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(message) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({"error": "validation_error", "detail": message})),
            )
                .into_response(),
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "bad_request", "detail": message})),
            )
                .into_response(),
            ApiError::Unauthorized { attempts_remaining } => {
                let mut body = json!({"error": "unauthorized"});
                if let Some(remaining) = attempts_remaining {
                    body["attempts_remaining"] = remaining.into();
                }
                (StatusCode::UNAUTHORIZED, Json(body)).into_response()
            }
            ApiError::Forbidden => (
                StatusCode::FORBIDDEN,
                Json(json!({"error": "forbidden"})),
            )
                .into_response(),
            ApiError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "not_found", "detail": what})),
            )
                .into_response(),
            ApiError::Conflict(what) => (
                StatusCode::CONFLICT,
                Json(json!({"error": "conflict", "detail": what})),
            )
                .into_response(),
            ApiError::Locked { until } => (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "account_locked", "locked_until": until.to_rfc3339()})),
            )
                .into_response(),
            ApiError::RateLimited { retry_after_secs } => (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", retry_after_secs.to_string())],
                Json(json!({"error": "rate_limited", "retry_after": retry_after_secs})),
            )
                .into_response(),
            ApiError::Unavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": "service_unavailable"})),
            )
                .into_response(),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal_error"})),
            )
                .into_response(),
        }
    }
}

// ---------------------------------------------------------------------------
// Conversions from component errors
// ---------------------------------------------------------------------------

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            // Deliberately indistinguishable from outside.
            AuthError::InvalidCredentials
            | AuthError::PasswordNotSet
            | AuthError::InvalidToken
            | AuthError::SessionInactive
            | AuthError::MfaRejected => ApiError::Unauthorized { attempts_remaining: None },
            AuthError::InvalidPassword { attempts_remaining } => ApiError::Unauthorized {
                attempts_remaining: Some(attempts_remaining),
            },
            AuthError::Locked { until } => ApiError::Locked { until },
            AuthError::WeakPassword { min_length } => {
                ApiError::Validation(format!("password must be at least {min_length} characters"))
            }
            AuthError::Conflict(what) => ApiError::Conflict(what),
            // The credential store is the source of truth: fail closed.
            AuthError::StoreUnavailable(_) => ApiError::Unavailable,
            AuthError::Crypto => ApiError::Internal,
        }
    }
}

impl From<TrustError> for ApiError {
    fn from(e: TrustError) -> Self {
        match e {
            TrustError::UnknownService
            | TrustError::InvalidCredentials
            | TrustError::StaleTimestamp => ApiError::Unauthorized { attempts_remaining: None },
            TrustError::Forbidden { .. } => ApiError::Forbidden,
        }
    }
}

impl From<WebhookError> for ApiError {
    fn from(e: WebhookError) -> Self {
        match e {
            WebhookError::InsecureTransport => {
                ApiError::BadRequest("HTTPS required".to_string())
            }
            WebhookError::PayloadTooLarge { limit } => {
                ApiError::Validation(format!("payload exceeds {limit} bytes"))
            }
            WebhookError::SignatureMissing | WebhookError::SignatureInvalid => {
                ApiError::Unauthorized { attempts_remaining: None }
            }
            WebhookError::InvalidPayload(detail) => ApiError::Validation(detail),
            WebhookError::Store(_) => ApiError::Unavailable,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_of(response: Response) -> (StatusCode, serde_json::Value) {
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn status_mapping() {
        let cases: Vec<(ApiError, StatusCode)> = vec![
            (ApiError::Validation("x".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (ApiError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (
                ApiError::Unauthorized { attempts_remaining: None },
                StatusCode::UNAUTHORIZED,
            ),
            (ApiError::Forbidden, StatusCode::FORBIDDEN),
            (ApiError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (ApiError::Conflict("x".into()), StatusCode::CONFLICT),
            (
                ApiError::RateLimited { retry_after_secs: 5 },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (ApiError::Unavailable, StatusCode::SERVICE_UNAVAILABLE),
            (ApiError::Internal, StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, expected) in cases {
            let (status, _) = body_of(error.into_response()).await;
            assert_eq!(status, expected);
        }
    }

    #[tokio::test]
    async fn rate_limited_sets_retry_after_header() {
        let response = ApiError::RateLimited { retry_after_secs: 42 }.into_response();
        assert_eq!(response.headers().get("Retry-After").unwrap(), "42");
    }

    #[tokio::test]
    async fn credential_failures_read_identically() {
        let a = ApiError::from(AuthError::InvalidCredentials).into_response();
        let b = ApiError::from(AuthError::PasswordNotSet).into_response();
        let (status_a, body_a) = body_of(a).await;
        let (status_b, body_b) = body_of(b).await;
        assert_eq!(status_a, status_b);
        assert_eq!(body_a, body_b);
    }

    #[tokio::test]
    async fn locked_carries_unlock_time() {
        let until = Utc::now();
        let (_, body) = body_of(ApiError::Locked { until }.into_response()).await;
        assert_eq!(body["error"], "account_locked");
        assert!(body["locked_until"].is_string());
    }

    #[tokio::test]
    async fn remaining_attempts_surface() {
        let error = ApiError::from(AuthError::InvalidPassword { attempts_remaining: 2 });
        let (_, body) = body_of(error.into_response()).await;
        assert_eq!(body["attempts_remaining"], 2);
    }

    #[tokio::test]
    async fn store_outage_fails_closed() {
        let error = ApiError::from(AuthError::StoreUnavailable("down".into()));
        let (status, body) = body_of(error.into_response()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        // The outage detail never reaches the caller.
        assert_eq!(body, serde_json::json!({"error": "service_unavailable"}));
    }
}
