//! Authentication endpoints: login, refresh, logout, MFA.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use hk_auth::sessions::ClientInfo;
use hk_core::types::{ExternalId, ServiceName};
use hk_harness::rate_limiter::RateLimit;

use crate::api_error::ApiError;
use crate::extract::AuthedSession;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub external_id: String,
    /// Absent for messenger-native logins vouched for by the gateway.
    pub password: Option<String>,
    pub device_info: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub success: bool,
    pub user_id: i64,
    pub session_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    pub mfa_required: bool,
    pub force_password_change: bool,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct LogoutRequest {
    /// Deactivate every session of the user, keeping the presenting one out.
    #[serde(default)]
    pub all: bool,
}

#[derive(Debug, Serialize)]
pub struct LogoutResponse {
    pub success: bool,
    pub sessions_closed: u64,
}

#[derive(Debug, Serialize)]
pub struct MfaEnrollmentResponse {
    pub secret: String,
    pub backup_codes: Vec<String>,
    pub provisioning_uri: String,
}

#[derive(Debug, Deserialize)]
pub struct MfaVerifyRequest {
    pub code: String,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
}

/// Whether the caller is the authenticated bot gateway vouching for a
/// messenger identity it has already verified at the transport level.
///
/// No other peer — and no debug flag — opens the passwordless path: the
/// gateway is the only service whose transport proves who the user is.
fn vouched_by_gateway(state: &AppState, headers: &HeaderMap) -> bool {
    let name = headers.get("x-service-name").and_then(|v| v.to_str().ok());
    let key = headers.get("x-service-api-key").and_then(|v| v.to_str().ok());
    match (name, key) {
        (Some(name), Some(key)) => state
            .keyring
            .authenticate(name, key)
            .is_ok_and(|peer| peer == ServiceName::BotGateway),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    // The login endpoint carries its own brute-force limit on top of the
    // global stack, keyed by the claimed identity.
    let limit = RateLimit::per_minute(state.config.auth.max_login_attempts * 2);
    let decision = state
        .limiter
        .check("login", &request.external_id, &limit)
        .await;
    if !decision.allowed {
        return Err(ApiError::RateLimited {
            retry_after_secs: decision.retry_after.map(|d| d.as_secs().max(1)).unwrap_or(60),
        });
    }

    let external_id = ExternalId(request.external_id.clone());
    let user_id = state
        .credentials
        .lookup_external(&external_id)
        .await?
        .ok_or(ApiError::Unauthorized { attempts_remaining: None })?;

    let ip = client_ip(&headers);
    let (mfa_required, force_password_change) = match &request.password {
        Some(password) => {
            let outcome = state
                .credentials
                .verify_password(user_id, password, ip.as_deref())
                .await?;
            (outcome.mfa_required, outcome.force_password_change)
        }
        None => {
            if !vouched_by_gateway(&state, &headers) {
                return Err(ApiError::Unauthorized { attempts_remaining: None });
            }
            (false, false)
        }
    };

    let bundle = state
        .sessions
        .create_session(
            user_id,
            external_id,
            ClientInfo {
                device_info: request.device_info,
                ip_address: ip,
                user_agent: headers
                    .get("user-agent")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string),
            },
        )
        .await?;

    debug!(user = %user_id, session = %bundle.session_id, "login succeeded");
    Ok(Json(LoginResponse {
        success: true,
        user_id: user_id.0,
        session_id: bundle.session_id,
        access_token: bundle.access_token,
        refresh_token: bundle.refresh_token,
        expires_at: bundle.expires_at,
        refresh_expires_at: bundle.refresh_expires_at,
        mfa_required,
        force_password_change,
    }))
}

pub async fn refresh(
    State(state): State<AppState>,
    Json(request): Json<RefreshRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let bundle = state.sessions.refresh(&request.refresh_token).await?;
    let record = state.sessions.get_active(&bundle.session_id).await?;

    Ok(Json(LoginResponse {
        success: true,
        user_id: record.user_id.0,
        session_id: bundle.session_id,
        access_token: bundle.access_token,
        refresh_token: bundle.refresh_token,
        expires_at: bundle.expires_at,
        refresh_expires_at: bundle.refresh_expires_at,
        mfa_required: false,
        force_password_change: false,
    }))
}

pub async fn logout(
    State(state): State<AppState>,
    AuthedSession(session): AuthedSession,
    body: axum::body::Bytes,
) -> Result<Json<LogoutResponse>, ApiError> {
    // An empty body means "just this session".
    let request: LogoutRequest = if body.is_empty() {
        LogoutRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::Validation(e.to_string()))?
    };

    let sessions_closed = if request.all {
        state
            .sessions
            .logout_all(session.user_id, Some(&session.session_id))
            .await?
            + u64::from(state.sessions.logout(&session.session_id).await?)
    } else {
        u64::from(state.sessions.logout(&session.session_id).await?)
    };

    Ok(Json(LogoutResponse {
        success: true,
        sessions_closed,
    }))
}

pub async fn mfa_enable(
    State(state): State<AppState>,
    AuthedSession(session): AuthedSession,
) -> Result<Json<MfaEnrollmentResponse>, ApiError> {
    let enrollment = state.credentials.enable_mfa(session.user_id).await?;
    Ok(Json(MfaEnrollmentResponse {
        secret: enrollment.secret,
        backup_codes: enrollment.backup_codes,
        provisioning_uri: enrollment.provisioning_uri,
    }))
}

pub async fn mfa_verify(
    State(state): State<AppState>,
    AuthedSession(session): AuthedSession,
    Json(request): Json<MfaVerifyRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .credentials
        .verify_mfa(session.user_id, &request.code)
        .await?;
    Ok(Json(serde_json::json!({"success": true})))
}
