//! Request extractors.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

use hk_auth::store::SessionRecord;

use crate::api_error::ApiError;
use crate::state::AppState;

/// A validated bearer session.
///
/// Pulls the token from `Authorization: Bearer <token>`, validates it against
/// the session store (which also records the activity touch), and hands the
/// live session record to the handler.
pub struct AuthedSession(pub SessionRecord);

impl FromRequestParts<AppState> for AuthedSession {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(ApiError::Unauthorized { attempts_remaining: None })?;

        let record = state.sessions.authenticate(token).await?;
        Ok(AuthedSession(record))
    }
}
