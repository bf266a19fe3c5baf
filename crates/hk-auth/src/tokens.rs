//! Access/refresh token pairs.
//!
//! Tokens are JWTs bound to a session id. Peer services never validate them
//! directly — only the auth service holds the signing secret; everyone else
//! asks it (or the gateway hands identity over on a signed channel).

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use hk_core::types::UserId;

use crate::AuthError;

// ---------------------------------------------------------------------------
// Claims
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: i64,
    /// Session id the token is bound to.
    pub sid: String,
    /// "access" or "refresh".
    pub kind: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Access,
    Refresh,
}

impl TokenKind {
    fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Access => "access",
            TokenKind::Refresh => "refresh",
        }
    }
}

/// A freshly issued pair.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// TokenService
// ---------------------------------------------------------------------------

pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenService {
    pub fn new(secret: &str, access_ttl: Duration, refresh_ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            access_ttl,
            refresh_ttl,
        }
    }

    /// Issue a fresh access/refresh pair bound to `session_id`.
    pub fn issue_pair(&self, user_id: UserId, session_id: &str) -> Result<TokenPair, AuthError> {
        let now = Utc::now();
        let access_expires_at = now + self.access_ttl;
        let refresh_expires_at = now + self.refresh_ttl;

        let access_token = self.issue(user_id, session_id, TokenKind::Access, now, access_expires_at)?;
        let refresh_token =
            self.issue(user_id, session_id, TokenKind::Refresh, now, refresh_expires_at)?;

        Ok(TokenPair {
            access_token,
            refresh_token,
            access_expires_at,
            refresh_expires_at,
        })
    }

    fn issue(
        &self,
        user_id: UserId,
        session_id: &str,
        kind: TokenKind,
        iat: DateTime<Utc>,
        exp: DateTime<Utc>,
    ) -> Result<String, AuthError> {
        let claims = Claims {
            sub: user_id.0,
            sid: session_id.to_string(),
            kind: kind.as_str().to_string(),
            iat: iat.timestamp(),
            exp: exp.timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding).map_err(|_| AuthError::Crypto)
    }

    /// Validate a token of the expected kind and return its claims.
    pub fn validate(&self, token: &str, expected: TokenKind) -> Result<Claims, AuthError> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::default())
            .map_err(|_| AuthError::InvalidToken)?;
        if data.claims.kind != expected.as_str() {
            return Err(AuthError::InvalidToken);
        }
        Ok(data.claims)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
