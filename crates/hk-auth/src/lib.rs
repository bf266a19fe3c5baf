//! Credential and session core for the auth service.
//!
//! Owns everything that proves who a user is:
//! - Password verification with per-credential lockout (argon2; parameters
//!   travel inside each PHC hash so upgrades roll forward safely)
//! - MFA: TOTP with encrypted secrets at rest, plus single-use backup codes
//! - Session lifecycle: opaque ids, JWT token pairs, per-user session cap,
//!   activity extension, rotation on refresh, sweepers for expiry and locks
//! - Audit events for every authentication outcome (never secrets)
//!
//! Storage sits behind [`store::CredentialStore`] / [`store::SessionStore`]
//! traits with Postgres and in-memory implementations; services receive them
//! by injection so tests run against the memory store.

pub mod credentials;
pub mod crypto;
pub mod pg;
pub mod sessions;
pub mod store;
pub mod tokens;
pub mod totp;

use chrono::{DateTime, Utc};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Authentication failures surfaced to callers.
///
/// Variants deliberately do not distinguish "no such account" from "wrong
/// password" beyond what the credential flow itself requires.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("account locked until {until}")]
    Locked { until: DateTime<Utc> },

    #[error("password not set")]
    PasswordNotSet,

    #[error("invalid password")]
    InvalidPassword { attempts_remaining: u32 },

    #[error("password must be at least {min_length} characters")]
    WeakPassword { min_length: usize },

    #[error("invalid or expired token")]
    InvalidToken,

    #[error("session not found or inactive")]
    SessionInactive,

    #[error("multi-factor code rejected")]
    MfaRejected,

    #[error("conflict: {0}")]
    Conflict(String),

    /// The credential store could not be reached. Authentication fails
    /// closed: an outage is never a bypass.
    #[error("credential store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("crypto failure")]
    Crypto,
}

impl From<store::StoreError> for AuthError {
    fn from(e: store::StoreError) -> Self {
        match e {
            store::StoreError::Conflict(what) => AuthError::Conflict(what),
            store::StoreError::Unavailable(why) => AuthError::StoreUnavailable(why),
        }
    }
}
