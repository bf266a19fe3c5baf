//! Session lifecycle: creation under the per-user cap, activity extension,
//! refresh rotation, logout, and the background sweeper.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use rand::RngCore;
use subtle::ConstantTimeEq;
use tracing::{debug, info};

use hk_core::config::AuthSection;
use hk_core::types::{ExternalId, UserId};
use hk_harness::shutdown::{ShutdownGuard, ShutdownSignal};
use hk_telemetry::metrics::global_metrics;

use crate::store::{SessionRecord, SessionStore};
use crate::tokens::{TokenKind, TokenService};
use crate::AuthError;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Everything a client needs after login or refresh.
#[derive(Debug, Clone)]
pub struct SessionBundle {
    pub session_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: chrono::DateTime<Utc>,
    pub refresh_expires_at: chrono::DateTime<Utc>,
}

/// Client fingerprint attached to a session at creation.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub device_info: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

// ---------------------------------------------------------------------------
// SessionService
// ---------------------------------------------------------------------------

pub struct SessionService {
    store: Arc<dyn SessionStore>,
    tokens: Arc<TokenService>,
    config: AuthSection,
}

impl SessionService {
    pub fn new(store: Arc<dyn SessionStore>, tokens: Arc<TokenService>, config: AuthSection) -> Self {
        Self { store, tokens, config }
    }

    fn fresh_session_id() -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Create a session for a freshly authenticated user.
    ///
    /// The per-user cap is enforced first: when the user already holds the
    /// maximum, the oldest-activity sessions are deactivated to make room.
    pub async fn create_session(
        &self,
        user_id: UserId,
        external_id: ExternalId,
        client: ClientInfo,
    ) -> Result<SessionBundle, AuthError> {
        let active = self.store.active_for_user(user_id).await?;
        if active.len() >= self.config.max_sessions_per_user {
            let excess = active.len() + 1 - self.config.max_sessions_per_user;
            for stale in active.iter().take(excess) {
                self.store.deactivate(&stale.session_id).await?;
                debug!(user = %user_id, session = %stale.session_id, "trimmed excess session");
            }
        }

        let session_id = Self::fresh_session_id();
        let pair = self.tokens.issue_pair(user_id, &session_id)?;
        let now = Utc::now();

        let record = SessionRecord {
            session_id: session_id.clone(),
            user_id,
            external_id,
            access_token: pair.access_token.clone(),
            refresh_token: pair.refresh_token.clone(),
            created_at: now,
            expires_at: now + Duration::hours(self.config.session_expire_hours),
            refresh_expires_at: now + Duration::days(self.config.refresh_expire_days),
            last_activity: now,
            device_info: client.device_info,
            ip_address: client.ip_address,
            user_agent: client.user_agent,
            active: true,
        };
        self.store.insert(record).await?;
        info!(user = %user_id, session = %session_id, "session created");

        Ok(SessionBundle {
            session_id,
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            expires_at: now + Duration::hours(self.config.session_expire_hours),
            refresh_expires_at: now + Duration::days(self.config.refresh_expire_days),
        })
    }

    /// Fetch an active session. Inactive or expired sessions are never
    /// returned; an expired one is flipped inactive on the way.
    pub async fn get_active(&self, session_id: &str) -> Result<SessionRecord, AuthError> {
        let record = self
            .store
            .fetch(session_id)
            .await?
            .ok_or(AuthError::SessionInactive)?;
        if !record.active {
            return Err(AuthError::SessionInactive);
        }
        if record.expires_at < Utc::now() {
            self.store.deactivate(session_id).await?;
            return Err(AuthError::SessionInactive);
        }
        Ok(record)
    }

    /// Validate a bearer access token against its session and record the
    /// activity touch, extending the session when it nears expiry.
    pub async fn authenticate(&self, access_token: &str) -> Result<SessionRecord, AuthError> {
        let claims = self.tokens.validate(access_token, TokenKind::Access)?;
        let mut record = self.get_active(&claims.sid).await?;

        if !bool::from(record.access_token.as_bytes().ct_eq(access_token.as_bytes())) {
            return Err(AuthError::InvalidToken);
        }

        let now = Utc::now();
        record.last_activity = now;
        let renewal_window = Duration::from_std(self.config.session_renewal_window)
            .unwrap_or_else(|_| Duration::minutes(60));
        if record.expires_at - now < renewal_window {
            record.expires_at = now + Duration::hours(self.config.session_expire_hours);
            debug!(session = %record.session_id, "session lifetime extended");
        }
        self.store.update(&record).await?;
        Ok(record)
    }

    /// Exchange a refresh token for a new pair. The presented token must be
    /// the one stored on the active session; both tokens rotate atomically.
    pub async fn refresh(&self, refresh_token: &str) -> Result<SessionBundle, AuthError> {
        let claims = self.tokens.validate(refresh_token, TokenKind::Refresh)?;
        let mut record = self.get_active(&claims.sid).await?;

        if record.refresh_expires_at < Utc::now() {
            self.store.deactivate(&record.session_id).await?;
            return Err(AuthError::InvalidToken);
        }
        if !bool::from(record.refresh_token.as_bytes().ct_eq(refresh_token.as_bytes())) {
            return Err(AuthError::InvalidToken);
        }

        let pair = self.tokens.issue_pair(record.user_id, &record.session_id)?;
        let now = Utc::now();
        record.access_token = pair.access_token.clone();
        record.refresh_token = pair.refresh_token.clone();
        record.expires_at = now + Duration::hours(self.config.session_expire_hours);
        record.refresh_expires_at = now + Duration::days(self.config.refresh_expire_days);
        record.last_activity = now;
        self.store.update(&record).await?;

        Ok(SessionBundle {
            session_id: record.session_id,
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            expires_at: now + Duration::hours(self.config.session_expire_hours),
            refresh_expires_at: now + Duration::days(self.config.refresh_expire_days),
        })
    }

    /// Deactivate one session.
    pub async fn logout(&self, session_id: &str) -> Result<bool, AuthError> {
        Ok(self.store.deactivate(session_id).await?)
    }

    /// Deactivate all of a user's sessions, optionally keeping the one
    /// presenting the request.
    pub async fn logout_all(
        &self,
        user_id: UserId,
        except_session: Option<&str>,
    ) -> Result<u64, AuthError> {
        Ok(self.store.deactivate_all(user_id, except_session).await?)
    }

    /// One sweeper pass: flip expired sessions inactive, refresh the gauge.
    pub async fn sweep_expired(&self) -> Result<u64, AuthError> {
        let flipped = self.store.deactivate_expired(Utc::now()).await?;
        if flipped > 0 {
            info!(count = flipped, "expired sessions deactivated");
        }
        if let Ok(active) = self.store.active_count().await {
            global_metrics().set_gauge("active_sessions", active as i64);
        }
        Ok(flipped)
    }
}

// ---------------------------------------------------------------------------
// Sweeper loop
// ---------------------------------------------------------------------------

/// Timer-driven sweeper honouring shutdown. Jitter keeps replicas from
/// thundering the store in lockstep.
pub async fn run_session_sweeper(
    service: Arc<SessionService>,
    interval: StdDuration,
    shutdown: ShutdownSignal,
) {
    let _guard = ShutdownGuard::new(shutdown.clone());
    let mut rx = shutdown.subscribe();
    let jitter = StdDuration::from_millis(rand::random::<u64>() % 1_000);

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval + jitter) => {
                if let Err(e) = service.sweep_expired().await {
                    tracing::warn!(error = %e, "session sweep failed");
                }
            }
            _ = rx.recv() => {
                debug!("session sweeper draining");
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
