//! Storage seams for credentials, sessions, and the audit trail.
//!
//! Services depend on these traits, not on a database. [`MemoryAuthStore`]
//! backs tests and development mode; [`crate::pg::PgAuthStore`] is the
//! deployment implementation.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hk_core::types::{ExternalId, UserId};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Unique-key collision (credential exists, duplicate session id).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The backing store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Per-user authentication material.
#[derive(Debug, Clone)]
pub struct CredentialRecord {
    pub user_id: UserId,
    pub external_id: ExternalId,
    /// PHC-format hash; parameters live inside the string.
    pub password_hash: Option<String>,
    pub failed_attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
    pub mfa_enabled: bool,
    /// TOTP secret, sealed by [`crate::crypto::SecretCipher`].
    pub totp_secret_sealed: Option<Vec<u8>>,
    /// Hashed single-use backup codes; consumed entries are removed.
    pub backup_code_hashes: Vec<String>,
    pub force_password_change: bool,
    pub last_login_at: Option<DateTime<Utc>>,
    pub password_set_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl CredentialRecord {
    pub fn new(user_id: UserId, external_id: ExternalId) -> Self {
        Self {
            user_id,
            external_id,
            password_hash: None,
            failed_attempts: 0,
            locked_until: None,
            mfa_enabled: false,
            totp_secret_sealed: None,
            backup_code_hashes: Vec::new(),
            force_password_change: false,
            last_login_at: None,
            password_set_at: None,
            created_at: Utc::now(),
        }
    }
}

/// An authenticated user presence.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    /// Opaque 256-bit token, hex-encoded.
    pub session_id: String,
    pub user_id: UserId,
    pub external_id: ExternalId,
    pub access_token: String,
    pub refresh_token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub device_info: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub active: bool,
}

/// One audit-trail entry. Never contains secrets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub user_id: Option<UserId>,
    pub external_id: Option<ExternalId>,
    pub event_type: String,
    pub status: AuditStatus,
    pub message: Option<String>,
    pub ip_address: Option<String>,
    pub session_id: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Success,
    Failure,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Insert a fresh credential row; conflicts when one already exists.
    async fn insert(&self, record: CredentialRecord) -> Result<()>;

    async fn fetch(&self, user_id: UserId) -> Result<Option<CredentialRecord>>;

    async fn fetch_by_external(&self, external_id: &ExternalId)
        -> Result<Option<CredentialRecord>>;

    /// Persist the full record (hash, counters, lock, MFA material) as one write.
    async fn update(&self, record: &CredentialRecord) -> Result<()>;

    /// Clear locks whose deadline has passed; returns how many were cleared.
    async fn clear_expired_locks(&self, now: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, record: SessionRecord) -> Result<()>;

    /// Fetch by id regardless of active flag; services filter.
    async fn fetch(&self, session_id: &str) -> Result<Option<SessionRecord>>;

    async fn update(&self, record: &SessionRecord) -> Result<()>;

    /// Active sessions for a user, oldest activity first.
    async fn active_for_user(&self, user_id: UserId) -> Result<Vec<SessionRecord>>;

    async fn deactivate(&self, session_id: &str) -> Result<bool>;

    /// Deactivate all of a user's sessions, optionally sparing one.
    async fn deactivate_all(&self, user_id: UserId, except: Option<&str>) -> Result<u64>;

    /// Mark sessions past `expires_at` inactive; returns how many flipped.
    async fn deactivate_expired(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Count of currently active sessions (metrics).
    async fn active_count(&self) -> Result<u64>;
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Record an audit event. Failures are logged by implementations, never
    /// propagated — auditing must not break the auth path itself.
    async fn record(&self, event: AuditEvent);
}

// ---------------------------------------------------------------------------
// MemoryAuthStore
// ---------------------------------------------------------------------------

/// In-process store used by tests and development mode.
#[derive(Default)]
pub struct MemoryAuthStore {
    credentials: Mutex<HashMap<i64, CredentialRecord>>,
    sessions: Mutex<HashMap<String, SessionRecord>>,
    audit: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuthStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Audit events recorded so far (test helper).
    pub fn audit_events(&self) -> Vec<AuditEvent> {
        self.audit.lock().expect("audit lock poisoned").clone()
    }
}

#[async_trait]
impl CredentialStore for MemoryAuthStore {
    async fn insert(&self, record: CredentialRecord) -> Result<()> {
        let mut map = self.credentials.lock().expect("credential lock poisoned");
        if map.contains_key(&record.user_id.0) {
            return Err(StoreError::Conflict(format!(
                "credentials for user {} already exist",
                record.user_id
            )));
        }
        map.insert(record.user_id.0, record);
        Ok(())
    }

    async fn fetch(&self, user_id: UserId) -> Result<Option<CredentialRecord>> {
        let map = self.credentials.lock().expect("credential lock poisoned");
        Ok(map.get(&user_id.0).cloned())
    }

    async fn fetch_by_external(
        &self,
        external_id: &ExternalId,
    ) -> Result<Option<CredentialRecord>> {
        let map = self.credentials.lock().expect("credential lock poisoned");
        Ok(map.values().find(|c| &c.external_id == external_id).cloned())
    }

    async fn update(&self, record: &CredentialRecord) -> Result<()> {
        let mut map = self.credentials.lock().expect("credential lock poisoned");
        map.insert(record.user_id.0, record.clone());
        Ok(())
    }

    async fn clear_expired_locks(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut map = self.credentials.lock().expect("credential lock poisoned");
        let mut cleared = 0;
        for record in map.values_mut() {
            if record.locked_until.is_some_and(|until| until <= now) {
                record.locked_until = None;
                record.failed_attempts = 0;
                cleared += 1;
            }
        }
        Ok(cleared)
    }
}

#[async_trait]
impl SessionStore for MemoryAuthStore {
    async fn insert(&self, record: SessionRecord) -> Result<()> {
        let mut map = self.sessions.lock().expect("session lock poisoned");
        if map.contains_key(&record.session_id) {
            return Err(StoreError::Conflict(format!(
                "session {} already exists",
                record.session_id
            )));
        }
        map.insert(record.session_id.clone(), record);
        Ok(())
    }

    async fn fetch(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let map = self.sessions.lock().expect("session lock poisoned");
        Ok(map.get(session_id).cloned())
    }

    async fn update(&self, record: &SessionRecord) -> Result<()> {
        let mut map = self.sessions.lock().expect("session lock poisoned");
        map.insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    async fn active_for_user(&self, user_id: UserId) -> Result<Vec<SessionRecord>> {
        let map = self.sessions.lock().expect("session lock poisoned");
        let mut sessions: Vec<_> = map
            .values()
            .filter(|s| s.user_id == user_id && s.active)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.last_activity.cmp(&b.last_activity));
        Ok(sessions)
    }

    async fn deactivate(&self, session_id: &str) -> Result<bool> {
        let mut map = self.sessions.lock().expect("session lock poisoned");
        match map.get_mut(session_id) {
            Some(session) if session.active => {
                session.active = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn deactivate_all(&self, user_id: UserId, except: Option<&str>) -> Result<u64> {
        let mut map = self.sessions.lock().expect("session lock poisoned");
        let mut count = 0;
        for session in map.values_mut() {
            if session.user_id == user_id
                && session.active
                && except != Some(session.session_id.as_str())
            {
                session.active = false;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn deactivate_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut map = self.sessions.lock().expect("session lock poisoned");
        let mut count = 0;
        for session in map.values_mut() {
            if session.active && session.expires_at < now {
                session.active = false;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn active_count(&self) -> Result<u64> {
        let map = self.sessions.lock().expect("session lock poisoned");
        Ok(map.values().filter(|s| s.active).count() as u64)
    }
}

#[async_trait]
impl AuditSink for MemoryAuthStore {
    async fn record(&self, event: AuditEvent) {
        self.audit.lock().expect("audit lock poisoned").push(event);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str, user: i64, last_activity: DateTime<Utc>) -> SessionRecord {
        SessionRecord {
            session_id: id.to_string(),
            user_id: UserId(user),
            external_id: ExternalId(user.to_string()),
            access_token: "at".into(),
            refresh_token: "rt".into(),
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::hours(24),
            refresh_expires_at: Utc::now() + chrono::Duration::days(7),
            last_activity,
            device_info: None,
            ip_address: None,
            user_agent: None,
            active: true,
        }
    }

    // Both stores live on one struct, so calls are written through the trait.

    #[tokio::test]
    async fn duplicate_credentials_conflict() {
        let store = MemoryAuthStore::new();
        let record = CredentialRecord::new(UserId(1), ExternalId("111".into()));
        CredentialStore::insert(&store, record.clone()).await.unwrap();
        assert!(matches!(
            CredentialStore::insert(&store, record).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn active_for_user_orders_by_activity() {
        let store = MemoryAuthStore::new();
        let now = Utc::now();
        SessionStore::insert(&store, session("b", 1, now - chrono::Duration::minutes(1)))
            .await
            .unwrap();
        SessionStore::insert(&store, session("a", 1, now - chrono::Duration::minutes(10)))
            .await
            .unwrap();
        SessionStore::insert(&store, session("other", 2, now)).await.unwrap();

        let sessions = store.active_for_user(UserId(1)).await.unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].session_id, "a");
        assert_eq!(sessions[1].session_id, "b");
    }

    #[tokio::test]
    async fn deactivate_all_spares_exception() {
        let store = MemoryAuthStore::new();
        let now = Utc::now();
        for id in ["s1", "s2", "s3"] {
            SessionStore::insert(&store, session(id, 1, now)).await.unwrap();
        }

        let count = store.deactivate_all(UserId(1), Some("s2")).await.unwrap();
        assert_eq!(count, 2);

        let active = store.active_for_user(UserId(1)).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].session_id, "s2");
    }

    #[tokio::test]
    async fn expired_sessions_flip_inactive() {
        let store = MemoryAuthStore::new();
        let now = Utc::now();
        let mut stale = session("old", 1, now);
        stale.expires_at = now - chrono::Duration::minutes(5);
        SessionStore::insert(&store, stale).await.unwrap();
        SessionStore::insert(&store, session("fresh", 1, now)).await.unwrap();

        assert_eq!(store.deactivate_expired(now).await.unwrap(), 1);
        assert_eq!(store.active_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn expired_locks_cleared() {
        let store = MemoryAuthStore::new();
        let mut record = CredentialRecord::new(UserId(1), ExternalId("111".into()));
        record.failed_attempts = 5;
        record.locked_until = Some(Utc::now() - chrono::Duration::minutes(1));
        CredentialStore::insert(&store, record).await.unwrap();

        assert_eq!(store.clear_expired_locks(Utc::now()).await.unwrap(), 1);
        let record = CredentialStore::fetch(&store, UserId(1)).await.unwrap().unwrap();
        assert_eq!(record.failed_attempts, 0);
        assert!(record.locked_until.is_none());
    }
}
