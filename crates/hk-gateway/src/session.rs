//! Per-user conversational session state.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use hk_core::types::{ExternalId, Role, UserId};

/// The state every fresh session starts in, and the one cancellation
/// returns to.
pub const MAIN_MENU: &str = "main_menu";

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Authentication context cached on the session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionAuth {
    pub access_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub user_id: Option<UserId>,
    pub role: Option<Role>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSession {
    /// The messenger identity; unique per session.
    pub external_id: ExternalId,
    pub state_key: String,
    pub state_payload: Map<String, Value>,
    pub auth: SessionAuth,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub language: String,
    /// Bumps on every observable mutation; never decreases.
    pub version: u64,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
}

impl ConversationSession {
    pub fn new(external_id: ExternalId, language: impl Into<String>, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            external_id,
            state_key: MAIN_MENU.to_string(),
            state_payload: Map::new(),
            auth: SessionAuth::default(),
            username: None,
            first_name: None,
            last_name: None,
            language: language.into(),
            version: 1,
            last_activity: now,
            expires_at: now + ttl,
            active: true,
        }
    }

    fn bump(&mut self) {
        self.version += 1;
    }

    /// Record activity and push the expiry out when it has fallen behind.
    pub fn touch(&mut self, ttl: Duration) {
        let now = Utc::now();
        self.last_activity = now;
        if self.expires_at < now + ttl {
            self.expires_at = now + ttl;
        }
    }

    /// Change the display language. Observable, so the version bumps.
    pub fn set_language(&mut self, language: &str) {
        if self.language != language {
            self.language = language.to_string();
            self.bump();
        }
    }

    /// Replace the cached token after (re-)authentication.
    pub fn set_auth(&mut self, auth: SessionAuth) {
        self.auth = auth;
        self.bump();
    }

    /// Whether the cached token is missing or inside the renewal window.
    pub fn needs_token_renewal(&self, window: Duration) -> bool {
        match (&self.auth.access_token, self.auth.token_expires_at) {
            (Some(_), Some(expires_at)) => expires_at - Utc::now() < window,
            _ => true,
        }
    }

    /// Move the FSM to a new state with a payload.
    pub fn enter_state(&mut self, key: &str, payload: Map<String, Value>) {
        self.state_key = key.to_string();
        self.state_payload = payload;
        self.bump();
    }

    /// Cancel whatever flow is in progress and return to the main menu.
    pub fn clear_to_main_menu(&mut self) {
        self.enter_state(MAIN_MENU, Map::new());
    }

    /// Update profile fields from the incoming message. Not observable to
    /// handlers, so the version stays put.
    pub fn update_profile(
        &mut self,
        username: Option<&str>,
        first_name: Option<&str>,
        last_name: Option<&str>,
    ) {
        if let Some(username) = username {
            self.username = Some(username.to_string());
        }
        if let Some(first_name) = first_name {
            self.first_name = Some(first_name.to_string());
        }
        if let Some(last_name) = last_name {
            self.last_name = Some(last_name.to_string());
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SessionStoreError {
    #[error("gateway session store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait GatewaySessionStore: Send + Sync {
    /// Fetch by external id regardless of active flag.
    async fn fetch(
        &self,
        external_id: &ExternalId,
    ) -> Result<Option<ConversationSession>, SessionStoreError>;

    /// Insert or replace the session row.
    async fn upsert(&self, session: &ConversationSession) -> Result<(), SessionStoreError>;

    /// Deactivate sessions past their expiry; returns how many flipped.
    async fn deactivate_expired(&self, now: DateTime<Utc>) -> Result<u64, SessionStoreError>;

    async fn active_count(&self) -> Result<u64, SessionStoreError>;
}

/// In-process session store for tests and development mode.
#[derive(Default)]
pub struct MemoryGatewayStore {
    sessions: Mutex<HashMap<String, ConversationSession>>,
}

impl MemoryGatewayStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GatewaySessionStore for MemoryGatewayStore {
    async fn fetch(
        &self,
        external_id: &ExternalId,
    ) -> Result<Option<ConversationSession>, SessionStoreError> {
        let sessions = self.sessions.lock().expect("session lock poisoned");
        Ok(sessions.get(external_id.as_str()).cloned())
    }

    async fn upsert(&self, session: &ConversationSession) -> Result<(), SessionStoreError> {
        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        sessions.insert(session.external_id.0.clone(), session.clone());
        Ok(())
    }

    async fn deactivate_expired(&self, now: DateTime<Utc>) -> Result<u64, SessionStoreError> {
        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        let mut count = 0;
        for session in sessions.values_mut() {
            if session.active && session.is_expired(now) {
                session.active = false;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn active_count(&self) -> Result<u64, SessionStoreError> {
        let sessions = self.sessions.lock().expect("session lock poisoned");
        Ok(sessions.values().filter(|s| s.active).count() as u64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
