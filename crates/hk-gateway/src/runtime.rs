//! The gateway runtime: message intake, token renewal, FSM dispatch.
//!
//! All work for one user is serialised through a per-user async lock, so FSM
//! transitions for a session apply in arrival order; different users proceed
//! in parallel.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use hk_core::types::{ExternalId, Role, UserId};
use hk_harness::shutdown::{ShutdownGuard, ShutdownSignal};
use hk_telemetry::metrics::global_metrics;

use crate::fsm::{FsmRegistry, HandlerContext, Incoming, Transition};
use crate::session::{
    ConversationSession, GatewaySessionStore, SessionAuth, SessionStoreError,
};

/// The one command every flow honours regardless of state.
const CANCEL_COMMAND: &str = "/cancel";

// ---------------------------------------------------------------------------
// Auth client seam
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub access_token: String,
    pub expires_at: chrono::DateTime<Utc>,
    pub user_id: UserId,
    pub role: Role,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthClientError {
    #[error("auth service rejected the identity")]
    Rejected,

    #[error("auth service unavailable: {0}")]
    Unavailable(String),
}

/// The gateway's line to the auth service. User-token validation lives there;
/// the gateway only ever asks for a token for a messenger identity it has
/// already verified at the transport level.
#[async_trait::async_trait]
pub trait AuthClient: Send + Sync {
    async fn issue_token(&self, external_id: &ExternalId) -> Result<IssuedToken, AuthClientError>;
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Store(#[from] SessionStoreError),

    #[error("authentication failed")]
    Auth(#[from] AuthClientError),
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

pub struct GatewayRuntime {
    sessions: Arc<dyn GatewaySessionStore>,
    registry: FsmRegistry,
    auth: Arc<dyn AuthClient>,
    /// Per-user serialisation locks, created on first contact.
    locks: DashMap<String, Arc<Mutex<()>>>,
    session_ttl: Duration,
    token_renewal_window: Duration,
    default_language: String,
}

impl GatewayRuntime {
    pub fn new(
        sessions: Arc<dyn GatewaySessionStore>,
        registry: FsmRegistry,
        auth: Arc<dyn AuthClient>,
        session_ttl: StdDuration,
        token_renewal_window: StdDuration,
        default_language: impl Into<String>,
    ) -> Self {
        Self {
            sessions,
            registry,
            auth,
            locks: DashMap::new(),
            session_ttl: Duration::from_std(session_ttl)
                .unwrap_or_else(|_| Duration::hours(24)),
            token_renewal_window: Duration::from_std(token_renewal_window)
                .unwrap_or_else(|_| Duration::minutes(5)),
            default_language: default_language.into(),
        }
    }

    fn user_lock(&self, external_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(external_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Handle one inbound message end to end; returns the replies to send.
    pub async fn handle_message(&self, message: Incoming) -> Result<Vec<String>, GatewayError> {
        let lock = self.user_lock(&message.external_id);
        let _serialised = lock.lock().await;

        global_metrics().increment_counter(
            "messages_total",
            &[("kind", if message.text.starts_with('/') { "command" } else { "text" })],
        );

        let external_id = ExternalId(message.external_id.clone());
        let mut session = self.load_or_create(&external_id, &message).await?;

        // Renew the cached token when absent or about to lapse.
        if session.needs_token_renewal(self.token_renewal_window) {
            match self.auth.issue_token(&external_id).await {
                Ok(token) => {
                    debug!(user = %external_id, "access token renewed");
                    session.set_auth(SessionAuth {
                        access_token: Some(token.access_token),
                        token_expires_at: Some(token.expires_at),
                        user_id: Some(token.user_id),
                        role: Some(token.role),
                    });
                }
                Err(AuthClientError::Rejected) => {
                    // Unknown identity keeps talking to the public flows.
                    session.set_auth(SessionAuth::default());
                }
                Err(e) => {
                    warn!(user = %external_id, error = %e, "token renewal failed");
                    return Err(e.into());
                }
            }
        }

        // Cancellation wins over whatever state the user is in.
        if message.text.trim() == CANCEL_COMMAND {
            session.clear_to_main_menu();
            self.sessions.upsert(&session).await?;
            return Ok(vec!["Действие отменено.".to_string()]);
        }

        let handler = self
            .registry
            .get(&session.state_key)
            .or_else(|| self.registry.get(crate::session::MAIN_MENU));

        let mut replies = Vec::new();
        if let Some(handler) = handler {
            let mut ctx = HandlerContext::for_session(&session);
            match handler.handle(&mut ctx, &message).await {
                Ok(transition) => {
                    replies = ctx.into_replies();
                    match transition {
                        Transition::Stay => {}
                        Transition::To(state, payload) => session.enter_state(&state, payload),
                        Transition::Cancel => session.clear_to_main_menu(),
                    }
                }
                Err(e) => {
                    warn!(user = %external_id, state = %session.state_key, error = %e,
                          "state handler failed");
                    replies = vec!["Что-то пошло не так, попробуйте ещё раз.".to_string()];
                }
            }
        } else {
            warn!(state = %session.state_key, "no handler for state");
        }

        self.sessions.upsert(&session).await?;
        Ok(replies)
    }

    async fn load_or_create(
        &self,
        external_id: &ExternalId,
        message: &Incoming,
    ) -> Result<ConversationSession, GatewayError> {
        let mut session = match self.sessions.fetch(external_id).await? {
            Some(existing) if existing.active => existing,
            // Inactive sessions are invisible: the user starts over.
            _ => {
                info!(user = %external_id, "conversation session created");
                ConversationSession::new(
                    external_id.clone(),
                    self.default_language.clone(),
                    self.session_ttl,
                )
            }
        };

        session.update_profile(
            message.username.as_deref(),
            message.first_name.as_deref(),
            message.last_name.as_deref(),
        );
        if let Some(language) = &message.language {
            session.set_language(language);
        }
        session.touch(self.session_ttl);
        Ok(session)
    }

    /// One sweeper pass; refreshes the active-session gauge.
    pub async fn sweep_expired(&self) -> Result<u64, GatewayError> {
        let flipped = self.sessions.deactivate_expired(Utc::now()).await?;
        if flipped > 0 {
            info!(count = flipped, "conversation sessions retired");
        }
        if let Ok(active) = self.sessions.active_count().await {
            global_metrics().set_gauge("gateway_active_sessions", active as i64);
        }
        Ok(flipped)
    }
}

// ---------------------------------------------------------------------------
// Sweeper loop
// ---------------------------------------------------------------------------

pub async fn run_gateway_sweeper(
    runtime: Arc<GatewayRuntime>,
    interval: StdDuration,
    shutdown: ShutdownSignal,
) {
    let _guard = ShutdownGuard::new(shutdown.clone());
    let mut rx = shutdown.subscribe();

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                if let Err(e) = runtime.sweep_expired().await {
                    warn!(error = %e, "gateway sweep failed");
                }
            }
            _ = rx.recv() => {
                debug!("gateway sweeper draining");
                return;
            }
        }
    }
}
