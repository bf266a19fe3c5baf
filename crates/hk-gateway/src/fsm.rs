//! The gateway's finite state machine.
//!
//! Each conversational flow is a set of named states with one handler per
//! state. Handlers receive the session context and the incoming message and
//! answer with replies plus an explicit transition; they never mutate the
//! session behind the runtime's back.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use hk_core::types::{Role, UserId};

use crate::session::ConversationSession;

// ---------------------------------------------------------------------------
// Messages and context
// ---------------------------------------------------------------------------

/// One inbound message from the messenger platform.
#[derive(Debug, Clone)]
pub struct Incoming {
    pub external_id: String,
    pub text: String,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub language: Option<String>,
}

/// Everything a handler may read, plus the outgoing reply buffer.
pub struct HandlerContext<'a> {
    pub session: &'a ConversationSession,
    pub user_id: Option<UserId>,
    pub role: Option<Role>,
    pub language: String,
    pub access_token: Option<String>,
    replies: Vec<String>,
}

impl<'a> HandlerContext<'a> {
    pub fn for_session(session: &'a ConversationSession) -> Self {
        Self {
            user_id: session.auth.user_id,
            role: session.auth.role,
            language: session.language.clone(),
            access_token: session.auth.access_token.clone(),
            session,
            replies: Vec::new(),
        }
    }

    /// Queue a reply to the user.
    pub fn reply(&mut self, text: impl Into<String>) {
        self.replies.push(text.into());
    }

    pub fn into_replies(self) -> Vec<String> {
        self.replies
    }
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

/// What the handler wants to happen to the session state.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Remain in the current state (payload untouched).
    Stay,
    /// Move to another state with a fresh payload.
    To(String, Map<String, Value>),
    /// Abort the flow and return to the main menu.
    Cancel,
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerFault {
    /// The handler hit a downstream problem; the state stays put and the
    /// user gets a generic apology.
    #[error("handler failed: {0}")]
    Downstream(String),
}

// ---------------------------------------------------------------------------
// Handler trait and registry
// ---------------------------------------------------------------------------

#[async_trait]
pub trait StateHandler: Send + Sync {
    /// The state key this handler owns.
    fn state(&self) -> &'static str;

    async fn handle(
        &self,
        ctx: &mut HandlerContext<'_>,
        message: &Incoming,
    ) -> Result<Transition, HandlerFault>;
}

/// State key → handler map, fixed at startup.
#[derive(Default)]
pub struct FsmRegistry {
    handlers: HashMap<&'static str, Arc<dyn StateHandler>>,
}

impl FsmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn StateHandler>) {
        self.handlers.insert(handler.state(), handler);
    }

    pub fn get(&self, state_key: &str) -> Option<Arc<dyn StateHandler>> {
        self.handlers.get(state_key).cloned()
    }

    pub fn states(&self) -> Vec<&'static str> {
        let mut states: Vec<_> = self.handlers.keys().copied().collect();
        states.sort_unstable();
        states
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
