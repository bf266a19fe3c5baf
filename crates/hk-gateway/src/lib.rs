//! Conversational session core for the bot gateway.
//!
//! Every end user talking to the bot owns one [`session::ConversationSession`]:
//! the FSM state they are in, its payload, their cached access token, and a
//! monotonic version that bumps on every observable mutation. Message
//! handling is serialised per user, renews tokens through the auth service
//! inside the renewal window, and runs the handler registered for the
//! current state. A sweeper retires idle sessions.

pub mod fsm;
pub mod pg;
pub mod runtime;
pub mod session;
