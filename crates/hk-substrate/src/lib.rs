//! Typed façade over the shared KV/queue substrate.
//!
//! Every service replica talks to one shared key-value store for the state
//! that must be visible cluster-wide: rate-limit windows, daily counters,
//! event streams, and fan-out channels. This crate hides the wire client
//! behind the [`Substrate`] trait so the rest of the workspace depends on
//! capabilities, not on a driver:
//! - atomic server-side sections (sliding-window probe, counter-with-TTL)
//! - bounded stream append and pub/sub fan-out
//! - plain get/set with TTL
//!
//! Two implementations ship: [`RedisSubstrate`] (pooled, deadline-bounded,
//! Lua-scripted) for deployments, and [`MemorySubstrate`] for tests and
//! development mode. Transient connectivity failures surface as
//! [`SubstrateError::Unavailable`]; callers decide fail-open (rate limiter)
//! versus fail-closed (credentials, trust).

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

mod memory;
mod redis_impl;
mod scripts;

pub use memory::MemorySubstrate;
pub use redis_impl::RedisSubstrate;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SubstrateError {
    /// The substrate could not be reached or the connection broke mid-call.
    #[error("substrate unavailable: {0}")]
    Unavailable(String),

    /// The call did not complete within its deadline.
    #[error("substrate call timed out after {0:?}")]
    Timeout(Duration),

    /// The substrate answered with something the façade cannot interpret.
    #[error("substrate protocol error: {0}")]
    Protocol(String),
}

impl SubstrateError {
    /// Whether this error means "the substrate is gone", as opposed to a
    /// caller mistake. Limiters fail open on these; trust checks fail closed.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, SubstrateError::Unavailable(_) | SubstrateError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, SubstrateError>;

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

/// Outcome of one atomic sliding-window probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowProbe {
    /// Whether the request was admitted (and its timestamp recorded).
    pub allowed: bool,
    /// Requests left in the window after this one, 0 when denied.
    pub remaining: u32,
    /// Milliseconds until the oldest recorded request leaves the window.
    pub reset_after_ms: u64,
}

/// A live subscription to one fan-out channel.
pub struct Subscription {
    receiver: mpsc::Receiver<String>,
}

impl Subscription {
    pub fn new(receiver: mpsc::Receiver<String>) -> Self {
        Self { receiver }
    }

    /// Next published payload, or `None` once the feed is closed.
    pub async fn next(&mut self) -> Option<String> {
        self.receiver.recv().await
    }

    /// Non-blocking poll used by tests.
    pub fn try_next(&mut self) -> Option<String> {
        self.receiver.try_recv().ok()
    }
}

// ---------------------------------------------------------------------------
// Substrate trait
// ---------------------------------------------------------------------------

/// The capabilities every service needs from the shared KV store.
#[async_trait]
pub trait Substrate: Send + Sync {
    /// Liveness probe.
    async fn ping(&self) -> Result<()>;

    /// Atomically trim the key's window to `[now - window, now]`, count, and
    /// either record `now` (when under `cap`) or report when retrying becomes
    /// legal. One indivisible server-side section.
    async fn sliding_window_probe(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        cap: u32,
        ttl: Duration,
    ) -> Result<WindowProbe>;

    /// Number of entries currently inside the window (admin/monitoring).
    async fn window_usage(&self, key: &str, now_ms: u64, window_ms: u64) -> Result<u64>;

    /// Atomic increment; the TTL is attached when the key is created.
    async fn counter_incr(&self, key: &str, ttl: Duration) -> Result<i64>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Delete a key; `true` when something was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Append to a capped stream, returning the entry id.
    async fn stream_append(
        &self,
        stream: &str,
        fields: &[(&str, &str)],
        maxlen: usize,
    ) -> Result<String>;

    /// Publish to a fan-out channel; returns the number of receivers.
    async fn publish(&self, channel: &str, payload: &str) -> Result<u64>;

    /// Subscribe to a fan-out channel.
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}

/// Margin added to window TTLs so a cell outlives its own window even under
/// clock skew between replicas.
pub const WINDOW_TTL_MARGIN: Duration = Duration::from_secs(60);
