//! Distributed sliding-window rate limiting.
//!
//! Limit state lives in the shared substrate, so a limit holds across every
//! replica of a service. Each check is one atomic server-side probe: trim the
//! window, count, admit-and-record or report the earliest legal retry. When
//! the substrate is unreachable the limiter fails OPEN — it exists to shed
//! load, and an outage must not take the platform down with it.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::warn;

use hk_core::config::RateLimitSection;
use hk_substrate::{Substrate, WINDOW_TTL_MARGIN};
use hk_telemetry::metrics::global_metrics;

const KEY_PREFIX: &str = "rate_limit";

// ---------------------------------------------------------------------------
// RateLimit
// ---------------------------------------------------------------------------

/// One named limit: a cap over a window, with an optional burst allowance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimit {
    pub max_requests: u32,
    pub window: Duration,
    /// Temporary spike allowance; the effective cap is `max(max, burst)`.
    pub burst: Option<u32>,
}

impl RateLimit {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            burst: None,
        }
    }

    pub fn per_second(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(1))
    }

    pub fn per_minute(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }

    pub fn per_hour(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(3600))
    }

    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst = Some(burst);
        self
    }

    /// The effective cap with burst folded in.
    pub fn cap(&self) -> u32 {
        self.burst.map_or(self.max_requests, |b| b.max(self.max_requests))
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// Outcome of a limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Requests left in the window (effective cap when failing open).
    pub remaining: u32,
    /// When the window fully resets.
    pub reset_after: Duration,
    /// How long to wait before retrying; set only when denied.
    pub retry_after: Option<Duration>,
    /// Which named limit denied the request, when composing several.
    pub limited_by: Option<String>,
}

impl RateLimitDecision {
    fn open(limit: &RateLimit) -> Self {
        Self {
            allowed: true,
            remaining: limit.cap(),
            reset_after: Duration::ZERO,
            retry_after: None,
            limited_by: None,
        }
    }
}

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

/// Shared-state rate limiter over the substrate.
pub struct RateLimiter {
    substrate: Arc<dyn Substrate>,
}

impl RateLimiter {
    pub fn new(substrate: Arc<dyn Substrate>) -> Self {
        Self { substrate }
    }

    fn cell_key(namespace: &str, identifier: &str) -> String {
        format!("{KEY_PREFIX}:{namespace}:{identifier}")
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Check a single limit for `(namespace, identifier)`.
    pub async fn check(
        &self,
        namespace: &str,
        identifier: &str,
        limit: &RateLimit,
    ) -> RateLimitDecision {
        let key = Self::cell_key(namespace, identifier);
        let window_ms = limit.window.as_millis() as u64;
        let ttl = limit.window + WINDOW_TTL_MARGIN;

        let probe = match self
            .substrate
            .sliding_window_probe(&key, Self::now_ms(), window_ms, limit.cap(), ttl)
            .await
        {
            Ok(probe) => probe,
            Err(e) => {
                // Shedding load is best-effort; an unreachable substrate must
                // not turn into a platform-wide denial of service.
                warn!(namespace, error = %e, "rate limiter failing open");
                global_metrics()
                    .increment_counter("rate_limiter_fail_open_total", &[("namespace", namespace)]);
                return RateLimitDecision::open(limit);
            }
        };

        let reset_after = Duration::from_millis(probe.reset_after_ms.min(window_ms));
        if probe.allowed {
            RateLimitDecision {
                allowed: true,
                remaining: probe.remaining,
                reset_after,
                retry_after: None,
                limited_by: None,
            }
        } else {
            global_metrics()
                .increment_counter("rate_limit_blocks_total", &[("namespace", namespace)]);
            RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_after,
                retry_after: Some(reset_after.max(Duration::from_secs(1))),
                limited_by: Some(namespace.to_string()),
            }
        }
    }

    /// Check several named limits in order; the first failing limit wins and
    /// its retry time is returned.
    pub async fn check_named(
        &self,
        identifier: &str,
        limits: &[(&str, RateLimit)],
    ) -> RateLimitDecision {
        let mut last = None;
        for (name, limit) in limits {
            let decision = self.check(name, identifier, limit).await;
            if !decision.allowed {
                return decision;
            }
            last = Some(decision);
        }
        last.unwrap_or_else(|| RateLimitDecision::open(&RateLimit::per_second(u32::MAX)))
    }

    /// Admin override: clear the window cell for one caller.
    pub async fn reset(&self, namespace: &str, identifier: &str) -> bool {
        self.substrate
            .delete(&Self::cell_key(namespace, identifier))
            .await
            .unwrap_or(false)
    }

    /// Requests currently recorded in the caller's window.
    pub async fn usage(&self, namespace: &str, identifier: &str, limit: &RateLimit) -> Option<u64> {
        self.substrate
            .window_usage(
                &Self::cell_key(namespace, identifier),
                Self::now_ms(),
                limit.window.as_millis() as u64,
            )
            .await
            .ok()
    }
}

// ---------------------------------------------------------------------------
// Platform limit sets
// ---------------------------------------------------------------------------

/// The standard per-user limit set applied by the bot gateway and the public
/// APIs, built from configuration.
pub fn platform_limits(section: &RateLimitSection) -> Vec<(&'static str, RateLimit)> {
    vec![
        (
            "messages_per_minute",
            RateLimit::per_minute(section.messages_per_minute)
                .with_burst(section.messages_per_minute + 5),
        ),
        (
            "messages_per_hour",
            RateLimit::per_hour(section.messages_per_hour),
        ),
        (
            "commands_per_minute",
            RateLimit::per_minute(section.commands_per_minute)
                .with_burst(section.commands_per_minute + 2),
        ),
        (
            "api_calls_per_second",
            RateLimit::per_second(section.api_calls_per_second).with_burst(15),
        ),
        (
            "webhook_per_second",
            RateLimit::per_second(section.webhooks_per_second).with_burst(150),
        ),
    ]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
