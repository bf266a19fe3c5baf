use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{info, warn};

use hk_telemetry::metrics::MetricsCollector;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BreakerError {
    /// The breaker is open; the call was rejected without running.
    #[error("breaker `{name}` is open – retry in {retry_in:?}")]
    Open { name: String, retry_in: Duration },

    /// The protected call exceeded its own deadline.
    #[error("call through breaker timed out after {0:?}")]
    Timeout(Duration),

    /// The protected call failed with its own error.
    #[error("inner error: {0}")]
    Inner(String),
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation – all calls pass through.
    Closed,
    /// Too many failures – calls are rejected immediately.
    Open,
    /// The open timeout elapsed – probes are allowed through.
    HalfOpen,
}

impl BreakerState {
    /// Gauge encoding: 0 closed, 1 open, 2 half-open.
    pub fn as_gauge(&self) -> i64 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::Open => 1,
            BreakerState::HalfOpen => 2,
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive expected failures before the breaker opens.
    pub failure_threshold: u32,
    /// How long the breaker stays open before permitting a probe.
    pub open_timeout: Duration,
    /// Deadline for an individual protected call.
    pub call_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(60),
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl BreakerConfig {
    pub fn new(failure_threshold: u32, open_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            open_timeout,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Counters snapshot
// ---------------------------------------------------------------------------

/// Point-in-time view of one breaker, for the health and metrics surfaces.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: String,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub total_calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejected: u64,
    pub success_rate: f64,
    pub retry_in_ms: u64,
}

// ---------------------------------------------------------------------------
// Inner state (behind Mutex)
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    next_attempt: Option<Instant>,
    total_calls: u64,
    successes: u64,
    failures: u64,
    rejected: u64,
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

/// Per-target failure isolation.
///
/// Closed on construction. Each expected failure increments the streak and a
/// success resets it; at the threshold the breaker opens for `open_timeout`,
/// rejecting calls outright. The first call after the timeout goes half-open:
/// a success closes the breaker, a failure re-opens it with a fresh timeout.
/// Concurrent half-open probes are permitted; their outcomes apply in
/// completion order.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: Arc<String>,
    config: BreakerConfig,
    inner: Arc<Mutex<Inner>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: Arc::new(name.into()),
            config,
            inner: Arc::new(Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                next_attempt: None,
                total_calls: 0,
                successes: 0,
                failures: 0,
                rejected: 0,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn state(&self) -> BreakerState {
        self.inner.lock().await.state
    }

    pub async fn failure_count(&self) -> u32 {
        self.inner.lock().await.failure_count
    }

    /// Execute `f` through the breaker, counting every error as expected.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.call_classified(f, |_| true).await
    }

    /// Execute `f` through the breaker. `is_expected` decides whether an
    /// error counts toward the failure streak; unexpected errors pass through
    /// untouched so validation mistakes cannot open the breaker.
    pub async fn call_classified<F, Fut, T, E>(
        &self,
        f: F,
        is_expected: impl Fn(&E) -> bool,
    ) -> Result<T, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        // --- pre-flight check ---
        {
            let mut guard = self.inner.lock().await;
            guard.total_calls += 1;
            match guard.state {
                BreakerState::Open => {
                    let retry_in = match guard.next_attempt {
                        Some(at) => at.saturating_duration_since(Instant::now()),
                        None => self.config.open_timeout,
                    };
                    if retry_in.is_zero() {
                        info!(breaker = %self.name, "transitioning Open -> HalfOpen");
                        guard.state = BreakerState::HalfOpen;
                    } else {
                        guard.rejected += 1;
                        return Err(BreakerError::Open {
                            name: self.name.to_string(),
                            retry_in,
                        });
                    }
                }
                BreakerState::Closed | BreakerState::HalfOpen => { /* allow */ }
            }
        }

        // --- execute with timeout ---
        match tokio::time::timeout(self.config.call_timeout, f()).await {
            Ok(Ok(value)) => {
                self.record_success().await;
                Ok(value)
            }
            Ok(Err(e)) => {
                if is_expected(&e) {
                    self.record_failure().await;
                }
                Err(BreakerError::Inner(e.to_string()))
            }
            Err(_elapsed) => {
                // Deadline misses are always expected failures.
                self.record_failure().await;
                Err(BreakerError::Timeout(self.config.call_timeout))
            }
        }
    }

    // ----- helpers -----

    async fn record_success(&self) {
        let mut guard = self.inner.lock().await;
        guard.successes += 1;
        guard.failure_count = 0;
        if guard.state == BreakerState::HalfOpen {
            info!(breaker = %self.name, "recovered – transitioning HalfOpen -> Closed");
            guard.state = BreakerState::Closed;
            guard.next_attempt = None;
        }
    }

    async fn record_failure(&self) {
        let mut guard = self.inner.lock().await;
        guard.failures += 1;
        guard.failure_count += 1;

        match guard.state {
            BreakerState::Closed => {
                if guard.failure_count >= self.config.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = guard.failure_count,
                        "transitioning Closed -> Open"
                    );
                    guard.state = BreakerState::Open;
                    guard.next_attempt = Some(Instant::now() + self.config.open_timeout);
                }
            }
            BreakerState::HalfOpen => {
                warn!(breaker = %self.name, "probe failed – transitioning HalfOpen -> Open");
                guard.state = BreakerState::Open;
                guard.next_attempt = Some(Instant::now() + self.config.open_timeout);
            }
            BreakerState::Open => { /* already open */ }
        }
    }

    /// Manually reset to the closed state.
    pub async fn reset(&self) {
        let mut guard = self.inner.lock().await;
        guard.state = BreakerState::Closed;
        guard.failure_count = 0;
        guard.next_attempt = None;
        info!(breaker = %self.name, "manually reset");
    }

    /// Manually force the breaker open for a full timeout.
    pub async fn force_open(&self) {
        let mut guard = self.inner.lock().await;
        guard.state = BreakerState::Open;
        guard.next_attempt = Some(Instant::now() + self.config.open_timeout);
        warn!(breaker = %self.name, "manually opened");
    }

    pub async fn snapshot(&self) -> BreakerSnapshot {
        let guard = self.inner.lock().await;
        let success_rate = if guard.total_calls > 0 {
            guard.successes as f64 / guard.total_calls as f64
        } else {
            0.0
        };
        BreakerSnapshot {
            name: self.name.to_string(),
            state: match guard.state {
                BreakerState::Closed => "closed",
                BreakerState::Open => "open",
                BreakerState::HalfOpen => "half_open",
            }
            .to_string(),
            failure_count: guard.failure_count,
            failure_threshold: self.config.failure_threshold,
            total_calls: guard.total_calls,
            successes: guard.successes,
            failures: guard.failures,
            rejected: guard.rejected,
            success_rate,
            retry_in_ms: guard
                .next_attempt
                .map(|at| at.saturating_duration_since(Instant::now()).as_millis() as u64)
                .unwrap_or(0),
        }
    }
}

// ---------------------------------------------------------------------------
// BreakerRegistry
// ---------------------------------------------------------------------------

/// Process-local registry keyed by breaker name.
///
/// `get_or_create` guarantees a single breaker per target, so every caller
/// protecting the same downstream shares one failure streak.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    breakers: DashMap<String, CircuitBreaker>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the platform's protected paths.
    pub fn with_platform_defaults() -> Self {
        let registry = Self::new();
        registry.get_or_create(
            "ml_pipeline",
            BreakerConfig::new(3, Duration::from_secs(30)),
        );
        registry.get_or_create(
            "geo_optimizer",
            BreakerConfig::new(5, Duration::from_secs(60)),
        );
        registry.get_or_create("storage", BreakerConfig::new(3, Duration::from_secs(120)));
        for adapter in ["directory_api", "geocoding_api", "payments_api"] {
            registry.get_or_create(adapter, BreakerConfig::new(5, Duration::from_secs(90)));
        }
        for channel in ["messenger", "email", "sms"] {
            registry.get_or_create(channel, BreakerConfig::new(5, Duration::from_secs(60)));
        }
        registry
    }

    /// Fetch the breaker for `name`, creating it with `config` on first use.
    pub fn get_or_create(&self, name: &str, config: BreakerConfig) -> CircuitBreaker {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                info!(breaker = name, "created circuit breaker");
                CircuitBreaker::new(name, config)
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<CircuitBreaker> {
        self.breakers.get(name).map(|b| b.clone())
    }

    pub async fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut out = Vec::with_capacity(self.breakers.len());
        for entry in self.breakers.iter() {
            out.push(entry.value().snapshot().await);
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Breakers currently not closed.
    pub async fn unhealthy(&self) -> Vec<String> {
        let mut out = Vec::new();
        for entry in self.breakers.iter() {
            if entry.value().state().await != BreakerState::Closed {
                out.push(entry.key().clone());
            }
        }
        out.sort();
        out
    }

    pub async fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset().await;
        }
        info!("all circuit breakers reset");
    }

    /// Mirror breaker states into gauges (`breaker_state{name=...}`).
    pub async fn export_gauges(&self, metrics: &MetricsCollector) {
        for entry in self.breakers.iter() {
            let state = entry.value().state().await;
            metrics.set_gauge_with("breaker_state", &[("name", entry.key())], state.as_gauge());
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
