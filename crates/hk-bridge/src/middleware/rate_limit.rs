//! Rate-limiting middleware over the shared limiter.
//!
//! Every request is checked against the platform's named limit set for the
//! calling client (forwarded IP, falling back to "unknown"). Health and
//! metrics endpoints are exempt so probes keep working under pressure.
//! When a limit trips, the response is 429 with a `Retry-After` header;
//! when the substrate is down, the limiter inside fails open and requests
//! pass.

use axum::{
    body::Body,
    extract::Request,
    http::{Response, StatusCode},
    response::IntoResponse,
};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::warn;

use hk_harness::rate_limiter::{RateLimit, RateLimiter};

const EXEMPT_PATHS: &[&str] = &["/health", "/health/detailed", "/ready", "/metrics"];

// ---------------------------------------------------------------------------
// RateLimitLayer
// ---------------------------------------------------------------------------

/// A [`tower::Layer`] that wraps services with [`RateLimitMiddleware`].
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter>,
    limits: Arc<Vec<(&'static str, RateLimit)>>,
}

impl RateLimitLayer {
    pub fn new(limiter: Arc<RateLimiter>, limits: Vec<(&'static str, RateLimit)>) -> Self {
        Self {
            limiter,
            limits: Arc::new(limits),
        }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitMiddleware {
            inner,
            limiter: self.limiter.clone(),
            limits: self.limits.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// RateLimitMiddleware
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RateLimitMiddleware<S> {
    inner: S,
    limiter: Arc<RateLimiter>,
    limits: Arc<Vec<(&'static str, RateLimit)>>,
}

/// Client identity: forwarded IP chain first, then the direct peer header.
fn client_identity(req: &Request<Body>) -> String {
    req.headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string())
        .or_else(|| {
            req.headers()
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

impl<S> Service<Request<Body>> for RateLimitMiddleware<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let limiter = self.limiter.clone();
        let limits = self.limits.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            if EXEMPT_PATHS.contains(&req.uri().path()) {
                return inner.call(req).await;
            }

            let client = client_identity(&req);
            let decision = limiter.check_named(&client, &limits).await;

            if decision.allowed {
                inner.call(req).await
            } else {
                let retry_after = decision
                    .retry_after
                    .map(|d| d.as_secs().max(1))
                    .unwrap_or(1);
                warn!(
                    client,
                    limit = decision.limited_by.as_deref().unwrap_or("unknown"),
                    retry_after,
                    "request rate limited"
                );
                let resp = (
                    StatusCode::TOO_MANY_REQUESTS,
                    [("Retry-After", retry_after.to_string())],
                    axum::Json(serde_json::json!({
                        "error": "rate_limited",
                        "limit": decision.limited_by,
                        "retry_after": retry_after,
                    })),
                )
                    .into_response();
                Ok(resp)
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
