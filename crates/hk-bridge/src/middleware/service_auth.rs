//! Service-to-service authentication middleware.
//!
//! Protected internal routes accept either trust mechanism:
//! - `X-Service-Name` + `X-Service-API-Key` (static key, constant-time)
//! - `X-Service-Name` + `X-Service-Signature` + `X-Service-Timestamp`
//!   (HMAC over method, path, timestamp, and body hash)
//!
//! The signed variant needs the raw body, so the middleware buffers it and
//! reconstructs the request afterwards. On success the authenticated peer is
//! inserted into request extensions as [`ServicePeer`]; a layer configured
//! with a required permission enforces it here, uniformly, for every route
//! underneath.

use axum::{
    body::Body,
    extract::Request,
    http::Response,
    response::IntoResponse,
};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

use hk_core::types::ServiceName;
use hk_harness::service_keys::{Permission, ServiceKeyring, TrustError};
use hk_harness::signing;

use crate::api_error::ApiError;

/// The authenticated peer, available to handlers via `Extension`.
#[derive(Debug, Clone, Copy)]
pub struct ServicePeer(pub ServiceName);

// ---------------------------------------------------------------------------
// ServiceAuthLayer
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ServiceAuthLayer {
    keyring: Arc<ServiceKeyring>,
    required: Option<Permission>,
}

impl ServiceAuthLayer {
    pub fn new(keyring: Arc<ServiceKeyring>) -> Self {
        Self {
            keyring,
            required: None,
        }
    }

    /// Additionally require `permission` from the authenticated peer.
    pub fn require(mut self, permission: Permission) -> Self {
        self.required = Some(permission);
        self
    }
}

impl<S> Layer<S> for ServiceAuthLayer {
    type Service = ServiceAuthMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ServiceAuthMiddleware {
            inner,
            keyring: self.keyring.clone(),
            required: self.required,
        }
    }
}

// ---------------------------------------------------------------------------
// ServiceAuthMiddleware
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ServiceAuthMiddleware<S> {
    inner: S,
    keyring: Arc<ServiceKeyring>,
    required: Option<Permission>,
}

fn header<'a>(req: &'a Request<Body>, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

impl<S> Service<Request<Body>> for ServiceAuthMiddleware<S>
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
        let keyring = self.keyring.clone();
        let required = self.required;
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let Some(name) = header(&req, "x-service-name").map(str::to_string) else {
                return Ok(ApiError::Unauthorized { attempts_remaining: None }.into_response());
            };

            let authenticated: Result<(ServiceName, Request<Body>), TrustError> =
                if let Some(api_key) = header(&req, "x-service-api-key").map(str::to_string) {
                    keyring.authenticate(&name, &api_key).map(|peer| (peer, req))
                } else if let (Some(sig), Some(ts)) = (
                    header(&req, "x-service-signature").map(str::to_string),
                    header(&req, "x-service-timestamp").map(str::to_string),
                ) {
                    match ts.parse::<i64>() {
                        Ok(timestamp) => {
                            // Signature covers the body: buffer and rebuild.
                            let (parts, body) = req.into_parts();
                            let bytes = match axum::body::to_bytes(body, usize::MAX).await {
                                Ok(bytes) => bytes,
                                Err(_) => {
                                    return Ok(ApiError::BadRequest("unreadable body".into())
                                        .into_response())
                                }
                            };
                            let method = parts.method.as_str().to_string();
                            let path = parts.uri.path().to_string();
                            let verified = keyring.verify_signed(
                                &name,
                                &method,
                                &path,
                                &bytes,
                                timestamp,
                                &sig,
                                signing::unix_now(),
                            );
                            verified.map(|peer| {
                                (peer, Request::from_parts(parts, Body::from(bytes)))
                            })
                        }
                        Err(_) => Err(TrustError::InvalidCredentials),
                    }
                } else {
                    Err(TrustError::InvalidCredentials)
                };

            match authenticated {
                Ok((peer, mut req)) => {
                    if let Some(permission) = required {
                        if let Err(e) = keyring.require(peer, permission) {
                            return Ok(ApiError::from(e).into_response());
                        }
                    }
                    req.extensions_mut().insert(ServicePeer(peer));
                    inner.call(req).await
                }
                Err(e) => Ok(ApiError::from(e).into_response()),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Extension, Router};
    use tower::ServiceExt;

    fn keyring() -> Arc<ServiceKeyring> {
        let lookup = |key: &str| match key {
            "SERVICE_SHARED_SECRET" => Some("shared".to_string()),
            "SERVICE_KEY_DISPATCH_SERVICE" => Some("dispatch-key".to_string()),
            _ => None,
        };
        let config = hk_core::config::Config::from_lookup(&lookup).unwrap();
        Arc::new(ServiceKeyring::from_config(&config.security))
    }

    async fn peer_echo(Extension(peer): Extension<ServicePeer>) -> String {
        peer.0.to_string()
    }

    fn router(layer: ServiceAuthLayer) -> Router {
        Router::new()
            .route("/internal/pool", get(peer_echo))
            .route("/internal/assign", post(peer_echo))
            .layer(layer)
    }

    #[tokio::test]
    async fn static_key_passes_and_exposes_peer() {
        let app = router(ServiceAuthLayer::new(keyring()));
        let req = Request::builder()
            .uri("/internal/pool")
            .header("X-Service-Name", "dispatch-service")
            .header("X-Service-API-Key", "dispatch-key")
            .body(Body::empty())
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"dispatch-service");
    }

    #[tokio::test]
    async fn wrong_key_is_401() {
        let app = router(ServiceAuthLayer::new(keyring()));
        let req = Request::builder()
            .uri("/internal/pool")
            .header("X-Service-Name", "dispatch-service")
            .header("X-Service-API-Key", "wrong")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_service_is_401() {
        let app = router(ServiceAuthLayer::new(keyring()));
        let req = Request::builder()
            .uri("/internal/pool")
            .header("X-Service-Name", "billing-service")
            .header("X-Service-API-Key", "shared")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn missing_headers_are_401() {
        let app = router(ServiceAuthLayer::new(keyring()));
        let req = Request::builder()
            .uri("/internal/pool")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn signed_request_verifies_body() {
        let ring = keyring();
        let app = router(ServiceAuthLayer::new(ring.clone()));

        let body = br#"{"executor_id":7}"#;
        let (sig, ts) = ring.sign_outgoing(
            ServiceName::DispatchService,
            "POST",
            "/internal/assign",
            body,
        );

        let req = Request::builder()
            .method("POST")
            .uri("/internal/assign")
            .header("X-Service-Name", "dispatch-service")
            .header("X-Service-Signature", sig.clone())
            .header("X-Service-Timestamp", ts.to_string())
            .body(Body::from(&body[..]))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        // The same signature over a different body fails.
        let req = Request::builder()
            .method("POST")
            .uri("/internal/assign")
            .header("X-Service-Name", "dispatch-service")
            .header("X-Service-Signature", sig)
            .header("X-Service-Timestamp", ts.to_string())
            .body(Body::from(r#"{"executor_id":8}"#))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn permission_is_enforced_per_layer() {
        // Dispatch may manage assignments but not upload media.
        let allowed = router(ServiceAuthLayer::new(keyring()).require(Permission::ManageAssignments));
        let req = Request::builder()
            .uri("/internal/pool")
            .header("X-Service-Name", "dispatch-service")
            .header("X-Service-API-Key", "dispatch-key")
            .body(Body::empty())
            .unwrap();
        assert_eq!(allowed.oneshot(req).await.unwrap().status(), StatusCode::OK);

        let denied = router(ServiceAuthLayer::new(keyring()).require(Permission::UploadMedia));
        let req = Request::builder()
            .uri("/internal/pool")
            .header("X-Service-Name", "dispatch-service")
            .header("X-Service-API-Key", "dispatch-key")
            .body(Body::empty())
            .unwrap();
        assert_eq!(denied.oneshot(req).await.unwrap().status(), StatusCode::FORBIDDEN);
    }
}
