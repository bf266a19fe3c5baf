use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use hk_core::backoff::RetryPolicy;
use hk_core::types::ServiceName;
use hk_events::publisher::EventPublisher;
use hk_events::schema::SchemaRegistry;
use hk_events::webhook::{
    HandlerError, IntakeStatus, MemoryIntakeStore, SignaturePolicy, SourceConfig, SourceHandler,
    WebhookError, WebhookIngress, WebhookIntake,
};
use hk_substrate::MemorySubstrate;

// ---------------------------------------------------------------------------
// Test handler
// ---------------------------------------------------------------------------

/// Counts invocations; fails the first `fail_first` calls transiently.
struct CountingHandler {
    calls: AtomicU32,
    fail_first: u32,
    permanent: bool,
}

impl CountingHandler {
    fn succeeding() -> Arc<Self> {
        Arc::new(Self { calls: AtomicU32::new(0), fail_first: 0, permanent: false })
    }

    fn flaky(fail_first: u32) -> Arc<Self> {
        Arc::new(Self { calls: AtomicU32::new(0), fail_first, permanent: false })
    }

    fn rejecting() -> Arc<Self> {
        Arc::new(Self { calls: AtomicU32::new(0), fail_first: u32::MAX, permanent: true })
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceHandler for CountingHandler {
    async fn handle(&self, intake: &WebhookIntake) -> Result<Value, HandlerError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_first {
            if self.permanent {
                return Err(HandlerError::Permanent("rejected".into()));
            }
            return Err(HandlerError::Transient("downstream hiccup".into()));
        }
        Ok(json!({"processed": intake.declared_kind}))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn ingress_with(
    handler: Arc<CountingHandler>,
    policy: SignaturePolicy,
    max_attempts: u32,
) -> WebhookIngress {
    let substrate = Arc::new(MemorySubstrate::new());
    let publisher = Arc::new(EventPublisher::new(
        substrate,
        Arc::new(SchemaRegistry::platform()),
        ServiceName::IntegrationService,
    ));
    let mut ingress = WebhookIngress::new(
        Arc::new(MemoryIntakeStore::new()),
        publisher,
        true,
        1024 * 1024,
    )
    .with_retry_policy(RetryPolicy {
        max_attempts,
        initial_delay: Duration::from_millis(0),
        max_delay: Duration::from_millis(1),
        multiplier: 1.0,
        jitter: false,
    });
    ingress.register_source("payments", SourceConfig { policy, max_attempts }, handler);
    ingress
}

fn signed_headers(secret: &str, body: &[u8]) -> HashMap<String, String> {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    let mut headers = HashMap::new();
    headers.insert("x-payments-signature".to_string(), hex::encode(mac.finalize().into_bytes()));
    headers
}

fn payments_policy() -> SignaturePolicy {
    SignaturePolicy::HmacSha256 {
        header: "x-payments-signature".to_string(),
        secret: "whsec_test".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn completed_webhook_returns_handler_response() {
    let handler = CountingHandler::succeeding();
    let ingress = ingress_with(handler.clone(), SignaturePolicy::None, 3);
    let body = br#"{"event_id": "evt_1", "type": "payment.succeeded"}"#;

    let outcome = ingress
        .receive("payments", "payment.succeeded", HashMap::new(), body, true)
        .await
        .unwrap();

    assert_eq!(outcome.status, IntakeStatus::Completed);
    assert!(!outcome.replayed);
    assert_eq!(outcome.response.unwrap()["processed"], "payment.succeeded");
    assert_eq!(handler.call_count(), 1);
}

#[tokio::test]
async fn replay_returns_same_intake_without_reprocessing() {
    let handler = CountingHandler::succeeding();
    let ingress = ingress_with(handler.clone(), payments_policy(), 3);
    let body = br#"{"event_id": "evt_42", "type": "payment.succeeded"}"#;
    let headers = signed_headers("whsec_test", body);

    let first = ingress
        .receive("payments", "payment.succeeded", headers.clone(), body, true)
        .await
        .unwrap();
    let second = ingress
        .receive("payments", "payment.succeeded", headers, body, true)
        .await
        .unwrap();

    // Identical externally-observable responses, one completion.
    assert_eq!(first.intake_id, second.intake_id);
    assert_eq!(first.status, second.status);
    assert_eq!(first.response, second.response);
    assert!(second.replayed);
    assert_eq!(handler.call_count(), 1);
}

#[tokio::test]
async fn body_hash_key_when_payload_has_no_id() {
    let handler = CountingHandler::succeeding();
    let ingress = ingress_with(handler.clone(), SignaturePolicy::None, 3);
    let body = br#"{"type": "sheet.updated"}"#;

    let first = ingress
        .receive("payments", "sheet.updated", HashMap::new(), body, true)
        .await
        .unwrap();
    let second = ingress
        .receive("payments", "sheet.updated", HashMap::new(), body, true)
        .await
        .unwrap();

    assert_eq!(first.intake_id, second.intake_id);
    assert_eq!(handler.call_count(), 1);

    // A different body is a different delivery.
    let third = ingress
        .receive("payments", "sheet.updated", HashMap::new(), br#"{"type": "sheet.deleted"}"#, true)
        .await
        .unwrap();
    assert_ne!(third.intake_id, first.intake_id);
}

#[tokio::test]
async fn invalid_signature_rejected() {
    let handler = CountingHandler::succeeding();
    let ingress = ingress_with(handler.clone(), payments_policy(), 3);
    let body = br#"{"event_id": "evt_1"}"#;

    let mut headers = HashMap::new();
    headers.insert("x-payments-signature".to_string(), "deadbeef".to_string());
    let err = ingress
        .receive("payments", "payment.succeeded", headers, body, true)
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookError::SignatureInvalid));

    let err = ingress
        .receive("payments", "payment.succeeded", HashMap::new(), body, true)
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookError::SignatureMissing));
    assert_eq!(handler.call_count(), 0);
}

#[tokio::test]
async fn https_required_unless_opted_out() {
    let handler = CountingHandler::succeeding();
    let ingress = ingress_with(handler, SignaturePolicy::None, 3);
    let body = br#"{"event_id": "evt_1"}"#;

    let err = ingress
        .receive("payments", "payment.succeeded", HashMap::new(), body, false)
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookError::InsecureTransport));
}

#[tokio::test]
async fn oversized_payload_rejected() {
    let handler = CountingHandler::succeeding();
    let substrate = Arc::new(MemorySubstrate::new());
    let publisher = Arc::new(EventPublisher::new(
        substrate,
        Arc::new(SchemaRegistry::platform()),
        ServiceName::IntegrationService,
    ));
    let mut ingress =
        WebhookIngress::new(Arc::new(MemoryIntakeStore::new()), publisher, true, 16);
    ingress.register_source("payments", SourceConfig::default(), handler);

    let err = ingress
        .receive("payments", "k", HashMap::new(), br#"{"padding": "xxxxxxxxxxxxxxxx"}"#, true)
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookError::PayloadTooLarge { limit: 16 }));
}

#[tokio::test]
async fn transient_failure_retries_until_success() {
    let handler = CountingHandler::flaky(2);
    let ingress = ingress_with(handler.clone(), SignaturePolicy::None, 5);
    let body = br#"{"event_id": "evt_retry"}"#;

    let outcome = ingress
        .receive("payments", "payment.succeeded", HashMap::new(), body, true)
        .await
        .unwrap();
    assert_eq!(outcome.status, IntakeStatus::Failed);

    // Two retry passes: the second attempt still fails, the third lands.
    assert_eq!(ingress.retry_due(10).await.unwrap(), 1);
    assert_eq!(ingress.retry_due(10).await.unwrap(), 1);
    assert_eq!(ingress.retry_due(10).await.unwrap(), 0);
    assert_eq!(handler.call_count(), 3);

    // Replaying the original delivery now returns the completed result.
    let replay = ingress
        .receive("payments", "payment.succeeded", HashMap::new(), body, true)
        .await
        .unwrap();
    assert_eq!(replay.status, IntakeStatus::Completed);
    assert!(replay.replayed);
}

#[tokio::test]
async fn attempt_budget_stops_retries() {
    let handler = CountingHandler::flaky(u32::MAX);
    let ingress = ingress_with(handler.clone(), SignaturePolicy::None, 2);
    let body = br#"{"event_id": "evt_doomed"}"#;

    ingress
        .receive("payments", "payment.succeeded", HashMap::new(), body, true)
        .await
        .unwrap();
    assert_eq!(ingress.retry_due(10).await.unwrap(), 1);

    // Budget of 2 attempts exhausted: nothing left to drive.
    assert_eq!(ingress.retry_due(10).await.unwrap(), 0);
    assert_eq!(handler.call_count(), 2);
}

#[tokio::test]
async fn permanent_failure_never_retries() {
    let handler = CountingHandler::rejecting();
    let ingress = ingress_with(handler.clone(), SignaturePolicy::None, 5);
    let body = br#"{"event_id": "evt_bad"}"#;

    let outcome = ingress
        .receive("payments", "payment.succeeded", HashMap::new(), body, true)
        .await
        .unwrap();
    assert_eq!(outcome.status, IntakeStatus::Failed);
    assert_eq!(ingress.retry_due(10).await.unwrap(), 0);
    assert_eq!(handler.call_count(), 1);
}

#[tokio::test]
async fn malformed_body_rejected() {
    let handler = CountingHandler::succeeding();
    let ingress = ingress_with(handler, SignaturePolicy::None, 3);

    let err = ingress
        .receive("payments", "k", HashMap::new(), b"not-json", true)
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookError::InvalidPayload(_)));
}
