//! Idempotent webhook ingress with retry.
//!
//! Every inbound hook is recorded as a [`WebhookIntake`] keyed by
//! `(source, idempotency key)`. A completed intake is immutable: replaying
//! the same delivery returns the stored response without touching the
//! handler. Failed intakes are retried with exponential backoff while the
//! per-source attempt budget lasts; the retry worker drives them in the
//! background.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use hk_core::backoff::RetryPolicy;
use hk_harness::shutdown::{ShutdownGuard, ShutdownSignal};

use crate::publisher::EventPublisher;

// ---------------------------------------------------------------------------
// Intake record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntakeStatus {
    Received,
    Processing,
    Completed,
    Failed,
}

impl IntakeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntakeStatus::Received => "received",
            IntakeStatus::Processing => "processing",
            IntakeStatus::Completed => "completed",
            IntakeStatus::Failed => "failed",
        }
    }
}

/// Recorded form of one inbound webhook call.
#[derive(Debug, Clone)]
pub struct WebhookIntake {
    pub id: String,
    pub source: String,
    pub declared_kind: String,
    pub headers: HashMap<String, String>,
    pub body: Value,
    pub body_hash: String,
    pub idempotency_key: String,
    pub status: IntakeStatus,
    pub attempts: u32,
    pub error: Option<String>,
    pub response: Option<Value>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// Plain-HTTP delivery while the deployment requires HTTPS.
    #[error("webhook rejected: HTTPS required")]
    InsecureTransport,

    #[error("webhook payload exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("webhook signature missing")]
    SignatureMissing,

    #[error("webhook signature invalid")]
    SignatureInvalid,

    #[error("webhook body is not valid JSON: {0}")]
    InvalidPayload(String),

    #[error("intake store unavailable: {0}")]
    Store(String),
}

/// How a per-source handler failed.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Worth retrying (downstream hiccup, timeout).
    #[error("transient: {0}")]
    Transient(String),

    /// Never worth retrying (semantic rejection).
    #[error("permanent: {0}")]
    Permanent(String),
}

// ---------------------------------------------------------------------------
// Per-source configuration and handler
// ---------------------------------------------------------------------------

/// Signature policy for one webhook source.
#[derive(Debug, Clone)]
pub enum SignaturePolicy {
    /// Source cannot sign; accept as-is.
    None,
    /// Hex HMAC-SHA256 of the raw body in the named header.
    HmacSha256 { header: String, secret: String },
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub policy: SignaturePolicy,
    pub max_attempts: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            policy: SignaturePolicy::None,
            max_attempts: 5,
        }
    }
}

/// Business logic for one source's webhooks.
#[async_trait]
pub trait SourceHandler: Send + Sync {
    async fn handle(&self, intake: &WebhookIntake) -> Result<Value, HandlerError>;
}

// ---------------------------------------------------------------------------
// Intake store
// ---------------------------------------------------------------------------

#[async_trait]
pub trait IntakeStore: Send + Sync {
    async fn insert(&self, intake: WebhookIntake) -> Result<(), WebhookError>;
    async fn fetch(&self, id: &str) -> Result<Option<WebhookIntake>, WebhookError>;
    async fn find_by_key(
        &self,
        source: &str,
        idempotency_key: &str,
    ) -> Result<Option<WebhookIntake>, WebhookError>;
    async fn update(&self, intake: &WebhookIntake) -> Result<(), WebhookError>;
    /// Failed intakes whose `next_retry_at` has passed.
    async fn due_for_retry(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WebhookIntake>, WebhookError>;
}

/// In-process intake store for tests and development mode.
#[derive(Default)]
pub struct MemoryIntakeStore {
    intakes: Mutex<HashMap<String, WebhookIntake>>,
}

impl MemoryIntakeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IntakeStore for MemoryIntakeStore {
    async fn insert(&self, intake: WebhookIntake) -> Result<(), WebhookError> {
        let mut map = self.intakes.lock().expect("intake lock poisoned");
        map.insert(intake.id.clone(), intake);
        Ok(())
    }

    async fn fetch(&self, id: &str) -> Result<Option<WebhookIntake>, WebhookError> {
        let map = self.intakes.lock().expect("intake lock poisoned");
        Ok(map.get(id).cloned())
    }

    async fn find_by_key(
        &self,
        source: &str,
        idempotency_key: &str,
    ) -> Result<Option<WebhookIntake>, WebhookError> {
        let map = self.intakes.lock().expect("intake lock poisoned");
        Ok(map
            .values()
            .find(|i| i.source == source && i.idempotency_key == idempotency_key)
            .cloned())
    }

    async fn update(&self, intake: &WebhookIntake) -> Result<(), WebhookError> {
        let mut map = self.intakes.lock().expect("intake lock poisoned");
        map.insert(intake.id.clone(), intake.clone());
        Ok(())
    }

    async fn due_for_retry(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WebhookIntake>, WebhookError> {
        let map = self.intakes.lock().expect("intake lock poisoned");
        let mut due: Vec<_> = map
            .values()
            .filter(|i| {
                i.status == IntakeStatus::Failed
                    && i.next_retry_at.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect();
        due.sort_by_key(|i| i.next_retry_at);
        due.truncate(limit);
        Ok(due)
    }
}

// ---------------------------------------------------------------------------
// Ingress
// ---------------------------------------------------------------------------

/// Outcome returned to the webhook caller.
#[derive(Debug, Clone, Serialize)]
pub struct IngressOutcome {
    pub intake_id: String,
    pub status: IntakeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    /// Whether this call was answered from a prior completed intake.
    pub replayed: bool,
}

pub struct WebhookIngress {
    store: Arc<dyn IntakeStore>,
    publisher: Arc<EventPublisher>,
    handlers: HashMap<String, Arc<dyn SourceHandler>>,
    sources: HashMap<String, SourceConfig>,
    require_https: bool,
    max_payload_bytes: usize,
    retry_policy: RetryPolicy,
}

impl WebhookIngress {
    pub fn new(
        store: Arc<dyn IntakeStore>,
        publisher: Arc<EventPublisher>,
        require_https: bool,
        max_payload_bytes: usize,
    ) -> Self {
        Self {
            store,
            publisher,
            handlers: HashMap::new(),
            sources: HashMap::new(),
            require_https,
            max_payload_bytes,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Register a source with its signature policy and handler.
    pub fn register_source(
        &mut self,
        source: &str,
        config: SourceConfig,
        handler: Arc<dyn SourceHandler>,
    ) {
        self.sources.insert(source.to_string(), config);
        self.handlers.insert(source.to_string(), handler);
    }

    fn source_config(&self, source: &str) -> SourceConfig {
        self.sources.get(source).cloned().unwrap_or_default()
    }

    /// Receive one inbound webhook call.
    pub async fn receive(
        &self,
        source: &str,
        declared_kind: &str,
        headers: HashMap<String, String>,
        raw_body: &[u8],
        https: bool,
    ) -> Result<IngressOutcome, WebhookError> {
        if self.require_https && !https {
            return Err(WebhookError::InsecureTransport);
        }
        if raw_body.len() > self.max_payload_bytes {
            return Err(WebhookError::PayloadTooLarge {
                limit: self.max_payload_bytes,
            });
        }

        let config = self.source_config(source);
        self.verify_signature(&config.policy, &headers, raw_body)?;

        let body: Value = serde_json::from_slice(raw_body)
            .map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;
        let body_hash = hex::encode(Sha256::digest(raw_body));
        let idempotency_key = idempotency_key_for(&body, &body_hash);

        // A completed intake is immutable: answer the replay from it.
        if let Some(existing) = self.store.find_by_key(source, &idempotency_key).await? {
            debug!(source, intake = %existing.id, status = existing.status.as_str(),
                   "duplicate delivery for known intake");
            return Ok(IngressOutcome {
                intake_id: existing.id.clone(),
                status: existing.status,
                response: existing.response,
                replayed: true,
            });
        }

        let mut intake = WebhookIntake {
            id: Uuid::new_v4().to_string(),
            source: source.to_string(),
            declared_kind: declared_kind.to_string(),
            headers,
            body,
            body_hash,
            idempotency_key,
            status: IntakeStatus::Received,
            attempts: 0,
            error: None,
            response: None,
            next_retry_at: None,
            created_at: Utc::now(),
            processed_at: None,
        };
        self.store.insert(intake.clone()).await?;

        self.process(&mut intake, &config).await?;

        Ok(IngressOutcome {
            intake_id: intake.id.clone(),
            status: intake.status,
            response: intake.response.clone(),
            replayed: false,
        })
    }

    /// One processing attempt: flip to processing, run the handler, settle.
    async fn process(
        &self,
        intake: &mut WebhookIntake,
        config: &SourceConfig,
    ) -> Result<(), WebhookError> {
        intake.status = IntakeStatus::Processing;
        intake.attempts += 1;
        self.store.update(intake).await?;

        let handler = self.handlers.get(&intake.source).cloned();
        let result = match handler {
            Some(handler) => handler.handle(intake).await,
            None => Err(HandlerError::Permanent(format!(
                "no handler registered for source `{}`",
                intake.source
            ))),
        };

        match result {
            Ok(response) => {
                intake.status = IntakeStatus::Completed;
                intake.response = Some(response);
                intake.error = None;
                intake.next_retry_at = None;
                intake.processed_at = Some(Utc::now());
                self.store.update(intake).await?;

                // Completion is announced on the event fabric; losing the
                // announcement does not un-complete the intake.
                let payload = serde_json::json!({
                    "source": intake.source,
                    "declared_kind": intake.declared_kind,
                    "intake_id": intake.id,
                });
                if let Err(e) = self.publisher.publish("webhook_received", payload, None).await {
                    warn!(intake = %intake.id, error = %e, "webhook completion event lost");
                }
                info!(intake = %intake.id, source = %intake.source, "webhook completed");
            }
            Err(HandlerError::Transient(message)) if intake.attempts < config.max_attempts => {
                let delay = self.retry_policy.delay_for(intake.attempts - 1);
                intake.status = IntakeStatus::Failed;
                intake.error = Some(message.clone());
                intake.next_retry_at = Utc::now()
                    .checked_add_signed(
                        chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(60)),
                    );
                self.store.update(intake).await?;
                warn!(intake = %intake.id, attempts = intake.attempts, error = %message,
                      "webhook failed, retry scheduled");
            }
            Err(e) => {
                intake.status = IntakeStatus::Failed;
                intake.error = Some(e.to_string());
                intake.next_retry_at = None;
                intake.processed_at = Some(Utc::now());
                self.store.update(intake).await?;
                warn!(intake = %intake.id, error = %e, "webhook failed permanently");
            }
        }
        Ok(())
    }

    /// Look up one intake by id (admin surface).
    pub async fn intake(&self, id: &str) -> Result<Option<WebhookIntake>, WebhookError> {
        self.store.fetch(id).await
    }

    /// Force one more attempt for a failed intake (admin surface). Returns
    /// the settled intake, or `None` when the id is unknown.
    pub async fn retry_one(&self, id: &str) -> Result<Option<WebhookIntake>, WebhookError> {
        let Some(mut intake) = self.store.fetch(id).await? else {
            return Ok(None);
        };
        if intake.status != IntakeStatus::Completed {
            let config = self.source_config(&intake.source);
            self.process(&mut intake, &config).await?;
        }
        Ok(Some(intake))
    }

    /// One pass of the retry worker: drive every due intake once.
    pub async fn retry_due(&self, limit: usize) -> Result<usize, WebhookError> {
        let due = self.store.due_for_retry(Utc::now(), limit).await?;
        let count = due.len();
        for mut intake in due {
            let config = self.source_config(&intake.source);
            self.process(&mut intake, &config).await?;
        }
        Ok(count)
    }

    fn verify_signature(
        &self,
        policy: &SignaturePolicy,
        headers: &HashMap<String, String>,
        raw_body: &[u8],
    ) -> Result<(), WebhookError> {
        match policy {
            SignaturePolicy::None => Ok(()),
            SignaturePolicy::HmacSha256 { header, secret } => {
                let presented = headers
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(header))
                    .map(|(_, v)| v.as_str())
                    .ok_or(WebhookError::SignatureMissing)?;

                let expected = hmac_hex(secret.as_bytes(), raw_body);
                if signing_eq(&expected, presented) {
                    Ok(())
                } else {
                    Err(WebhookError::SignatureInvalid)
                }
            }
        }
    }
}

fn hmac_hex(secret: &[u8], body: &[u8]) -> String {
    use hmac::{Hmac, Mac};
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

fn signing_eq(expected: &str, presented: &str) -> bool {
    use subtle::ConstantTimeEq;
    bool::from(expected.as_bytes().ct_eq(presented.as_bytes()))
}

/// Idempotency key: the event id carried by the payload, or the body hash.
fn idempotency_key_for(body: &Value, body_hash: &str) -> String {
    body.get("event_id")
        .or_else(|| body.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| body_hash.to_string())
}

// ---------------------------------------------------------------------------
// Retry worker
// ---------------------------------------------------------------------------

/// Timer loop driving due retries until shutdown.
pub async fn run_retry_worker(
    ingress: Arc<WebhookIngress>,
    interval: StdDuration,
    shutdown: ShutdownSignal,
) {
    let _guard = ShutdownGuard::new(shutdown.clone());
    let mut rx = shutdown.subscribe();
    let jitter = StdDuration::from_millis(rand_jitter_ms());

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval + jitter) => {
                match ingress.retry_due(32).await {
                    Ok(0) => {}
                    Ok(n) => debug!(count = n, "webhook retries driven"),
                    Err(e) => warn!(error = %e, "webhook retry pass failed"),
                }
            }
            _ = rx.recv() => {
                debug!("webhook retry worker draining");
                return;
            }
        }
    }
}

fn rand_jitter_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_millis() as u64 % 500)
        .unwrap_or(0)
}
