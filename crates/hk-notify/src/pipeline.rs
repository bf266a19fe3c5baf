//! The delivery pipeline: render, log, dispatch, settle, retry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use hk_core::backoff::RetryPolicy;
use hk_core::types::{CorrelationId, ServiceName};
use hk_events::publisher::EventPublisher;
use hk_harness::circuit_breaker::BreakerRegistry;
use hk_harness::shutdown::{ShutdownGuard, ShutdownSignal};
use hk_telemetry::metrics::global_metrics;

use crate::channels::{ChannelAdapter, DeliveryError};
use crate::template::{Channel, RenderError, TemplateCatalog};

// ---------------------------------------------------------------------------
// Notification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Notification {
    pub kind: String,
    pub channel: Channel,
    pub recipient: String,
    pub variables: HashMap<String, String>,
    pub language: Option<String>,
    pub service_origin: ServiceName,
    pub correlation_id: Option<CorrelationId>,
}

// ---------------------------------------------------------------------------
// Log rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Pending,
    Sent,
    Retry,
    Failed,
    Skipped,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Pending => "pending",
            LogStatus::Sent => "sent",
            LogStatus::Retry => "retry",
            LogStatus::Failed => "failed",
            LogStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotificationLog {
    pub id: String,
    pub kind: String,
    pub channel: Channel,
    pub recipient: String,
    pub rendered_title: Option<String>,
    pub rendered_body: String,
    pub status: LogStatus,
    pub attempts: u32,
    pub error: Option<String>,
    pub correlation_id: Option<String>,
    pub service_origin: ServiceName,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Log store
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("notification log unavailable: {0}")]
    Store(String),
}

#[async_trait]
pub trait NotificationLogStore: Send + Sync {
    async fn insert(&self, log: NotificationLog) -> Result<(), NotifyError>;
    async fn update(&self, log: &NotificationLog) -> Result<(), NotifyError>;

    /// Whether a `sent` row exists for this idempotency triple.
    async fn already_sent(
        &self,
        correlation_id: &str,
        channel: Channel,
        recipient: &str,
    ) -> Result<bool, NotifyError>;

    async fn due_for_retry(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<NotificationLog>, NotifyError>;
}

/// In-process log store for tests and development mode.
#[derive(Default)]
pub struct MemoryLogStore {
    logs: Mutex<Vec<NotificationLog>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<NotificationLog> {
        self.logs.lock().expect("log lock poisoned").clone()
    }
}

#[async_trait]
impl NotificationLogStore for MemoryLogStore {
    async fn insert(&self, log: NotificationLog) -> Result<(), NotifyError> {
        self.logs.lock().expect("log lock poisoned").push(log);
        Ok(())
    }

    async fn update(&self, log: &NotificationLog) -> Result<(), NotifyError> {
        let mut logs = self.logs.lock().expect("log lock poisoned");
        if let Some(existing) = logs.iter_mut().find(|l| l.id == log.id) {
            *existing = log.clone();
        }
        Ok(())
    }

    async fn already_sent(
        &self,
        correlation_id: &str,
        channel: Channel,
        recipient: &str,
    ) -> Result<bool, NotifyError> {
        let logs = self.logs.lock().expect("log lock poisoned");
        Ok(logs.iter().any(|l| {
            l.status == LogStatus::Sent
                && l.channel == channel
                && l.recipient == recipient
                && l.correlation_id.as_deref() == Some(correlation_id)
        }))
    }

    async fn due_for_retry(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<NotificationLog>, NotifyError> {
        let logs = self.logs.lock().expect("log lock poisoned");
        let mut due: Vec<_> = logs
            .iter()
            .filter(|l| {
                l.status == LogStatus::Retry && l.next_retry_at.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect();
        due.sort_by_key(|l| l.next_retry_at);
        due.truncate(limit);
        Ok(due)
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct NotificationPipeline {
    catalog: TemplateCatalog,
    adapters: HashMap<Channel, Arc<dyn ChannelAdapter>>,
    logs: Arc<dyn NotificationLogStore>,
    breakers: Arc<BreakerRegistry>,
    events: Arc<EventPublisher>,
    retry_policy: RetryPolicy,
    default_language: String,
    max_attempts: u32,
}

impl NotificationPipeline {
    pub fn new(
        catalog: TemplateCatalog,
        logs: Arc<dyn NotificationLogStore>,
        breakers: Arc<BreakerRegistry>,
        events: Arc<EventPublisher>,
        default_language: impl Into<String>,
    ) -> Self {
        Self {
            catalog,
            adapters: HashMap::new(),
            logs,
            breakers,
            events,
            retry_policy: RetryPolicy::default(),
            default_language: default_language.into(),
            max_attempts: 5,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy, max_attempts: u32) -> Self {
        self.retry_policy = policy;
        self.max_attempts = max_attempts;
        self
    }

    pub fn register_adapter(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        self.adapters.insert(adapter.channel(), adapter);
    }

    /// Run one notification through the pipeline. Returns the settled status.
    pub async fn dispatch(&self, notification: Notification) -> Result<LogStatus, NotifyError> {
        // Idempotency: the same correlation to the same recipient over the
        // same channel goes out at most once.
        if let Some(correlation) = &notification.correlation_id {
            if self
                .logs
                .already_sent(correlation.as_str(), notification.channel, &notification.recipient)
                .await?
            {
                debug!(
                    correlation = correlation.as_str(),
                    channel = %notification.channel,
                    "duplicate notification skipped"
                );
                return Ok(LogStatus::Skipped);
            }
        }

        let language = notification
            .language
            .as_deref()
            .unwrap_or(&self.default_language);
        let rendered = self.catalog.render(
            &notification.kind,
            notification.channel,
            language,
            &notification.variables,
        )?;

        let mut log = NotificationLog {
            id: Uuid::new_v4().to_string(),
            kind: notification.kind.clone(),
            channel: notification.channel,
            recipient: notification.recipient.clone(),
            rendered_title: rendered.title.clone(),
            rendered_body: rendered.body.clone(),
            status: LogStatus::Pending,
            attempts: 0,
            error: None,
            correlation_id: notification.correlation_id.as_ref().map(|c| c.0.clone()),
            service_origin: notification.service_origin,
            next_retry_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.logs.insert(log.clone()).await?;

        self.attempt(&mut log, &rendered).await?;
        Ok(log.status)
    }

    /// One delivery attempt for an existing log row.
    async fn attempt(
        &self,
        log: &mut NotificationLog,
        rendered: &crate::template::RenderedMessage,
    ) -> Result<(), NotifyError> {
        log.attempts += 1;
        log.updated_at = Utc::now();

        let Some(adapter) = self.adapters.get(&log.channel) else {
            log.status = LogStatus::Skipped;
            log.error = Some("channel not configured".into());
            self.logs.update(log).await?;
            return Ok(());
        };

        let breaker = self
            .breakers
            .get_or_create(log.channel.as_str(), Default::default());
        let recipient = log.recipient.clone();
        let adapter = adapter.clone();
        let message = rendered.clone();

        // Only transient faults flow through the breaker as failures; a
        // blocked recipient or a disabled channel is a settled outcome, not
        // a sign the channel itself is unhealthy.
        let outcome = breaker
            .call(move || async move {
                match adapter.deliver(&recipient, &message).await {
                    Ok(()) => Ok(Ok(())),
                    Err(DeliveryError::Transient(why)) => Err(why),
                    Err(settled) => Ok(Err(settled)),
                }
            })
            .await;

        match outcome {
            Ok(Ok(())) => {
                log.status = LogStatus::Sent;
                log.error = None;
                log.next_retry_at = None;
                self.logs.update(log).await?;
                global_metrics().increment_counter(
                    "notifications_sent_total",
                    &[("channel", log.channel.as_str())],
                );

                let payload = json!({
                    "channel": log.channel.as_str(),
                    "recipient": log.recipient,
                    "notification_kind": log.kind,
                });
                if let Err(e) = self.events.publish("notification_sent", payload, None).await {
                    warn!(log_id = %log.id, error = %e, "notification event lost");
                }
                info!(log_id = %log.id, channel = %log.channel, "notification sent");
            }
            Ok(Err(DeliveryError::Disabled)) => {
                log.status = LogStatus::Skipped;
                log.error = Some("channel disabled".into());
                self.logs.update(log).await?;
            }
            Ok(Err(settled)) => {
                log.status = LogStatus::Failed;
                log.error = Some(settled.to_string());
                log.next_retry_at = None;
                self.logs.update(log).await?;
                global_metrics().increment_counter(
                    "notifications_failed_total",
                    &[("channel", log.channel.as_str())],
                );
            }
            Err(e) => {
                // Transient failure, timeout, or an open breaker.
                if log.attempts < self.max_attempts {
                    let delay = self.retry_policy.delay_for(log.attempts - 1);
                    log.status = LogStatus::Retry;
                    log.next_retry_at = Utc::now().checked_add_signed(
                        chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(60)),
                    );
                } else {
                    log.status = LogStatus::Failed;
                    log.next_retry_at = None;
                }
                log.error = Some(e.to_string());
                self.logs.update(log).await?;
                warn!(log_id = %log.id, attempts = log.attempts, error = %e,
                      "notification delivery failed");
            }
        }
        Ok(())
    }

    /// Drive due retries once; returns how many were attempted.
    pub async fn retry_due(&self, limit: usize) -> Result<usize, NotifyError> {
        let due = self.logs.due_for_retry(Utc::now(), limit).await?;
        let count = due.len();
        for mut log in due {
            let rendered = crate::template::RenderedMessage {
                title: log.rendered_title.clone(),
                body: log.rendered_body.clone(),
            };
            self.attempt(&mut log, &rendered).await?;
        }
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Retry worker
// ---------------------------------------------------------------------------

pub async fn run_delivery_retries(
    pipeline: Arc<NotificationPipeline>,
    interval: StdDuration,
    shutdown: ShutdownSignal,
) {
    let _guard = ShutdownGuard::new(shutdown.clone());
    let mut rx = shutdown.subscribe();

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                match pipeline.retry_due(32).await {
                    Ok(0) => {}
                    Ok(n) => debug!(count = n, "notification retries driven"),
                    Err(e) => warn!(error = %e, "notification retry pass failed"),
                }
            }
            _ = rx.recv() => {
                debug!("notification retry worker draining");
                return;
            }
        }
    }
}
