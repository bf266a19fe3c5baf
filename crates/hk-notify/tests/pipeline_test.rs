use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use hk_core::backoff::RetryPolicy;
use hk_core::types::{CorrelationId, ServiceName};
use hk_events::publisher::EventPublisher;
use hk_events::schema::SchemaRegistry;
use hk_harness::circuit_breaker::BreakerRegistry;
use hk_notify::channels::{ChannelAdapter, DeliveryError};
use hk_notify::pipeline::{
    LogStatus, MemoryLogStore, Notification, NotificationPipeline,
};
use hk_notify::template::{Channel, NotificationTemplate, RenderedMessage, TemplateCatalog};
use hk_substrate::MemorySubstrate;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

struct ScriptedAdapter {
    channel: Channel,
    calls: AtomicU32,
    /// Transient failures before succeeding; u32::MAX means always.
    fail_first: u32,
    permanent: bool,
}

impl ScriptedAdapter {
    fn ok(channel: Channel) -> Arc<Self> {
        Arc::new(Self { channel, calls: AtomicU32::new(0), fail_first: 0, permanent: false })
    }

    fn flaky(channel: Channel, fail_first: u32) -> Arc<Self> {
        Arc::new(Self { channel, calls: AtomicU32::new(0), fail_first, permanent: false })
    }

    fn blocked(channel: Channel) -> Arc<Self> {
        Arc::new(Self { channel, calls: AtomicU32::new(0), fail_first: u32::MAX, permanent: true })
    }
}

#[async_trait]
impl ChannelAdapter for ScriptedAdapter {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn deliver(&self, _recipient: &str, _message: &RenderedMessage) -> Result<(), DeliveryError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_first {
            if self.permanent {
                return Err(DeliveryError::Permanent("recipient blocked".into()));
            }
            return Err(DeliveryError::Transient("socket reset".into()));
        }
        Ok(())
    }
}

fn catalog() -> TemplateCatalog {
    let mut catalog = TemplateCatalog::new("ru");
    catalog.insert(NotificationTemplate {
        kind: "request_assigned".into(),
        channel: Channel::Messenger,
        language: "ru".into(),
        title: None,
        body: "Заявка {request_number} назначена".into(),
    });
    catalog.insert(NotificationTemplate {
        kind: "request_assigned".into(),
        channel: Channel::Email,
        language: "ru".into(),
        title: Some("Заявка {request_number}".into()),
        body: "Заявка {request_number} назначена".into(),
    });
    catalog
}

struct Fixture {
    pipeline: NotificationPipeline,
    logs: Arc<MemoryLogStore>,
    substrate: Arc<MemorySubstrate>,
}

fn fixture(adapter: Arc<dyn ChannelAdapter>) -> Fixture {
    let logs = Arc::new(MemoryLogStore::new());
    let substrate = Arc::new(MemorySubstrate::new());
    let events = Arc::new(EventPublisher::new(
        substrate.clone(),
        Arc::new(SchemaRegistry::platform()),
        ServiceName::NotificationService,
    ));
    let mut pipeline = NotificationPipeline::new(
        catalog(),
        logs.clone(),
        Arc::new(BreakerRegistry::new()),
        events,
        "ru",
    )
    .with_retry_policy(
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(0),
            max_delay: Duration::from_millis(1),
            multiplier: 1.0,
            jitter: false,
        },
        3,
    );
    pipeline.register_adapter(adapter);
    Fixture { pipeline, logs, substrate }
}

fn notification(correlation: Option<CorrelationId>) -> Notification {
    Notification {
        kind: "request_assigned".into(),
        channel: Channel::Messenger,
        recipient: "111".into(),
        variables: HashMap::from([("request_number".to_string(), "250927-001".to_string())]),
        language: None,
        service_origin: ServiceName::RequestService,
        correlation_id: correlation,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn delivery_marks_sent_and_announces() {
    let f = fixture(ScriptedAdapter::ok(Channel::Messenger));

    let status = f.pipeline.dispatch(notification(None)).await.unwrap();
    assert_eq!(status, LogStatus::Sent);

    let logs = f.logs.all();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, LogStatus::Sent);
    assert!(logs[0].rendered_body.contains("250927-001"));

    assert_eq!(f.substrate.stream_entries("events:notification_sent").len(), 1);
}

#[tokio::test]
async fn duplicate_correlation_is_skipped() {
    let f = fixture(ScriptedAdapter::ok(Channel::Messenger));
    let correlation = CorrelationId("corr-7".into());

    let first = f
        .pipeline
        .dispatch(notification(Some(correlation.clone())))
        .await
        .unwrap();
    assert_eq!(first, LogStatus::Sent);

    let second = f
        .pipeline
        .dispatch(notification(Some(correlation)))
        .await
        .unwrap();
    assert_eq!(second, LogStatus::Skipped);

    // Only the first dispatch produced a log row.
    assert_eq!(f.logs.all().len(), 1);
}

#[tokio::test]
async fn transient_failure_retries_then_sends() {
    let adapter = ScriptedAdapter::flaky(Channel::Messenger, 1);
    let f = fixture(adapter.clone());

    let status = f.pipeline.dispatch(notification(None)).await.unwrap();
    assert_eq!(status, LogStatus::Retry);

    assert_eq!(f.pipeline.retry_due(10).await.unwrap(), 1);
    let logs = f.logs.all();
    assert_eq!(logs[0].status, LogStatus::Sent);
    assert_eq!(logs[0].attempts, 2);
    assert_eq!(adapter.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn attempts_exhaust_to_failed() {
    let adapter = ScriptedAdapter::flaky(Channel::Messenger, u32::MAX);
    let f = fixture(adapter);

    f.pipeline.dispatch(notification(None)).await.unwrap();
    f.pipeline.retry_due(10).await.unwrap();
    f.pipeline.retry_due(10).await.unwrap();

    let logs = f.logs.all();
    assert_eq!(logs[0].status, LogStatus::Failed);
    assert_eq!(logs[0].attempts, 3);
    // Nothing left in the queue.
    assert_eq!(f.pipeline.retry_due(10).await.unwrap(), 0);
}

#[tokio::test]
async fn blocked_recipient_fails_permanently() {
    let adapter = ScriptedAdapter::blocked(Channel::Messenger);
    let f = fixture(adapter.clone());

    let status = f.pipeline.dispatch(notification(None)).await.unwrap();
    assert_eq!(status, LogStatus::Failed);

    // Permanent failures never re-enter the queue.
    assert_eq!(f.pipeline.retry_due(10).await.unwrap(), 0);
    assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unconfigured_channel_skips() {
    // Only a messenger adapter is registered; email dispatch is a no-op.
    let f = fixture(ScriptedAdapter::ok(Channel::Messenger));
    let mut n = notification(None);
    n.channel = Channel::Email;

    let status = f.pipeline.dispatch(n).await.unwrap();
    assert_eq!(status, LogStatus::Skipped);

    let logs = f.logs.all();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, LogStatus::Skipped);
}

#[tokio::test]
async fn render_failure_is_an_error_not_a_log() {
    let f = fixture(ScriptedAdapter::ok(Channel::Messenger));
    let mut n = notification(None);
    n.variables.clear();

    let err = f.pipeline.dispatch(n).await.unwrap_err();
    assert!(matches!(err, hk_notify::pipeline::NotifyError::Render(_)));
    assert!(f.logs.all().is_empty());
}
