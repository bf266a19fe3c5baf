use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use hk_core::types::{CorrelationId, ServiceName};
use hk_substrate::{Substrate, SubstrateError, Subscription};

use crate::envelope::EventEnvelope;
use crate::schema::{SchemaError, SchemaRegistry};

/// Bound on each kind's stream; old entries fall off the tail.
pub const STREAM_MAXLEN: usize = 10_000;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// The durable append failed; the event does not exist.
    #[error("stream append failed: {0}")]
    Append(SubstrateError),
}

// ---------------------------------------------------------------------------
// EventPublisher
// ---------------------------------------------------------------------------

/// Publishes validated events to the kind's stream and channel.
pub struct EventPublisher {
    substrate: Arc<dyn Substrate>,
    registry: Arc<SchemaRegistry>,
    source: ServiceName,
}

impl EventPublisher {
    pub fn new(
        substrate: Arc<dyn Substrate>,
        registry: Arc<SchemaRegistry>,
        source: ServiceName,
    ) -> Self {
        Self { substrate, registry, source }
    }

    pub fn stream_name(kind: &str) -> String {
        format!("events:{kind}")
    }

    pub fn channel_name(kind: &str) -> String {
        format!("events.{kind}")
    }

    /// Publish one event. Returns the assigned event id.
    ///
    /// The stream append is the durability point: if it fails the publish
    /// fails. A channel failure after a successful append is logged only —
    /// live subscribers miss the notification but can replay the stream.
    pub async fn publish(
        &self,
        kind: &str,
        payload: Value,
        correlation_id: Option<CorrelationId>,
    ) -> Result<String, PublishError> {
        let version = self.registry.validate(kind, &payload)?;

        let envelope = EventEnvelope {
            event_id: Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            version,
            timestamp: Utc::now(),
            source_service: self.source,
            correlation_id: correlation_id.map(|c| c.0),
            payload: payload
                .as_object()
                .cloned()
                .expect("validated payloads are objects"),
        };
        let serialized = envelope.canonical_json();

        self.substrate
            .stream_append(
                &Self::stream_name(kind),
                &[
                    ("event_id", envelope.event_id.as_str()),
                    ("event_data", serialized.as_str()),
                ],
                STREAM_MAXLEN,
            )
            .await
            .map_err(PublishError::Append)?;

        if let Err(e) = self
            .substrate
            .publish(&Self::channel_name(kind), &serialized)
            .await
        {
            warn!(kind, error = %e, "event appended but live fan-out failed");
        }

        debug!(kind, event_id = %envelope.event_id, "event published");
        Ok(envelope.event_id)
    }

    /// Publish a batch with the same per-event guarantees. Events are
    /// validated up front so a bad entry rejects the whole batch before
    /// anything is appended.
    pub async fn publish_batch(
        &self,
        events: Vec<(&str, Value)>,
        correlation_id: Option<CorrelationId>,
    ) -> Result<Vec<String>, PublishError> {
        for (kind, payload) in &events {
            self.registry.validate(kind, payload)?;
        }

        let mut ids = Vec::with_capacity(events.len());
        for (kind, payload) in events {
            ids.push(self.publish(kind, payload, correlation_id.clone()).await?);
        }
        Ok(ids)
    }

    /// Subscribe to one kind's live channel.
    pub async fn subscribe(&self, kind: &str) -> Result<Subscription, SubstrateError> {
        self.substrate.subscribe(&Self::channel_name(kind)).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use hk_substrate::MemorySubstrate;
    use serde_json::json;

    fn publisher(substrate: Arc<MemorySubstrate>) -> EventPublisher {
        EventPublisher::new(
            substrate,
            Arc::new(SchemaRegistry::platform()),
            ServiceName::RequestService,
        )
    }

    fn created_payload() -> Value {
        json!({
            "request_number": "250927-001",
            "applicant_id": 42,
            "category": "plumbing",
            "urgency": 3
        })
    }

    #[tokio::test]
    async fn publish_appends_and_fans_out() {
        let substrate = Arc::new(MemorySubstrate::new());
        let publisher = publisher(substrate.clone());

        let mut feed = publisher.subscribe("request_created").await.unwrap();
        let event_id = publisher
            .publish("request_created", created_payload(), None)
            .await
            .unwrap();

        // Durable side: one stream entry carrying the envelope.
        let entries = substrate.stream_entries("events:request_created");
        assert_eq!(entries.len(), 1);
        let (_, fields) = &entries[0];
        assert_eq!(fields[0], ("event_id".to_string(), event_id.clone()));

        // Live side: the subscriber saw the same serialized event.
        let delivered = feed.next().await.unwrap();
        let value: Value = serde_json::from_str(&delivered).unwrap();
        assert_eq!(value["event_id"], event_id.as_str());
        assert_eq!(value["source_service"], "request-service");
        assert_eq!(value["request_number"], "250927-001");
    }

    #[tokio::test]
    async fn schema_invalid_event_rejected() {
        let substrate = Arc::new(MemorySubstrate::new());
        let publisher = publisher(substrate.clone());

        let err = publisher
            .publish("request_created", json!({"request_number": 5}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Schema(_)));
        assert!(substrate.stream_entries("events:request_created").is_empty());
    }

    #[tokio::test]
    async fn substrate_outage_fails_publish() {
        let substrate = Arc::new(MemorySubstrate::new());
        let publisher = publisher(substrate.clone());
        substrate.set_unavailable(true);

        let err = publisher
            .publish("request_created", created_payload(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Append(_)));
    }

    #[tokio::test]
    async fn batch_validates_before_appending() {
        let substrate = Arc::new(MemorySubstrate::new());
        let publisher = publisher(substrate.clone());

        let err = publisher
            .publish_batch(
                vec![
                    ("request_created", created_payload()),
                    ("request_created", json!({"bad": true})),
                ],
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Schema(_)));
        // Nothing from the batch landed.
        assert!(substrate.stream_entries("events:request_created").is_empty());
    }

    #[tokio::test]
    async fn batch_publishes_every_event() {
        let substrate = Arc::new(MemorySubstrate::new());
        let publisher = publisher(substrate.clone());
        let correlation = CorrelationId::generate();

        let ids = publisher
            .publish_batch(
                vec![
                    ("request_created", created_payload()),
                    (
                        "request_cancelled",
                        json!({"request_number": "250927-001", "reason": "duplicate"}),
                    ),
                ],
                Some(correlation),
            )
            .await
            .unwrap();

        assert_eq!(ids.len(), 2);
        assert_eq!(substrate.stream_entries("events:request_created").len(), 1);
        assert_eq!(substrate.stream_entries("events:request_cancelled").len(), 1);
    }

    #[tokio::test]
    async fn stream_respects_cap() {
        let substrate = Arc::new(MemorySubstrate::new());
        let publisher = publisher(substrate.clone());

        for _ in 0..5 {
            publisher
                .publish("request_created", created_payload(), None)
                .await
                .unwrap();
        }
        assert!(substrate.stream_entries("events:request_created").len() <= STREAM_MAXLEN);
    }
}
