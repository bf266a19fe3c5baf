use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use hk_core::types::ServiceName;

/// The wire form of one event: the base envelope with the kind-specific
/// payload flattened alongside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: String,
    pub kind: String,
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub source_service: ServiceName,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl EventEnvelope {
    /// Canonical serialized form appended to streams and published to
    /// channels. Envelope fields come first, payload fields after, so the
    /// same event always serializes to the same bytes.
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(self).expect("envelope serialization is infallible")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope() -> EventEnvelope {
        let payload = json!({"request_number": "250927-001", "reason": "duplicate"});
        EventEnvelope {
            event_id: "7c9a0a3e".into(),
            kind: "request_cancelled".into(),
            version: 1,
            timestamp: "2025-09-27T10:00:00Z".parse().unwrap(),
            source_service: ServiceName::RequestService,
            correlation_id: Some("corr-1".into()),
            payload: payload.as_object().unwrap().clone(),
        }
    }

    #[test]
    fn payload_flattens_into_envelope() {
        let value: Value = serde_json::from_str(&envelope().canonical_json()).unwrap();
        assert_eq!(value["event_id"], "7c9a0a3e");
        assert_eq!(value["kind"], "request_cancelled");
        assert_eq!(value["source_service"], "request-service");
        assert_eq!(value["request_number"], "250927-001");
        assert_eq!(value["reason"], "duplicate");
    }

    #[test]
    fn roundtrip_preserves_payload() {
        let json = envelope().canonical_json();
        let parsed: EventEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.payload.get("reason").unwrap(), "duplicate");
        assert_eq!(parsed.correlation_id.as_deref(), Some("corr-1"));
    }

    #[test]
    fn absent_correlation_id_is_omitted() {
        let mut e = envelope();
        e.correlation_id = None;
        assert!(!e.canonical_json().contains("correlation_id"));
    }
}
