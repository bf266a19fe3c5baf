use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// Internal numeric user id, assigned by the user service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// External messenger identity (the id the bot platform knows the user by).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalId(pub String);

impl ExternalId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for ExternalId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Correlation id threaded through events and downstream calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Service names (closed set)
// ---------------------------------------------------------------------------

/// The fixed set of peer services in the cluster.
///
/// Service-to-service authentication only ever accepts names from this set;
/// anything else fails closed with an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceName {
    AuthService,
    UserService,
    RequestService,
    BotGateway,
    DispatchService,
    NotificationService,
    IntegrationService,
    MediaService,
}

impl ServiceName {
    pub const ALL: [ServiceName; 8] = [
        ServiceName::AuthService,
        ServiceName::UserService,
        ServiceName::RequestService,
        ServiceName::BotGateway,
        ServiceName::DispatchService,
        ServiceName::NotificationService,
        ServiceName::IntegrationService,
        ServiceName::MediaService,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceName::AuthService => "auth-service",
            ServiceName::UserService => "user-service",
            ServiceName::RequestService => "request-service",
            ServiceName::BotGateway => "bot-gateway",
            ServiceName::DispatchService => "dispatch-service",
            ServiceName::NotificationService => "notification-service",
            ServiceName::IntegrationService => "integration-service",
            ServiceName::MediaService => "media-service",
        }
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceName {
    type Err = UnknownServiceName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| UnknownServiceName(s.to_string()))
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown service name `{0}`")]
pub struct UnknownServiceName(pub String);

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

/// User roles recognised across the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Applicant,
    Executor,
    Manager,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Applicant => "applicant",
            Role::Executor => "executor",
            Role::Manager => "manager",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Urgency
// ---------------------------------------------------------------------------

/// Ordinal urgency of a work order, 1 (lowest) through 5 (highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Urgency(u8);

impl Urgency {
    pub fn new(level: u8) -> Option<Self> {
        (1..=5).contains(&level).then_some(Self(level))
    }

    pub fn level(&self) -> u8 {
        self.0
    }

    /// Urgency normalised to [0, 1] for scoring.
    pub fn as_factor(&self) -> f64 {
        f64::from(self.0) / 5.0
    }
}

impl Default for Urgency {
    fn default() -> Self {
        Self(3)
    }
}

// ---------------------------------------------------------------------------
// Request numbers
// ---------------------------------------------------------------------------

/// Human-readable work-order number in the `YYMMDD-NNN` format.
///
/// The date part is the allocation day in the platform's configured timezone;
/// the sequence restarts at 001 each day. Numbers are immutable and never
/// reused, even when the owning work order is deleted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RequestNumber(String);

impl RequestNumber {
    /// Compose a number from a date key (`YYMMDD`) and a daily sequence.
    ///
    /// Sequences above 999 do not fit the format and are rejected by the
    /// allocator before this is called.
    pub fn compose(date_key: &str, sequence: u32) -> Result<Self, InvalidRequestNumber> {
        Self::parse(&format!("{date_key}-{sequence:03}"))
    }

    /// Parse and validate a candidate number against `^\d{6}-\d{3}$`.
    pub fn parse(raw: &str) -> Result<Self, InvalidRequestNumber> {
        use std::sync::OnceLock;
        static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
        let pattern = PATTERN.get_or_init(|| {
            regex::Regex::new(r"^\d{6}-\d{3}$").expect("request number pattern is valid")
        });

        if pattern.is_match(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(InvalidRequestNumber(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `YYMMDD` date component.
    pub fn date_key(&self) -> &str {
        &self.0[..6]
    }

    /// The daily sequence component.
    pub fn sequence(&self) -> u32 {
        self.0[7..].parse().expect("validated on construction")
    }
}

impl fmt::Display for RequestNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RequestNumber {
    type Error = InvalidRequestNumber;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RequestNumber> for String {
    fn from(value: RequestNumber) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid request number `{0}` (expected YYMMDD-NNN)")]
pub struct InvalidRequestNumber(pub String);

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_name_roundtrip() {
        for name in ServiceName::ALL {
            assert_eq!(name.as_str().parse::<ServiceName>().unwrap(), name);
        }
    }

    #[test]
    fn unknown_service_name_rejected() {
        assert!("billing-service".parse::<ServiceName>().is_err());
        assert!("".parse::<ServiceName>().is_err());
    }

    #[test]
    fn urgency_bounds() {
        assert!(Urgency::new(0).is_none());
        assert!(Urgency::new(6).is_none());
        assert_eq!(Urgency::new(5).unwrap().level(), 5);
        assert!((Urgency::new(3).unwrap().as_factor() - 0.6).abs() < f64::EPSILON);
    }

    #[test]
    fn request_number_parse_and_parts() {
        let n = RequestNumber::parse("250927-001").unwrap();
        assert_eq!(n.date_key(), "250927");
        assert_eq!(n.sequence(), 1);
        assert_eq!(n.to_string(), "250927-001");
    }

    #[test]
    fn request_number_compose_pads_sequence() {
        let n = RequestNumber::compose("250927", 42).unwrap();
        assert_eq!(n.as_str(), "250927-042");
    }

    #[test]
    fn request_number_rejects_malformed() {
        for raw in ["250927-1", "25927-001", "250927_001", "2509270-001", "abcdef-001", ""] {
            assert!(RequestNumber::parse(raw).is_err(), "{raw} should be invalid");
        }
    }

    #[test]
    fn request_number_serde() {
        let n: RequestNumber = serde_json::from_str("\"250927-007\"").unwrap();
        assert_eq!(n.sequence(), 7);
        assert!(serde_json::from_str::<RequestNumber>("\"garbage\"").is_err());
    }
}
