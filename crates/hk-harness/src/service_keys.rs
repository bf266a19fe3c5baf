//! Static service-key trust and the per-service permission map.
//!
//! Peer services authenticate with `X-Service-Name` plus either a static API
//! key or an HMAC signature (see [`crate::signing`]). Names come from the
//! closed [`ServiceName`] set; anything else fails closed with an audit
//! event. Key comparison is constant time. Permissions are a fixed map — a
//! peer either has a capability or the endpoint answers 403.

use std::collections::{HashMap, HashSet};

use subtle::ConstantTimeEq;
use tracing::warn;

use hk_core::config::SecuritySection;
use hk_core::types::ServiceName;
use hk_telemetry::metrics::global_metrics;

use crate::signing::{self, SignatureError};

// ---------------------------------------------------------------------------
// Permissions
// ---------------------------------------------------------------------------

/// Capabilities a peer service can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ReadUsers,
    ReadRequests,
    WriteRequests,
    ManageAssignments,
    PublishEvents,
    SendNotifications,
    UploadMedia,
}

/// The fixed `{service -> permissions}` map.
///
/// Declared once here so every protected endpoint enforces the same view.
fn platform_permissions(service: ServiceName) -> &'static [Permission] {
    use Permission::*;
    match service {
        ServiceName::AuthService => &[ReadUsers],
        ServiceName::UserService => &[PublishEvents],
        ServiceName::RequestService => &[ReadUsers, PublishEvents, SendNotifications],
        ServiceName::BotGateway => &[ReadUsers, ReadRequests, WriteRequests, UploadMedia],
        ServiceName::DispatchService => &[ReadUsers, ReadRequests, ManageAssignments],
        ServiceName::NotificationService => &[ReadUsers],
        ServiceName::IntegrationService => &[PublishEvents],
        ServiceName::MediaService => &[ReadRequests],
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    /// The presented name is not in the allowlist.
    #[error("unknown service")]
    UnknownService,

    /// The key or signature did not verify.
    #[error("invalid service credentials")]
    InvalidCredentials,

    /// The timestamp fell outside the replay window.
    #[error("stale request timestamp")]
    StaleTimestamp,

    /// Authenticated, but lacking a required permission.
    #[error("service `{service}` lacks permission {permission:?}")]
    Forbidden {
        service: ServiceName,
        permission: Permission,
    },
}

// ---------------------------------------------------------------------------
// Keyring
// ---------------------------------------------------------------------------

struct PeerEntry {
    api_key: String,
    hmac_secret: String,
    permissions: HashSet<Permission>,
}

/// The allowlist of peer services and their credentials.
pub struct ServiceKeyring {
    peers: HashMap<ServiceName, PeerEntry>,
}

impl ServiceKeyring {
    /// Build the keyring from configuration. Every known service gets an
    /// entry; its key is the per-service override or the shared secret.
    pub fn from_config(security: &SecuritySection) -> Self {
        let peers = ServiceName::ALL
            .into_iter()
            .map(|name| {
                let key = security.key_for(name).to_string();
                (
                    name,
                    PeerEntry {
                        api_key: key.clone(),
                        hmac_secret: key,
                        permissions: platform_permissions(name).iter().copied().collect(),
                    },
                )
            })
            .collect();
        Self { peers }
    }

    fn lookup(&self, presented_name: &str) -> Result<(ServiceName, &PeerEntry), TrustError> {
        let name: ServiceName = presented_name.parse().map_err(|_| {
            self.audit_failure(presented_name, "unknown_service");
            TrustError::UnknownService
        })?;
        let entry = self.peers.get(&name).ok_or(TrustError::UnknownService)?;
        Ok((name, entry))
    }

    /// Validate a static-key pair from `X-Service-Name`/`X-Service-API-Key`.
    pub fn authenticate(
        &self,
        presented_name: &str,
        presented_key: &str,
    ) -> Result<ServiceName, TrustError> {
        let (name, entry) = self.lookup(presented_name)?;

        if bool::from(entry.api_key.as_bytes().ct_eq(presented_key.as_bytes())) {
            Ok(name)
        } else {
            self.audit_failure(presented_name, "invalid_key");
            Err(TrustError::InvalidCredentials)
        }
    }

    /// Validate an HMAC-signed request from
    /// `X-Service-Name`/`X-Service-Signature`/`X-Service-Timestamp`.
    #[allow(clippy::too_many_arguments)]
    pub fn verify_signed(
        &self,
        presented_name: &str,
        method: &str,
        path: &str,
        body: &[u8],
        timestamp: i64,
        signature: &str,
        now: i64,
    ) -> Result<ServiceName, TrustError> {
        let (name, entry) = self.lookup(presented_name)?;

        match signing::verify(
            entry.hmac_secret.as_bytes(),
            method,
            path,
            body,
            timestamp,
            signature,
            now,
        ) {
            Ok(()) => Ok(name),
            Err(SignatureError::StaleTimestamp { .. }) => {
                self.audit_failure(presented_name, "stale_timestamp");
                Err(TrustError::StaleTimestamp)
            }
            Err(SignatureError::Mismatch) => {
                self.audit_failure(presented_name, "invalid_signature");
                Err(TrustError::InvalidCredentials)
            }
        }
    }

    /// Sign an outgoing request on behalf of `as_service`.
    pub fn sign_outgoing(
        &self,
        as_service: ServiceName,
        method: &str,
        path: &str,
        body: &[u8],
    ) -> (String, i64) {
        let secret = self
            .peers
            .get(&as_service)
            .map(|e| e.hmac_secret.as_bytes())
            .unwrap_or_default();
        let timestamp = signing::unix_now();
        (signing::sign(secret, method, path, body, timestamp), timestamp)
    }

    /// Enforce one required permission for an authenticated peer.
    pub fn require(
        &self,
        service: ServiceName,
        permission: Permission,
    ) -> Result<(), TrustError> {
        let allowed = self
            .peers
            .get(&service)
            .map(|e| e.permissions.contains(&permission))
            .unwrap_or(false);
        if allowed {
            Ok(())
        } else {
            warn!(service = %service, ?permission, "service denied by permission map");
            global_metrics().increment_counter(
                "service_auth_failures_total",
                &[("reason", "forbidden")],
            );
            Err(TrustError::Forbidden { service, permission })
        }
    }

    pub fn permissions_of(&self, service: ServiceName) -> Vec<Permission> {
        self.peers
            .get(&service)
            .map(|e| {
                let mut v: Vec<_> = e.permissions.iter().copied().collect();
                v.sort_by_key(|p| format!("{p:?}"));
                v
            })
            .unwrap_or_default()
    }

    fn audit_failure(&self, presented_name: &str, reason: &str) {
        // Names are attacker-controlled; log them truncated, never keys.
        let shown: String = presented_name.chars().take(32).collect();
        warn!(service = %shown, reason, "service authentication failed");
        global_metrics()
            .increment_counter("service_auth_failures_total", &[("reason", reason)]);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn keyring() -> ServiceKeyring {
        let lookup = |key: &str| match key {
            "SERVICE_SHARED_SECRET" => Some("shared".to_string()),
            "SERVICE_KEY_BOT_GATEWAY" => Some("gateway-key".to_string()),
            _ => None,
        };
        let config = hk_core::config::Config::from_lookup(&lookup).unwrap();
        ServiceKeyring::from_config(&config.security)
    }

    #[test]
    fn static_key_authenticates() {
        let ring = keyring();
        let name = ring.authenticate("bot-gateway", "gateway-key").unwrap();
        assert_eq!(name, ServiceName::BotGateway);
    }

    #[test]
    fn wrong_key_rejected() {
        let ring = keyring();
        assert!(matches!(
            ring.authenticate("bot-gateway", "shared"),
            Err(TrustError::InvalidCredentials)
        ));
    }

    #[test]
    fn unknown_name_rejected() {
        let ring = keyring();
        assert!(matches!(
            ring.authenticate("billing-service", "shared"),
            Err(TrustError::UnknownService)
        ));
    }

    #[test]
    fn signed_request_roundtrip() {
        let ring = keyring();
        let body = br#"{"executor_id":7}"#;
        let (sig, ts) = ring.sign_outgoing(ServiceName::DispatchService, "POST", "/internal/assign", body);

        let name = ring
            .verify_signed("dispatch-service", "POST", "/internal/assign", body, ts, &sig, ts + 5)
            .unwrap();
        assert_eq!(name, ServiceName::DispatchService);
    }

    #[test]
    fn signed_request_replay_window() {
        let ring = keyring();
        let (sig, ts) = ring.sign_outgoing(ServiceName::DispatchService, "GET", "/internal/pool", b"");

        let err = ring
            .verify_signed("dispatch-service", "GET", "/internal/pool", b"", ts, &sig, ts + 301)
            .unwrap_err();
        assert!(matches!(err, TrustError::StaleTimestamp));
    }

    #[test]
    fn permission_map_enforced() {
        let ring = keyring();
        assert!(ring
            .require(ServiceName::BotGateway, Permission::WriteRequests)
            .is_ok());
        assert!(matches!(
            ring.require(ServiceName::MediaService, Permission::WriteRequests),
            Err(TrustError::Forbidden { .. })
        ));
    }
}
