//! Password and MFA verification flows.
//!
//! The verification order is fixed: missing row, active lock, missing hash,
//! then the hash comparison itself. Failed attempts accumulate into a
//! time-boxed lock; a correct password during the lock still fails. Hashing
//! is CPU-bound by design and always runs on the blocking pool so it cannot
//! starve network I/O.

use std::sync::Arc;

use argon2::password_hash::{rand_core::OsRng, SaltString};
use argon2::{Algorithm, Argon2, Params, PasswordHash, PasswordHasher, PasswordVerifier, Version};
use chrono::Utc;
use rand::RngCore;
use tracing::{info, warn};

use hk_core::config::AuthSection;
use hk_core::types::{ExternalId, UserId};

use crate::crypto::SecretCipher;
use crate::store::{AuditEvent, AuditSink, AuditStatus, CredentialRecord, CredentialStore};
use crate::{totp, AuthError};

/// Memory cost for argon2id, in KiB.
const ARGON_MEMORY_KIB: u32 = 19_456;
/// Backup codes issued per MFA enrollment.
const BACKUP_CODE_COUNT: usize = 10;
/// Backup codes are 8 random bytes, hex-encoded.
const BACKUP_CODE_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Successful password verification.
#[derive(Debug, Clone, Copy)]
pub struct VerifyOutcome {
    pub mfa_required: bool,
    pub force_password_change: bool,
}

/// Result of enabling MFA. The secret and plain backup codes are shown to
/// the user exactly once and never stored in this form.
#[derive(Debug)]
pub struct MfaEnrollment {
    pub secret: String,
    pub backup_codes: Vec<String>,
    pub provisioning_uri: String,
}

// ---------------------------------------------------------------------------
// CredentialService
// ---------------------------------------------------------------------------

pub struct CredentialService {
    store: Arc<dyn CredentialStore>,
    audit: Arc<dyn AuditSink>,
    config: AuthSection,
    cipher: SecretCipher,
    /// Verified against when no credential row exists, so the caller cannot
    /// tell a missing account from a wrong password by timing.
    dummy_hash: String,
}

impl CredentialService {
    pub async fn new(
        store: Arc<dyn CredentialStore>,
        audit: Arc<dyn AuditSink>,
        config: AuthSection,
        cipher: SecretCipher,
    ) -> Result<Self, AuthError> {
        let rounds = config.password_hash_rounds;
        let dummy_hash = hash_blocking("decoy-password".to_string(), rounds).await?;
        Ok(Self {
            store,
            audit,
            config,
            cipher,
            dummy_hash,
        })
    }

    // ----- credential lifecycle -----

    /// Create the credential row for a user, optionally with an initial password.
    pub async fn create_credentials(
        &self,
        user_id: UserId,
        external_id: ExternalId,
        password: Option<&str>,
    ) -> Result<(), AuthError> {
        let mut record = CredentialRecord::new(user_id, external_id);
        if let Some(password) = password {
            self.check_strength(password)?;
            record.password_hash = Some(self.hash(password).await?);
            record.password_set_at = Some(Utc::now());
        }
        self.store.insert(record).await?;
        info!(user = %user_id, "credentials created");
        Ok(())
    }

    /// Set or replace the password; resets the failure counter and any lock.
    pub async fn set_password(
        &self,
        user_id: UserId,
        password: &str,
        force_change: bool,
    ) -> Result<(), AuthError> {
        self.check_strength(password)?;
        let mut record = self
            .store
            .fetch(user_id)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;

        record.password_hash = Some(self.hash(password).await?);
        record.password_set_at = Some(Utc::now());
        record.force_password_change = force_change;
        record.failed_attempts = 0;
        record.locked_until = None;
        self.store.update(&record).await?;

        self.log(Some(user_id), "password_change", AuditStatus::Success, None, None)
            .await;
        Ok(())
    }

    /// Resolve the internal user id for a messenger identity.
    pub async fn lookup_external(
        &self,
        external_id: &ExternalId,
    ) -> Result<Option<UserId>, AuthError> {
        Ok(self
            .store
            .fetch_by_external(external_id)
            .await?
            .map(|record| record.user_id))
    }

    // ----- password verification -----

    pub async fn verify_password(
        &self,
        user_id: UserId,
        password: &str,
        ip_address: Option<&str>,
    ) -> Result<VerifyOutcome, AuthError> {
        let record = match self.store.fetch(user_id).await? {
            Some(record) => record,
            None => {
                // Burn the same hashing cost as the real path.
                let _ = verify_blocking(self.dummy_hash.clone(), password.to_string()).await;
                self.log(
                    Some(user_id),
                    "login_attempt",
                    AuditStatus::Failure,
                    Some("credentials not found"),
                    ip_address,
                )
                .await;
                return Err(AuthError::InvalidCredentials);
            }
        };

        if let Some(until) = record.locked_until {
            if until > Utc::now() {
                self.log(
                    Some(user_id),
                    "login_attempt",
                    AuditStatus::Failure,
                    Some("account locked"),
                    ip_address,
                )
                .await;
                return Err(AuthError::Locked { until });
            }
        }

        let Some(stored_hash) = record.password_hash.clone() else {
            return Err(AuthError::PasswordNotSet);
        };

        if verify_blocking(stored_hash, password.to_string()).await? {
            let mut record = record;
            record.failed_attempts = 0;
            record.locked_until = None;
            record.last_login_at = Some(Utc::now());
            self.store.update(&record).await?;

            self.log(Some(user_id), "password_login", AuditStatus::Success, None, ip_address)
                .await;

            Ok(VerifyOutcome {
                mfa_required: record.mfa_enabled,
                force_password_change: record.force_password_change,
            })
        } else {
            let mut record = record;
            record.failed_attempts += 1;
            let lockout = record.failed_attempts >= self.config.max_login_attempts;
            if lockout {
                record.locked_until =
                    Some(Utc::now() + chrono::Duration::from_std(self.config.lockout_duration)
                        .unwrap_or_else(|_| chrono::Duration::minutes(30)));
                warn!(user = %user_id, attempts = record.failed_attempts, "account locked");
            }
            let attempts_remaining = self
                .config
                .max_login_attempts
                .saturating_sub(record.failed_attempts);
            self.store.update(&record).await?;

            let message = format!("invalid password (attempt {})", record.failed_attempts);
            self.log(
                Some(user_id),
                if lockout { "account_lockout" } else { "login_attempt" },
                AuditStatus::Failure,
                Some(&message),
                ip_address,
            )
            .await;

            Err(AuthError::InvalidPassword { attempts_remaining })
        }
    }

    // ----- MFA -----

    /// Enable MFA: one store write replaces the secret and regenerates all
    /// backup codes, so a half-enrolled state is never observable.
    pub async fn enable_mfa(&self, user_id: UserId) -> Result<MfaEnrollment, AuthError> {
        let mut record = self
            .store
            .fetch(user_id)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;

        let secret = totp::generate_secret();
        let sealed = self
            .cipher
            .seal(secret.as_bytes())
            .map_err(|_| AuthError::Crypto)?;

        let mut codes = Vec::with_capacity(BACKUP_CODE_COUNT);
        let mut hashes = Vec::with_capacity(BACKUP_CODE_COUNT);
        for _ in 0..BACKUP_CODE_COUNT {
            let mut raw = [0u8; BACKUP_CODE_LEN / 2];
            rand::thread_rng().fill_bytes(&mut raw);
            let code = hex::encode(raw);
            hashes.push(self.hash(&code).await?);
            codes.push(code);
        }

        record.totp_secret_sealed = Some(sealed);
        record.backup_code_hashes = hashes;
        record.mfa_enabled = true;
        self.store.update(&record).await?;

        self.log(Some(user_id), "mfa_enabled", AuditStatus::Success, None, None)
            .await;

        let provisioning_uri =
            totp::provisioning_uri(&secret, &format!("user_{}", user_id.0), "Housekeep");
        Ok(MfaEnrollment {
            secret,
            backup_codes: codes,
            provisioning_uri,
        })
    }

    /// Verify a TOTP code or a backup code. Backup codes are single-use:
    /// a match removes the stored hash, so replays always fail.
    pub async fn verify_mfa(&self, user_id: UserId, token: &str) -> Result<(), AuthError> {
        let record = self
            .store
            .fetch(user_id)
            .await?
            .filter(|r| r.mfa_enabled)
            .ok_or(AuthError::MfaRejected)?;

        if let Some(sealed) = &record.totp_secret_sealed {
            let secret = self.cipher.open(sealed).map_err(|_| AuthError::Crypto)?;
            let secret = String::from_utf8(secret).map_err(|_| AuthError::Crypto)?;
            if let Some(key) = totp::decode_secret(&secret) {
                let now = Utc::now().timestamp() as u64;
                if totp::verify_at(&key, token, now) {
                    self.log(Some(user_id), "mfa_verify", AuditStatus::Success, None, None)
                        .await;
                    return Ok(());
                }
            }
        }

        if token.len() == BACKUP_CODE_LEN {
            for (index, hash) in record.backup_code_hashes.iter().enumerate() {
                if verify_blocking(hash.clone(), token.to_string()).await? {
                    let mut record = record.clone();
                    record.backup_code_hashes.remove(index);
                    self.store.update(&record).await?;
                    self.log(
                        Some(user_id),
                        "mfa_backup_code",
                        AuditStatus::Success,
                        Some("backup code consumed"),
                        None,
                    )
                    .await;
                    return Ok(());
                }
            }
        }

        self.log(Some(user_id), "mfa_verify", AuditStatus::Failure, None, None)
            .await;
        Err(AuthError::MfaRejected)
    }

    /// Background task entry: clear locks whose deadline has passed.
    pub async fn cleanup_expired_locks(&self) -> Result<u64, AuthError> {
        Ok(self.store.clear_expired_locks(Utc::now()).await?)
    }

    // ----- helpers -----

    fn check_strength(&self, password: &str) -> Result<(), AuthError> {
        if password.chars().count() < self.config.password_min_length {
            return Err(AuthError::WeakPassword {
                min_length: self.config.password_min_length,
            });
        }
        Ok(())
    }

    async fn hash(&self, password: &str) -> Result<String, AuthError> {
        hash_blocking(password.to_string(), self.config.password_hash_rounds).await
    }

    async fn log(
        &self,
        user_id: Option<UserId>,
        event_type: &str,
        status: AuditStatus,
        message: Option<&str>,
        ip_address: Option<&str>,
    ) {
        self.audit
            .record(AuditEvent {
                user_id,
                external_id: None,
                event_type: event_type.to_string(),
                status,
                message: message.map(str::to_string),
                ip_address: ip_address.map(str::to_string),
                session_id: None,
                at: Utc::now(),
            })
            .await;
    }
}

// ---------------------------------------------------------------------------
// Blocking-pool hashing
// ---------------------------------------------------------------------------

fn argon(rounds: u32) -> Result<Argon2<'static>, AuthError> {
    let params =
        Params::new(ARGON_MEMORY_KIB, rounds.max(1), 1, None).map_err(|_| AuthError::Crypto)?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

async fn hash_blocking(password: String, rounds: u32) -> Result<String, AuthError> {
    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        argon(rounds)?
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|_| AuthError::Crypto)
    })
    .await
    .map_err(|_| AuthError::Crypto)?
}

/// Verify against a PHC hash; the parameter set is read from the hash itself.
async fn verify_blocking(stored: String, password: String) -> Result<bool, AuthError> {
    tokio::task::spawn_blocking(move || {
        let parsed = PasswordHash::new(&stored).map_err(|_| AuthError::Crypto)?;
        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    })
    .await
    .map_err(|_| AuthError::Crypto)?
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryAuthStore;

    async fn service() -> (CredentialService, Arc<MemoryAuthStore>) {
        let store = Arc::new(MemoryAuthStore::new());
        let lookup = |key: &str| match key {
            // Keep hashing cheap in tests.
            "PASSWORD_HASH_ROUNDS" => Some("1".to_string()),
            "MAX_LOGIN_ATTEMPTS" => Some("3".to_string()),
            _ => None,
        };
        let config = hk_core::config::Config::from_lookup(&lookup).unwrap().auth;
        let service = CredentialService::new(
            store.clone(),
            store.clone(),
            config,
            SecretCipher::generate().unwrap(),
        )
        .await
        .unwrap();
        (service, store)
    }

    #[tokio::test]
    async fn correct_password_verifies() {
        let (svc, _) = service().await;
        svc.create_credentials(UserId(1), ExternalId("111".into()), Some("hunter2hunter2"))
            .await
            .unwrap();

        let outcome = svc
            .verify_password(UserId(1), "hunter2hunter2", None)
            .await
            .unwrap();
        assert!(!outcome.mfa_required);
        assert!(!outcome.force_password_change);
    }

    #[tokio::test]
    async fn weak_password_rejected() {
        let (svc, _) = service().await;
        let err = svc
            .create_credentials(UserId(1), ExternalId("111".into()), Some("short"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::WeakPassword { min_length: 8 }));
    }

    #[tokio::test]
    async fn lockout_after_max_attempts() {
        let (svc, _) = service().await;
        svc.create_credentials(UserId(1), ExternalId("111".into()), Some("hunter2hunter2"))
            .await
            .unwrap();

        for expected_remaining in [2u32, 1] {
            let err = svc.verify_password(UserId(1), "wrong-pass", None).await.unwrap_err();
            match err {
                AuthError::InvalidPassword { attempts_remaining } => {
                    assert_eq!(attempts_remaining, expected_remaining)
                }
                other => panic!("unexpected error: {other:?}"),
            }
        }

        let err = svc.verify_password(UserId(1), "wrong-pass", None).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidPassword { attempts_remaining: 0 }));

        // Even the correct password fails while the lock holds.
        let err = svc
            .verify_password(UserId(1), "hunter2hunter2", None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Locked { .. }));
    }

    #[tokio::test]
    async fn lock_clears_and_counter_resets() {
        let (svc, store) = service().await;
        svc.create_credentials(UserId(1), ExternalId("111".into()), Some("hunter2hunter2"))
            .await
            .unwrap();
        for _ in 0..3 {
            let _ = svc.verify_password(UserId(1), "wrong-pass", None).await;
        }

        // Rewind the lock as if the window had elapsed.
        let creds: &dyn CredentialStore = store.as_ref();
        let mut record = creds.fetch(UserId(1)).await.unwrap().unwrap();
        record.locked_until = Some(Utc::now() - chrono::Duration::seconds(1));
        creds.update(&record).await.unwrap();

        let outcome = svc.verify_password(UserId(1), "hunter2hunter2", None).await;
        assert!(outcome.is_ok());

        let record = creds.fetch(UserId(1)).await.unwrap().unwrap();
        assert_eq!(record.failed_attempts, 0);
        assert!(record.locked_until.is_none());
    }

    #[tokio::test]
    async fn unknown_user_is_invalid_credentials() {
        let (svc, _) = service().await;
        let err = svc.verify_password(UserId(404), "whatever-pass", None).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn missing_password_reported() {
        let (svc, _) = service().await;
        svc.create_credentials(UserId(1), ExternalId("111".into()), None)
            .await
            .unwrap();
        let err = svc.verify_password(UserId(1), "anything-long", None).await.unwrap_err();
        assert!(matches!(err, AuthError::PasswordNotSet));
    }

    #[tokio::test]
    async fn mfa_enrollment_and_totp() {
        let (svc, _) = service().await;
        svc.create_credentials(UserId(1), ExternalId("111".into()), Some("hunter2hunter2"))
            .await
            .unwrap();

        let enrollment = svc.enable_mfa(UserId(1)).await.unwrap();
        assert_eq!(enrollment.backup_codes.len(), 10);
        assert!(enrollment.provisioning_uri.contains(&enrollment.secret));

        let key = totp::decode_secret(&enrollment.secret).unwrap();
        let code = totp::code_at(&key, Utc::now().timestamp() as u64);
        svc.verify_mfa(UserId(1), &code).await.unwrap();

        let outcome = svc
            .verify_password(UserId(1), "hunter2hunter2", None)
            .await
            .unwrap();
        assert!(outcome.mfa_required);
    }

    #[tokio::test]
    async fn backup_code_single_use() {
        let (svc, _) = service().await;
        svc.create_credentials(UserId(1), ExternalId("111".into()), Some("hunter2hunter2"))
            .await
            .unwrap();
        let enrollment = svc.enable_mfa(UserId(1)).await.unwrap();
        let code = enrollment.backup_codes[3].clone();

        svc.verify_mfa(UserId(1), &code).await.unwrap();

        // Replay always fails.
        let err = svc.verify_mfa(UserId(1), &code).await.unwrap_err();
        assert!(matches!(err, AuthError::MfaRejected));
    }

    #[tokio::test]
    async fn enabling_mfa_again_invalidates_old_codes() {
        let (svc, _) = service().await;
        svc.create_credentials(UserId(1), ExternalId("111".into()), Some("hunter2hunter2"))
            .await
            .unwrap();
        let first = svc.enable_mfa(UserId(1)).await.unwrap();
        let second = svc.enable_mfa(UserId(1)).await.unwrap();

        assert_ne!(first.secret, second.secret);
        let err = svc
            .verify_mfa(UserId(1), &first.backup_codes[0])
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::MfaRejected));
        svc.verify_mfa(UserId(1), &second.backup_codes[0]).await.unwrap();
    }

    #[tokio::test]
    async fn audit_trail_has_no_secrets() {
        let (svc, store) = service().await;
        svc.create_credentials(UserId(1), ExternalId("111".into()), Some("hunter2hunter2"))
            .await
            .unwrap();
        let _ = svc.verify_password(UserId(1), "wrong-pass", Some("10.0.0.9")).await;

        let events = store.audit_events();
        assert!(!events.is_empty());
        for event in &events {
            let serialized = serde_json::to_string(event).unwrap();
            assert!(!serialized.contains("hunter2"));
            assert!(!serialized.contains("wrong-pass"));
        }
        assert_eq!(events.last().unwrap().ip_address.as_deref(), Some("10.0.0.9"));
    }
}
