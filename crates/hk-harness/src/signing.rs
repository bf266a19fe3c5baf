//! HMAC request signing for service-to-service calls.
//!
//! The canonical string is `METHOD\nPATH\nTIMESTAMP\nBODY_HASH` where
//! `BODY_HASH` is the lowercase-hex SHA-256 of the body, or the empty string
//! for bodyless requests. The signature is lowercase-hex HMAC-SHA256 over the
//! canonical string with the peer's secret. Verification rejects stale
//! timestamps before comparing, and compares in constant time.

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Signatures older (or newer) than this are replays or clock drift.
pub const MAX_TIMESTAMP_SKEW_SECS: i64 = 300;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    /// `|now - timestamp|` exceeded the allowed skew.
    #[error("timestamp outside the allowed window (delta {delta_secs}s, max {MAX_TIMESTAMP_SKEW_SECS}s)")]
    StaleTimestamp { delta_secs: i64 },

    /// The signature did not match the canonical string.
    #[error("signature mismatch")]
    Mismatch,
}

// ---------------------------------------------------------------------------
// Signing
// ---------------------------------------------------------------------------

/// Current unix time in seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Build the canonical string for `(method, path, body, timestamp)`.
pub fn canonical_string(method: &str, path: &str, body: &[u8], timestamp: i64) -> String {
    let body_hash = if body.is_empty() {
        String::new()
    } else {
        hex::encode(Sha256::digest(body))
    };
    format!("{}\n{}\n{}\n{}", method.to_uppercase(), path, timestamp, body_hash)
}

/// Sign a request with `secret`, returning the lowercase-hex signature.
pub fn sign(secret: &[u8], method: &str, path: &str, body: &[u8], timestamp: i64) -> String {
    let canonical = canonical_string(method, path, body, timestamp);
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(canonical.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a presented signature against `secret` at time `now`.
pub fn verify(
    secret: &[u8],
    method: &str,
    path: &str,
    body: &[u8],
    timestamp: i64,
    signature: &str,
    now: i64,
) -> Result<(), SignatureError> {
    let delta = (now - timestamp).abs();
    if delta > MAX_TIMESTAMP_SKEW_SECS {
        return Err(SignatureError::StaleTimestamp { delta_secs: delta });
    }

    let expected = sign(secret, method, path, body, timestamp);
    if bool::from(expected.as_bytes().ct_eq(signature.as_bytes())) {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"shared-secret";
    const BODY: &[u8] = br#"{"number":"250927-001"}"#;

    #[test]
    fn sign_and_verify_roundtrip() {
        let ts = 1_700_000_000;
        let sig = sign(SECRET, "POST", "/api/v1/requests", BODY, ts);
        assert!(verify(SECRET, "POST", "/api/v1/requests", BODY, ts, &sig, ts + 10).is_ok());
    }

    #[test]
    fn canonical_string_shape() {
        let s = canonical_string("post", "/api/v1/requests", BODY, 42);
        let parts: Vec<&str> = s.split('\n').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "POST");
        assert_eq!(parts[1], "/api/v1/requests");
        assert_eq!(parts[2], "42");
        assert_eq!(parts[3], hex::encode(Sha256::digest(BODY)));
    }

    #[test]
    fn empty_body_hashes_to_empty_string() {
        let s = canonical_string("GET", "/health", b"", 42);
        assert!(s.ends_with("42\n"));
    }

    #[test]
    fn any_byte_change_flips_verification() {
        let ts = 1_700_000_000;
        let sig = sign(SECRET, "POST", "/api/v1/requests", BODY, ts);

        assert_eq!(
            verify(SECRET, "PUT", "/api/v1/requests", BODY, ts, &sig, ts),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verify(SECRET, "POST", "/api/v1/request", BODY, ts, &sig, ts),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verify(SECRET, "POST", "/api/v1/requests", b"{}", ts, &sig, ts),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verify(SECRET, "POST", "/api/v1/requests", BODY, ts + 1, &sig, ts),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verify(b"other-secret", "POST", "/api/v1/requests", BODY, ts, &sig, ts),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn stale_timestamp_rejected_before_comparison() {
        let ts = 1_700_000_000;
        let sig = sign(SECRET, "GET", "/health", b"", ts);

        let err = verify(SECRET, "GET", "/health", b"", ts, &sig, ts + 301).unwrap_err();
        assert!(matches!(err, SignatureError::StaleTimestamp { delta_secs: 301 }));

        // Future-dated requests are just as suspect.
        let err = verify(SECRET, "GET", "/health", b"", ts, &sig, ts - 301).unwrap_err();
        assert!(matches!(err, SignatureError::StaleTimestamp { .. }));

        // Exactly at the boundary still verifies.
        assert!(verify(SECRET, "GET", "/health", b"", ts, &sig, ts + 300).is_ok());
    }
}
