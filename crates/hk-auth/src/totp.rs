//! RFC 6238 time-based one-time passwords.
//!
//! TOTP is HOTP (RFC 4226) over a moving time counter: the secret keys an
//! HMAC-SHA1 of the 30-second step index, dynamically truncated to a short
//! decimal code. Verification accepts one step of clock skew either way.

use hmac::{Hmac, Mac};
use sha1::Sha1;
use subtle::ConstantTimeEq;

type HmacSha1 = Hmac<Sha1>;

/// Time step in seconds.
pub const STEP_SECS: u64 = 30;
/// Code length in decimal digits.
pub const DIGITS: u32 = 6;
/// Steps of skew tolerated on verification, each way.
const SKEW_STEPS: u64 = 1;

/// Generate a fresh 160-bit secret, base32-encoded for authenticator apps.
pub fn generate_secret() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut bytes);
    base32::encode(base32::Alphabet::Rfc4648 { padding: false }, &bytes)
}

/// Decode a base32 secret back to raw key bytes.
pub fn decode_secret(secret: &str) -> Option<Vec<u8>> {
    base32::decode(base32::Alphabet::Rfc4648 { padding: false }, secret)
}

/// The otpauth:// provisioning URI encoded into enrollment QR codes.
pub fn provisioning_uri(secret: &str, account: &str, issuer: &str) -> String {
    format!(
        "otpauth://totp/{issuer}:{account}?secret={secret}&issuer={issuer}&digits={DIGITS}&period={STEP_SECS}"
    )
}

/// Compute the code for an explicit step counter (HOTP core).
fn hotp(key: &[u8], counter: u64, digits: u32) -> String {
    let mut mac = HmacSha1::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    // Dynamic truncation per RFC 4226 §5.3.
    let offset = (digest[19] & 0x0f) as usize;
    let binary = ((u32::from(digest[offset]) & 0x7f) << 24)
        | (u32::from(digest[offset + 1]) << 16)
        | (u32::from(digest[offset + 2]) << 8)
        | u32::from(digest[offset + 3]);

    let code = binary % 10u32.pow(digits);
    format!("{code:0width$}", width = digits as usize)
}

/// Compute the code for a unix timestamp.
pub fn code_at(key: &[u8], unix_secs: u64) -> String {
    hotp(key, unix_secs / STEP_SECS, DIGITS)
}

/// Verify a presented code at `unix_secs`, tolerating ±1 step of skew.
/// Comparison is constant time per candidate.
pub fn verify_at(key: &[u8], presented: &str, unix_secs: u64) -> bool {
    let step = unix_secs / STEP_SECS;
    let candidates = step.saturating_sub(SKEW_STEPS)..=step + SKEW_STEPS;

    let mut matched = false;
    for candidate in candidates {
        let expected = hotp(key, candidate, DIGITS);
        matched |= bool::from(expected.as_bytes().ct_eq(presented.as_bytes()));
    }
    matched
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 6238 Appendix B reference secret (SHA-1 rows), 8-digit codes.
    const RFC_KEY: &[u8] = b"12345678901234567890";

    #[test]
    fn rfc6238_reference_vectors() {
        let cases = [
            (59u64, "94287082"),
            (1111111109, "07081804"),
            (1111111111, "14050471"),
            (1234567890, "89005924"),
            (2000000000, "69279037"),
            (20000000000, "65353130"),
        ];
        for (time, expected) in cases {
            assert_eq!(hotp(RFC_KEY, time / STEP_SECS, 8), expected, "at t={time}");
        }
    }

    #[test]
    fn code_is_six_digits() {
        let code = code_at(RFC_KEY, 59);
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn verify_accepts_adjacent_steps() {
        let now = 1_700_000_015u64;
        let code = code_at(RFC_KEY, now);

        assert!(verify_at(RFC_KEY, &code, now));
        assert!(verify_at(RFC_KEY, &code, now + STEP_SECS));
        assert!(verify_at(RFC_KEY, &code, now - STEP_SECS));
        assert!(!verify_at(RFC_KEY, &code, now + 2 * STEP_SECS + STEP_SECS));
    }

    #[test]
    fn verify_rejects_wrong_code() {
        let now = 1_700_000_015u64;
        assert!(!verify_at(RFC_KEY, "000000", now));
        assert!(!verify_at(RFC_KEY, "", now));
    }

    #[test]
    fn secret_roundtrips_through_base32() {
        let secret = generate_secret();
        let decoded = decode_secret(&secret).unwrap();
        assert_eq!(decoded.len(), 20);

        let again = generate_secret();
        assert_ne!(secret, again);
    }

    #[test]
    fn provisioning_uri_shape() {
        let uri = provisioning_uri("JBSWY3DPEHPK3PXP", "user_7", "Housekeep");
        assert!(uri.starts_with("otpauth://totp/Housekeep:user_7?"));
        assert!(uri.contains("secret=JBSWY3DPEHPK3PXP"));
        assert!(uri.contains("period=30"));
    }
}
