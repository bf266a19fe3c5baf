//! Encryption for credential material at rest.
//!
//! TOTP secrets must be readable by the auth service (TOTP is symmetric) but
//! must not sit in the database as plaintext. They are sealed with
//! ChaCha20-Poly1305 AEAD under a service-level key; the key itself is zeroed
//! from memory on drop.

use ring::aead::{
    Aad, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey, CHACHA20_POLY1305,
};
use ring::error::Unspecified;
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// ChaCha20-Poly1305 key size (256 bits).
const KEY_LEN: usize = 32;
/// Nonce size (96 bits).
const NONCE_LEN: usize = 12;
/// Authentication tag appended to ciphertext (128 bits).
const TAG_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("failed to draw system entropy")]
    RandomGeneration,
    #[error("seal failed")]
    Seal,
    #[error("open failed (wrong key or tampered ciphertext)")]
    Open,
    #[error("invalid sealed blob: {0}")]
    InvalidFormat(String),
}

impl From<Unspecified> for CryptoError {
    fn from(_: Unspecified) -> Self {
        CryptoError::Seal
    }
}

// ---------------------------------------------------------------------------
// Nonce handling
// ---------------------------------------------------------------------------

/// Single-use nonce sequence: ring requires a sequence, we need exactly one.
struct OneNonce(Option<Nonce>);

impl NonceSequence for OneNonce {
    fn advance(&mut self) -> Result<Nonce, Unspecified> {
        self.0.take().ok_or(Unspecified)
    }
}

// ---------------------------------------------------------------------------
// SecretCipher
// ---------------------------------------------------------------------------

/// Sealing/opening of small credential secrets under one service key.
///
/// Blob layout: `[nonce (12) || ciphertext || tag (16)]`.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretCipher {
    key: [u8; KEY_LEN],
}

impl SecretCipher {
    /// Derive the cipher from raw key bytes (exactly 32).
    pub fn from_key_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::InvalidFormat(format!(
                "key must be {KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(bytes);
        Ok(Self { key })
    }

    /// Derive a key from an arbitrary-length secret string by hashing it.
    pub fn from_secret(secret: &str) -> Self {
        let digest = ring::digest::digest(&ring::digest::SHA256, secret.as_bytes());
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(digest.as_ref());
        Self { key }
    }

    /// Generate a random cipher (tests, key rotation bootstrap).
    pub fn generate() -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let mut key = [0u8; KEY_LEN];
        rng.fill(&mut key).map_err(|_| CryptoError::RandomGeneration)?;
        Ok(Self { key })
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let rng = SystemRandom::new();
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rng.fill(&mut nonce_bytes)
            .map_err(|_| CryptoError::RandomGeneration)?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let unbound =
            UnboundKey::new(&CHACHA20_POLY1305, &self.key).map_err(|_| CryptoError::Seal)?;
        let mut sealing_key = SealingKey::new(unbound, OneNonce(Some(nonce)));

        let mut in_out = plaintext.to_vec();
        sealing_key
            .seal_in_place_append_tag(Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::Seal)?;

        let mut blob = nonce_bytes.to_vec();
        blob.extend_from_slice(&in_out);
        Ok(blob)
    }

    pub fn open(&self, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::InvalidFormat(format!(
                "sealed blob too short: {} bytes",
                blob.len()
            )));
        }

        let nonce_bytes: [u8; NONCE_LEN] = blob[..NONCE_LEN]
            .try_into()
            .map_err(|_| CryptoError::InvalidFormat("bad nonce".into()))?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let unbound =
            UnboundKey::new(&CHACHA20_POLY1305, &self.key).map_err(|_| CryptoError::Open)?;
        let mut opening_key = OpeningKey::new(unbound, OneNonce(Some(nonce)));

        let mut in_out = blob[NONCE_LEN..].to_vec();
        let plaintext = opening_key
            .open_in_place(Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::Open)?;
        Ok(plaintext.to_vec())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let cipher = SecretCipher::generate().unwrap();
        let secret = b"JBSWY3DPEHPK3PXP";

        let blob = cipher.seal(secret).unwrap();
        assert_eq!(blob.len(), NONCE_LEN + secret.len() + TAG_LEN);
        assert_eq!(cipher.open(&blob).unwrap(), secret);
    }

    #[test]
    fn random_nonce_varies_ciphertext() {
        let cipher = SecretCipher::generate().unwrap();
        let a = cipher.seal(b"same").unwrap();
        let b = cipher.seal(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails_open() {
        let a = SecretCipher::generate().unwrap();
        let b = SecretCipher::generate().unwrap();
        let blob = a.seal(b"secret").unwrap();
        assert!(matches!(b.open(&blob), Err(CryptoError::Open)));
    }

    #[test]
    fn tampering_fails_open() {
        let cipher = SecretCipher::generate().unwrap();
        let mut blob = cipher.seal(b"secret").unwrap();
        let mid = blob.len() / 2;
        blob[mid] ^= 0xFF;
        assert!(matches!(cipher.open(&blob), Err(CryptoError::Open)));
    }

    #[test]
    fn short_blob_rejected() {
        let cipher = SecretCipher::generate().unwrap();
        assert!(matches!(
            cipher.open(&[0u8; 10]),
            Err(CryptoError::InvalidFormat(_))
        ));
    }

    #[test]
    fn derived_key_is_stable() {
        let a = SecretCipher::from_secret("service-secret");
        let b = SecretCipher::from_secret("service-secret");
        let blob = a.seal(b"payload").unwrap();
        assert_eq!(b.open(&blob).unwrap(), b"payload");
    }
}
