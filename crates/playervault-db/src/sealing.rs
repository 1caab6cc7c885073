//! Authenticated encryption of secret fields before storage.
//!
//! Stored secrets are text with a mode prefix:
//!
//! | Prefix | Payload |
//! |--------|---------|
//! | `ENC:` | base64(`[12B nonce][ciphertext][16B tag]`), AES-256-GCM |
//! | `PLA:` | base64(plaintext), used when no master key is configured |
//! | none   | legacy rows, read as base64 plaintext |
//!
//! A sealer without a key still reads `PLA:` and legacy values but refuses
//! `ENC:` values, so a record sealed under a key is reported unavailable
//! rather than silently reset when the key goes missing.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use rand::Rng;

use crate::codec::{self, CodecError};

/// AES-256-GCM key length in bytes.
pub const KEY_LEN: usize = 32;

/// Nonce length in bytes (AES-GCM standard).
const NONCE_LEN: usize = 12;

/// Authentication tag length appended by AES-GCM.
const TAG_LEN: usize = 16;

const ENCRYPTED_PREFIX: &str = "ENC:";
const PLAINTEXT_PREFIX: &str = "PLA:";

/// Seals and opens secret values.
///
/// Immutable after construction; clone it freely into worker tasks.
#[derive(Clone)]
pub struct SecretSealer {
    cipher: Option<Aes256Gcm>,
}

impl SecretSealer {
    /// A sealer that stores secrets as prefixed base64 plaintext.
    pub const fn plaintext() -> Self {
        Self { cipher: None }
    }

    /// A sealer using the given raw 32-byte key.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidLength`] if the key is not 32 bytes.
    pub fn with_key(key: &[u8]) -> Result<Self, CodecError> {
        if key.len() != KEY_LEN {
            return Err(CodecError::InvalidLength {
                expected: KEY_LEN,
                actual: key.len(),
            });
        }
        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|e| CodecError::Sealing(e.to_string()))?;
        Ok(Self {
            cipher: Some(cipher),
        })
    }

    /// A sealer using a base64-encoded 32-byte key.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if the text is not base64 or the key has the
    /// wrong length.
    pub fn from_base64_key(text: &str) -> Result<Self, CodecError> {
        let key = codec::decode(text.trim())?;
        Self::with_key(&key)
    }

    /// Whether new secrets are encrypted.
    pub const fn is_encrypting(&self) -> bool {
        self.cipher.is_some()
    }

    /// Seal a secret for storage.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Sealing`] if encryption fails.
    pub fn seal(&self, plaintext: &[u8]) -> Result<String, CodecError> {
        let Some(cipher) = &self.cipher else {
            return Ok(format!("{PLAINTEXT_PREFIX}{}", codec::encode(plaintext)));
        };

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| CodecError::Sealing(e.to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN.saturating_add(ciphertext.len()));
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);

        Ok(format!("{ENCRYPTED_PREFIX}{}", codec::encode(&blob)))
    }

    /// Open a stored secret.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::MissingKey`] for an encrypted value when no key
    /// is configured, [`CodecError::Sealing`] if authentication fails, or a
    /// decode error for malformed text.
    pub fn open(&self, stored: &str) -> Result<Vec<u8>, CodecError> {
        if let Some(payload) = stored.strip_prefix(ENCRYPTED_PREFIX) {
            let cipher = self.cipher.as_ref().ok_or(CodecError::MissingKey)?;
            let blob = codec::decode(payload)?;
            if blob.len() < NONCE_LEN.saturating_add(TAG_LEN) {
                return Err(CodecError::InvalidLength {
                    expected: NONCE_LEN.saturating_add(TAG_LEN),
                    actual: blob.len(),
                });
            }
            let (nonce_bytes, ciphertext) =
                blob.split_at_checked(NONCE_LEN)
                    .ok_or(CodecError::InvalidLength {
                        expected: NONCE_LEN,
                        actual: blob.len(),
                    })?;
            return cipher
                .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
                .map_err(|_aead_err| {
                    CodecError::Sealing(String::from(
                        "authentication failed: wrong key or corrupted data",
                    ))
                });
        }

        let payload = stored.strip_prefix(PLAINTEXT_PREFIX).unwrap_or(stored);
        codec::decode(payload)
    }
}

impl core::fmt::Debug for SecretSealer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SecretSealer")
            .field("encrypting", &self.is_encrypting())
            .finish_non_exhaustive()
    }
}

impl Default for SecretSealer {
    fn default() -> Self {
        Self::plaintext()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn test_key() -> Vec<u8> {
        (0..32).collect()
    }

    #[test]
    fn plaintext_mode_roundtrip() {
        let sealer = SecretSealer::plaintext();
        let stored = sealer.seal(b"JBSWY3DPEHPK3PXP").unwrap();
        assert!(stored.starts_with("PLA:"));
        assert_eq!(sealer.open(&stored).unwrap(), b"JBSWY3DPEHPK3PXP");
    }

    #[test]
    fn encrypted_mode_roundtrip_with_fresh_nonces() {
        let sealer = SecretSealer::with_key(&test_key()).unwrap();
        let a = sealer.seal(b"secret").unwrap();
        let b = sealer.seal(b"secret").unwrap();
        assert!(a.starts_with("ENC:"));
        assert_ne!(a, b, "each seal uses a fresh nonce");
        assert_eq!(sealer.open(&a).unwrap(), b"secret");
        assert_eq!(sealer.open(&b).unwrap(), b"secret");
    }

    #[test]
    fn encrypted_value_needs_key() {
        let keyed = SecretSealer::with_key(&test_key()).unwrap();
        let stored = keyed.seal(b"secret").unwrap();
        let keyless = SecretSealer::plaintext();
        assert!(matches!(keyless.open(&stored), Err(CodecError::MissingKey)));
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let stored = SecretSealer::with_key(&test_key())
            .unwrap()
            .seal(b"secret")
            .unwrap();
        let other = SecretSealer::with_key(&[7u8; 32]).unwrap();
        assert!(matches!(other.open(&stored), Err(CodecError::Sealing(_))));
    }

    #[test]
    fn keyed_sealer_reads_plaintext_and_legacy_values() {
        let sealer = SecretSealer::with_key(&test_key()).unwrap();
        let plain = SecretSealer::plaintext().seal(b"old").unwrap();
        assert_eq!(sealer.open(&plain).unwrap(), b"old");
        assert_eq!(sealer.open(&codec::encode(b"legacy")).unwrap(), b"legacy");
    }

    #[test]
    fn truncated_ciphertext_is_rejected() {
        let sealer = SecretSealer::with_key(&test_key()).unwrap();
        let short = format!("ENC:{}", codec::encode(&[0u8; 10]));
        assert!(matches!(
            sealer.open(&short),
            Err(CodecError::InvalidLength { .. })
        ));
    }

    #[test]
    fn key_validation() {
        assert!(SecretSealer::with_key(&[0u8; 16]).is_err());
        assert!(SecretSealer::from_base64_key("%%%").is_err());
        let encoded = codec::encode(&test_key());
        assert!(SecretSealer::from_base64_key(&encoded).unwrap().is_encrypting());
    }

    #[test]
    fn debug_does_not_expose_key() {
        let sealer = SecretSealer::with_key(&test_key()).unwrap();
        let rendered = format!("{sealer:?}");
        assert!(rendered.contains("encrypting: true"));
    }
}
