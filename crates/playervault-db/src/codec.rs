//! Stateless encode/decode and hash routines for identifiers and secrets.
//!
//! Every function here is pure: no shared state, no I/O, safe to call from
//! any number of worker threads without synchronization.
//!
//! | Function | Use |
//! |----------|-----|
//! | [`encode`] / [`decode`] | Standard base64 for binary payloads in text columns |
//! | [`digest`] | SHA-256, one-way, for identifier fingerprints |
//! | [`to_hex`] / [`from_hex`] | Lowercase hex rendering of digests |
//! | [`fingerprint`] | Hex SHA-256 of a player's 16 key bytes |
//! | [`id_to_bytes`] / [`id_from_bytes`] | 16-byte big-endian identity encoding |

use std::fmt::Write as _;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use playervault_types::PlayerId;
use sha2::{Digest as _, Sha256};
use uuid::Uuid;

/// Length of a [`digest`] output in bytes.
pub const DIGEST_LEN: usize = 32;

/// Errors produced while decoding stored text or opening sealed secrets.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The text was not valid base64.
    #[error("invalid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    /// The text was not valid hex.
    #[error("invalid hex: {0}")]
    InvalidHex(String),

    /// A decoded value had the wrong length.
    #[error("invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength {
        /// Required length.
        expected: usize,
        /// Length actually found.
        actual: usize,
    },

    /// A sealed value was found but no master key is configured.
    #[error("sealed secret found but no master key is configured")]
    MissingKey,

    /// Authenticated encryption or decryption failed.
    #[error("secret sealing failed: {0}")]
    Sealing(String),
}

/// Encode bytes as standard (padded) base64.
pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode standard base64 text.
///
/// # Errors
///
/// Returns [`CodecError::InvalidBase64`] if the text is malformed.
pub fn decode(text: &str) -> Result<Vec<u8>, CodecError> {
    Ok(STANDARD.decode(text)?)
}

/// SHA-256 digest of `bytes`.
pub fn digest(bytes: &[u8]) -> [u8; DIGEST_LEN] {
    Sha256::digest(bytes).into()
}

/// Render bytes as lowercase hex.
pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len().saturating_mul(2));
    for byte in bytes {
        // Writing to a String cannot fail.
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Parse hex text (either case) back into bytes.
///
/// # Errors
///
/// Returns [`CodecError::InvalidHex`] on odd length or a non-hex digit.
pub fn from_hex(text: &str) -> Result<Vec<u8>, CodecError> {
    if text.len() % 2 != 0 {
        return Err(CodecError::InvalidHex(format!("odd length {}", text.len())));
    }
    text.as_bytes()
        .chunks_exact(2)
        .map(|pair| {
            core::str::from_utf8(pair)
                .ok()
                .and_then(|digits| u8::from_str_radix(digits, 16).ok())
                .ok_or_else(|| CodecError::InvalidHex(String::from_utf8_lossy(pair).into_owned()))
        })
        .collect()
}

/// Stable, non-reversible fingerprint of a player identity.
///
/// Stored in its own uniquely-indexed column so operators can correlate
/// rows with external systems without exposing the raw key.
pub fn fingerprint(id: PlayerId) -> String {
    to_hex(&digest(id.as_bytes()))
}

/// The 16 big-endian bytes of a player identity.
pub fn id_to_bytes(id: PlayerId) -> [u8; 16] {
    *id.as_bytes()
}

/// Rebuild a [`PlayerId`] from its 16 big-endian bytes.
///
/// # Errors
///
/// Returns [`CodecError::InvalidLength`] if `bytes` is not 16 bytes long.
pub fn id_from_bytes(bytes: &[u8]) -> Result<PlayerId, CodecError> {
    Uuid::from_slice(bytes)
        .map(PlayerId)
        .map_err(|_uuid_err| CodecError::InvalidLength {
            expected: 16,
            actual: bytes.len(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_inverts_encode() {
        let samples: [&[u8]; 5] = [b"", b"f", b"fo", b"foobar", &[0, 255, 1, 254, 128]];
        for sample in samples {
            let text = encode(sample);
            assert_eq!(decode(&text).ok().as_deref(), Some(sample));
        }

        let all_bytes: Vec<u8> = (0..=255).collect();
        assert_eq!(decode(&encode(&all_bytes)).ok(), Some(all_bytes));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(decode("not base64!"), Err(CodecError::InvalidBase64(_))));
    }

    #[test]
    fn digest_is_deterministic_sha256() {
        // SHA-256("abc") test vector.
        assert_eq!(
            to_hex(&digest(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(digest(b"player"), digest(b"player"));
        assert_ne!(digest(b"player-1"), digest(b"player-2"));
    }

    #[test]
    fn hex_roundtrip_and_rejects() {
        let bytes = digest(b"abc");
        assert_eq!(from_hex(&to_hex(&bytes)).ok().as_deref(), Some(&bytes[..]));
        assert_eq!(from_hex("0AfF").ok(), Some(vec![0x0a, 0xff]));
        assert!(matches!(from_hex("abc"), Err(CodecError::InvalidHex(_))));
        assert!(matches!(from_hex("zz"), Err(CodecError::InvalidHex(_))));
    }

    #[test]
    fn fingerprint_is_stable_per_identity() {
        let id = PlayerId::new();
        let other = PlayerId::new();
        assert_eq!(fingerprint(id), fingerprint(id));
        assert_ne!(fingerprint(id), fingerprint(other));
        assert_eq!(fingerprint(id).len(), DIGEST_LEN * 2);
    }

    #[test]
    fn identity_bytes_roundtrip() {
        let id = PlayerId::new();
        assert_eq!(id_from_bytes(&id_to_bytes(id)).ok(), Some(id));
        assert!(matches!(
            id_from_bytes(&[1, 2, 3]),
            Err(CodecError::InvalidLength { expected: 16, actual: 3 })
        ));
    }
}
