//! Payload sealing.
//!
//! Every blob crossing the store is sealed with ChaCha20-Poly1305 under a
//! pre-shared key. A fresh random nonce is prepended to each message:
//!
//! ```text
//! nonce (12) || ciphertext || tag (16)
//! ```
//!
//! Tampered, truncated or foreign blobs fail authentication and are reported
//! as [`CodecError`]; decryption never yields unauthenticated bytes.

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("sealed blob is {0} bytes, shorter than nonce and tag")]
    Truncated(usize),
    #[error("authentication failed")]
    Authentication,
    #[error("encryption failed")]
    Encryption,
    #[error("key is not valid base64")]
    KeyEncoding,
    #[error("key must be {KEY_SIZE} bytes, got {0}")]
    KeyLength(usize),
}

/// Symmetric encrypt/decrypt applied to every blob payload.
pub trait Codec: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CodecError>;

    fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CodecError>;
}

/// Pre-shared 256-bit key. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedKey([u8; KEY_SIZE]);

impl SharedKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Accepts standard or URL-safe base64.
    pub fn from_base64(text: &str) -> Result<Self, CodecError> {
        let text = text.trim();
        let mut raw = STANDARD
            .decode(text)
            .or_else(|_| URL_SAFE.decode(text))
            .map_err(|_| CodecError::KeyEncoding)?;

        if raw.len() != KEY_SIZE {
            let len = raw.len();
            raw.zeroize();
            return Err(CodecError::KeyLength(len));
        }

        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&raw);
        raw.zeroize();
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedKey(..)")
    }
}

pub struct SealedBoxCodec {
    cipher: ChaCha20Poly1305,
}

impl SealedBoxCodec {
    pub fn new(key: &SharedKey) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key.0)),
        }
    }

    pub fn from_base64(text: &str) -> Result<Self, CodecError> {
        Ok(Self::new(&SharedKey::from_base64(text)?))
    }
}

impl Codec for SealedBoxCodec {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CodecError::Encryption)?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CodecError> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CodecError::Truncated(sealed.len()));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CodecError::Authentication)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec(seed: u8) -> SealedBoxCodec {
        SealedBoxCodec::new(&SharedKey::from_bytes([seed; KEY_SIZE]))
    }

    #[test]
    fn test_round_trip() {
        let codec = codec(7);
        let inputs: [&[u8]; 4] = [b"", b"x", b"GET / HTTP/1.0\r\n\r\n", &[0u8; 4096]];
        for input in inputs {
            let sealed = codec.encrypt(input).unwrap();
            assert_eq!(sealed.len(), NONCE_SIZE + input.len() + TAG_SIZE);
            assert_eq!(codec.decrypt(&sealed).unwrap(), input);
        }
    }

    #[test]
    fn test_nonce_is_fresh() {
        let codec = codec(7);
        assert_ne!(codec.encrypt(b"same").unwrap(), codec.encrypt(b"same").unwrap());
    }

    #[test]
    fn test_tampering_detected() {
        let codec = codec(7);
        let mut sealed = codec.encrypt(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert_eq!(codec.decrypt(&sealed), Err(CodecError::Authentication));
    }

    #[test]
    fn test_wrong_key_detected() {
        let sealed = codec(1).encrypt(b"payload").unwrap();
        assert_eq!(codec(2).decrypt(&sealed), Err(CodecError::Authentication));
    }

    #[test]
    fn test_truncated_input() {
        assert_eq!(codec(1).decrypt(&[0u8; 10]), Err(CodecError::Truncated(10)));
    }

    #[test]
    fn test_key_from_base64() {
        let text = STANDARD.encode([9u8; KEY_SIZE]);
        let a = SealedBoxCodec::from_base64(&text).unwrap();
        let b = SealedBoxCodec::from_base64(&URL_SAFE.encode([9u8; KEY_SIZE])).unwrap();
        let sealed = a.encrypt(b"hi").unwrap();
        assert_eq!(b.decrypt(&sealed).unwrap(), b"hi");

        assert!(matches!(
            SharedKey::from_base64(&STANDARD.encode([1u8; 16])),
            Err(CodecError::KeyLength(16))
        ));
        assert!(matches!(
            SharedKey::from_base64("not base64!"),
            Err(CodecError::KeyEncoding)
        ));
    }
}
