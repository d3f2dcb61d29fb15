//! Device-token storage crypto.
//!
//! Tokens are stored as base64(nonce[12] || ciphertext || tag[16]) under
//! AES-256-GCM. A blob that fails to decrypt is treated as "not found",
//! never as an error — rotated keys or garbage rows must not break the
//! registration paths.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// SHA-256 hex of a raw device token; the non-unique lookup key in the
/// devices table.
pub fn token_hash(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

pub struct DeviceTokenCipher {
    cipher: Aes256Gcm,
}

impl DeviceTokenCipher {
    /// Key is 32 bytes, base64-encoded (the `DEVICE_TOKEN_KEY` env var).
    pub fn from_base64_key(key_b64: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(key_b64.trim())
            .context("DEVICE_TOKEN_KEY is not valid base64")?;
        if bytes.len() != 32 {
            bail!(
                "DEVICE_TOKEN_KEY must decode to 32 bytes, got {}",
                bytes.len()
            );
        }
        Ok(DeviceTokenCipher {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&bytes)),
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> String {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .expect("AES-GCM encryption is infallible for in-memory payloads");

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(nonce.as_slice());
        blob.extend_from_slice(&ciphertext);
        BASE64.encode(blob)
    }

    /// `None` on any failure: bad base64, short blob, wrong key, tampered
    /// tag, or non-UTF-8 plaintext.
    pub fn decrypt(&self, blob_b64: &str) -> Option<String> {
        let blob = BASE64.decode(blob_b64.trim()).ok()?;
        if blob.len() < NONCE_LEN + TAG_LEN {
            return None;
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = self.cipher.decrypt(Nonce::from_slice(nonce), ciphertext).ok()?;
        String::from_utf8(plaintext).ok()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> DeviceTokenCipher {
        DeviceTokenCipher::from_base64_key(&BASE64.encode([0u8; 32])).unwrap()
    }

    #[test]
    fn round_trip_preserves_utf8() {
        let c = cipher();
        for input in ["", "abc123", "token-with-ümläuts-🔋", "a".repeat(512).as_str()] {
            let blob = c.encrypt(input);
            assert_eq!(c.decrypt(&blob).as_deref(), Some(input));
        }
    }

    #[test]
    fn nonce_makes_ciphertexts_differ() {
        let c = cipher();
        assert_ne!(c.encrypt("same"), c.encrypt("same"));
    }

    #[test]
    fn garbage_blob_decrypts_to_none() {
        let c = cipher();
        // 27 arbitrary bytes, valid base64 — too short for nonce + tag.
        let short = BASE64.encode([7u8; 27]);
        assert_eq!(c.decrypt(&short), None);
        // Long enough but random: auth tag cannot verify.
        let junk = BASE64.encode([42u8; 64]);
        assert_eq!(c.decrypt(&junk), None);
        assert_eq!(c.decrypt("not base64 at all!"), None);
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let c = cipher();
        let blob = c.encrypt("secret token");
        let mut raw = BASE64.decode(&blob).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        assert_eq!(c.decrypt(&BASE64.encode(raw)), None);
    }

    #[test]
    fn wrong_key_decrypts_to_none() {
        let blob = cipher().encrypt("secret token");
        let other = DeviceTokenCipher::from_base64_key(&BASE64.encode([0xFFu8; 32])).unwrap();
        assert_eq!(other.decrypt(&blob), None);
    }

    #[test]
    fn key_length_is_validated() {
        assert!(DeviceTokenCipher::from_base64_key("AAAA").is_err());
        assert!(DeviceTokenCipher::from_base64_key("not-base64!").is_err());
    }

    #[test]
    fn token_hash_is_sha256_hex() {
        let h = token_hash("device-token");
        assert_eq!(h.len(), 64);
        assert_eq!(h, token_hash("device-token"));
        assert_ne!(h, token_hash("device-token2"));
    }
}
