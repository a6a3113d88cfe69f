//! Message-at-rest encryption.
//!
//! One symmetric key is loaded from configuration at process start and
//! shared read-only for the process lifetime. Each envelope carries its own
//! fresh random nonce prepended to the ciphertext, the whole thing base64
//! encoded so it can live in a text column.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::Error;

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Symmetric key size in bytes (64 hex characters in configuration)
pub const KEY_SIZE: usize = 32;

/// Process-wide message cipher.
///
/// Cheap to share behind an `Arc`; never mutated after construction.
pub struct MessageCipher {
    cipher: XChaCha20Poly1305,
}

impl MessageCipher {
    /// Build a cipher from the configured hex-encoded key.
    ///
    /// The key must be exactly 64 hex characters (32 bytes); anything else
    /// is a startup-fatal `Error::Configuration`.
    pub fn from_hex_key(hex_key: &str) -> Result<Self, Error> {
        if hex_key.len() != KEY_SIZE * 2 {
            return Err(Error::Configuration(format!(
                "ENCRYPTION_KEY must be exactly {} hex characters ({} bytes), got {}",
                KEY_SIZE * 2,
                KEY_SIZE,
                hex_key.len()
            )));
        }

        let key_bytes: Vec<u8> = hex::decode(hex_key)
            .map_err(|e| Error::Configuration(format!("ENCRYPTION_KEY is not valid hex: {e}")))?;

        let cipher = XChaCha20Poly1305::new_from_slice(&key_bytes)
            .map_err(|_| Error::Configuration("ENCRYPTION_KEY has the wrong length".to_string()))?;

        Ok(Self { cipher })
    }

    /// Encrypt a text payload into an opaque envelope string.
    ///
    /// Envelope layout: base64(nonce || ciphertext), 24-byte nonce.
    pub fn encrypt_text(&self, plaintext: &str) -> Result<String, Error> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| Error::Encryption("cipher rejected payload".to_string()))?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(combined))
    }

    /// Decrypt an envelope string back to its text payload.
    ///
    /// Malformed base64, envelopes shorter than the nonce prefix, and
    /// authentication failures all surface as `Error::Decryption`.
    pub fn decrypt_text(&self, envelope: &str) -> Result<String, Error> {
        let combined = BASE64
            .decode(envelope)
            .map_err(|e| Error::Decryption(format!("envelope is not valid base64: {e}")))?;

        if combined.len() < NONCE_SIZE {
            return Err(Error::Decryption(format!(
                "envelope too short: {} bytes, need at least {}",
                combined.len(),
                NONCE_SIZE
            )));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
        let nonce = XNonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| Error::Decryption("authentication failed".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|_| Error::Decryption("decrypted payload is not UTF-8".to_string()))
    }

    /// Encrypt a structured value by serializing it to JSON first.
    pub fn encrypt_value<T: Serialize>(&self, value: &T) -> Result<String, Error> {
        let json = serde_json::to_string(value)
            .map_err(|e| Error::Encryption(format!("failed to serialize payload: {e}")))?;
        self.encrypt_text(&json)
    }

    /// Decrypt an envelope and parse the JSON payload back into a value.
    pub fn decrypt_value<T: DeserializeOwned>(&self, envelope: &str) -> Result<T, Error> {
        let json = self.decrypt_text(envelope)?;
        serde_json::from_str(&json)
            .map_err(|e| Error::Decryption(format!("decrypted payload is not valid JSON: {e}")))
    }
}
