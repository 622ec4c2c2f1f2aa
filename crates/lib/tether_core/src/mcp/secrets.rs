//! AES-256-GCM encryption for stored connection tokens.
//!
//! Access and refresh tokens are encrypted before they reach the database.
//! Ciphertext layout is base64(`nonce || ciphertext || tag`) with a random
//! 12-byte nonce per value.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

use super::BrokerError;

const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

/// Token cipher keyed from a passphrase (SHA-256 derived).
#[derive(Clone)]
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    pub fn new(passphrase: &str) -> Result<Self, BrokerError> {
        let key = Sha256::digest(passphrase.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| BrokerError::EncryptionError(format!("Key init failed: {e}")))?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, BrokerError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|e| BrokerError::EncryptionError(format!("Encryption failed: {e}")))?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(&combined))
    }

    pub fn decrypt(&self, encrypted_b64: &str) -> Result<String, BrokerError> {
        let combined = base64::engine::general_purpose::STANDARD
            .decode(encrypted_b64)
            .map_err(|e| BrokerError::EncryptionError(format!("Base64 decode failed: {e}")))?;

        if combined.len() < NONCE_SIZE + TAG_SIZE {
            return Err(BrokerError::EncryptionError("Ciphertext too short".into()));
        }

        let (nonce, ciphertext) = combined.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| BrokerError::EncryptionError(format!("Decryption failed: {e}")))?;

        String::from_utf8(plaintext)
            .map_err(|e| BrokerError::EncryptionError(format!("UTF-8 decode failed: {e}")))
    }

    pub fn encrypt_opt(&self, plaintext: Option<&str>) -> Result<Option<String>, BrokerError> {
        plaintext.map(|p| self.encrypt(p)).transpose()
    }

    pub fn decrypt_opt(&self, encrypted: Option<&str>) -> Result<Option<String>, BrokerError> {
        encrypted.map(|e| self.decrypt(e)).transpose()
    }
}
