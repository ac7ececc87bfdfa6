//! AES-256-GCM sealing for secrets at rest.
//!
//! Cookies, SMTP passwords, and webhook HMAC keys are persisted only as
//! ciphertext in the format `nonce (12 bytes) || ciphertext || tag (16
//! bytes)`. The key is process-wide configuration; plaintext exists only in
//! memory, inside the capture or send call that needs it.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use thiserror::Error;

const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length: expected at least 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("invalid ciphertext: too short")]
    InvalidCiphertext,
}

/// Process-wide secret sealer. Cheap to clone.
#[derive(Clone)]
pub struct SecretBox {
    key: [u8; 32],
}

impl SecretBox {
    /// Build from configured key material; the first 32 bytes are used.
    pub fn new(key_material: &[u8]) -> Result<Self, CryptoError> {
        if key_material.len() < 32 {
            return Err(CryptoError::InvalidKeyLength(key_material.len()));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&key_material[..32]);
        Ok(Self { key })
    }

    /// Encrypt, prefixing a fresh random 12-byte nonce.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt data sealed by [`SecretBox::seal`].
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::InvalidCiphertext);
        }

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;

        let nonce = Nonce::from_slice(&sealed[..NONCE_SIZE]);
        cipher
            .decrypt(nonce, &sealed[NONCE_SIZE..])
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
    }

    /// Convenience for string secrets stored as UTF-8.
    pub fn open_string(&self, sealed: &[u8]) -> Result<String, CryptoError> {
        let plaintext = self.open(sealed)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::InvalidCiphertext)
    }
}

impl std::fmt::Debug for SecretBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose key bytes, even in debug output.
        f.debug_struct("SecretBox").finish_non_exhaustive()
    }
}
