//! Encryption of wallet private keys at rest.
//!
//! Keys are sealed with AES-256-GCM under a random 96-bit nonce and stored as
//! `base64(nonce || ciphertext)`. Plaintext only ever lives in a
//! [`Zeroizing`] buffer for the duration of a signing operation.

use crate::error::{WorkerError, WorkerResult};
use aes_gcm::{aead::Aead, Aes256Gcm, Key, KeyInit, Nonce};
use base64::{engine::general_purpose::STANDARD as B64, Engine};
use rand::{rngs::OsRng, RngCore};
use std::fmt;
use zeroize::{Zeroize, Zeroizing};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Symmetric cipher for private keys.
#[derive(Clone)]
pub struct KeyCipher {
    cipher: Aes256Gcm,
}

impl fmt::Debug for KeyCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyCipher").finish_non_exhaustive()
    }
}

impl KeyCipher {
    /// Builds a cipher from raw key bytes.
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Builds a cipher from a base64-encoded 32-byte key.
    pub fn from_base64(encoded: &str) -> WorkerResult<Self> {
        let mut key = B64
            .decode(encoded.trim())
            .map_err(|e| WorkerError::Config(format!("encryption key is not base64: {e}")))?;
        if key.len() != KEY_LEN {
            let len = key.len();
            key.zeroize();
            return Err(WorkerError::Config(format!(
                "encryption key must be {KEY_LEN} bytes, got {len}"
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| WorkerError::Encryption(e.to_string()));
        key.zeroize();
        Ok(Self { cipher: cipher? })
    }

    /// Generates a fresh random key, base64-encoded.
    pub fn generate_key() -> String {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut key[..]);
        B64.encode(&key[..])
    }

    /// Encrypts `plaintext` and returns `base64(nonce || ciphertext)`.
    pub fn encrypt(&self, plaintext: &[u8]) -> WorkerResult<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| WorkerError::Encryption("encryption failed".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(B64.encode(sealed))
    }

    /// Reverses [`KeyCipher::encrypt`].
    pub fn decrypt(&self, sealed: &str) -> WorkerResult<Zeroizing<Vec<u8>>> {
        let bytes = B64
            .decode(sealed.trim())
            .map_err(|e| WorkerError::Encryption(format!("invalid base64: {e}")))?;
        if bytes.len() <= NONCE_LEN {
            return Err(WorkerError::Encryption("ciphertext too short".to_string()));
        }
        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| WorkerError::Encryption("decryption failed (wrong key?)".to_string()))
    }
}
