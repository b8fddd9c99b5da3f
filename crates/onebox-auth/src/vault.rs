//! Symmetric encryption of account secrets
//!
//! AES-256-GCM keyed by the SHA-256 digest of the configured key material.
//! Every call to [`Vault::encrypt`] draws a fresh 96-bit nonce which is stored
//! in front of the ciphertext, so the output is `base64(nonce || ciphertext)`.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{AuthError, AuthResult};

/// Minimum accepted length of the key material, in bytes
pub const MIN_KEY_LENGTH: usize = 32;

/// Nonce size for AES-GCM (96 bits / 12 bytes)
const NONCE_SIZE: usize = 12;

/// Encrypts and decrypts mailbox credentials
pub struct Vault {
    cipher: Aes256Gcm,
}

impl Vault {
    /// Create a vault from raw key material
    ///
    /// Material shorter than [`MIN_KEY_LENGTH`] bytes is rejected so a
    /// misconfigured deployment fails at startup instead of storing weakly
    /// protected secrets.
    pub fn new(key_material: &str) -> AuthResult<Self> {
        if key_material.len() < MIN_KEY_LENGTH {
            return Err(AuthError::InvalidKey(format!(
                "key material must be at least {} bytes, got {}",
                MIN_KEY_LENGTH,
                key_material.len()
            )));
        }

        let key = Sha256::digest(key_material.as_bytes());
        let cipher = Aes256Gcm::new(&key);
        debug!("Credential vault initialized");
        Ok(Self { cipher })
    }

    /// Encrypt a secret
    pub fn encrypt(&self, secret: &str) -> AuthResult<String> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, secret.as_bytes())
            .map_err(|e| AuthError::Encryption(e.to_string()))?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(&combined))
    }

    /// Decrypt a value produced by [`Vault::encrypt`]
    pub fn decrypt(&self, encoded: &str) -> AuthResult<String> {
        let combined = BASE64
            .decode(encoded.trim())
            .map_err(|e| AuthError::Decryption(format!("invalid base64: {}", e)))?;

        // Tag alone is 16 bytes, so anything not longer than the nonce is garbage
        if combined.len() <= NONCE_SIZE {
            return Err(AuthError::Decryption(format!(
                "ciphertext too short ({} bytes)",
                combined.len()
            )));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| AuthError::Decryption("authentication tag mismatch".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|e| AuthError::Decryption(format!("plaintext is not UTF-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const KEY: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn test_round_trip() {
        let vault = Vault::new(KEY).unwrap();
        let encrypted = vault.encrypt("hunter2").unwrap();
        assert_ne!(encrypted, "hunter2");
        assert_eq!(vault.decrypt(&encrypted).unwrap(), "hunter2");
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let vault = Vault::new(KEY).unwrap();
        let a = vault.encrypt("same secret").unwrap();
        let b = vault.encrypt("same secret").unwrap();
        assert_ne!(a, b);
        assert_eq!(vault.decrypt(&a).unwrap(), vault.decrypt(&b).unwrap());
    }

    #[test]
    fn test_short_key_rejected() {
        let result = Vault::new("too-short");
        assert!(matches!(result, Err(AuthError::InvalidKey(_))));
    }

    #[test]
    fn test_wrong_key_fails() {
        let vault = Vault::new(KEY).unwrap();
        let other = Vault::new("fedcba9876543210fedcba9876543210").unwrap();
        let encrypted = vault.encrypt("secret").unwrap();
        assert!(matches!(
            other.decrypt(&encrypted),
            Err(AuthError::Decryption(_))
        ));
    }

    #[test]
    fn test_malformed_input_fails() {
        let vault = Vault::new(KEY).unwrap();
        assert!(matches!(
            vault.decrypt("not base64 at all!"),
            Err(AuthError::Decryption(_))
        ));
        assert!(matches!(
            vault.decrypt(&BASE64.encode([1u8; 8])),
            Err(AuthError::Decryption(_))
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let vault = Vault::new(KEY).unwrap();
        let encrypted = vault.encrypt("secret").unwrap();
        let mut bytes = BASE64.decode(&encrypted).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(vault.decrypt(&BASE64.encode(&bytes)).is_err());
    }

    proptest! {
        #[test]
        fn prop_round_trip_arbitrary_secrets(secret in ".*") {
            let vault = Vault::new(KEY).unwrap();
            let encrypted = vault.encrypt(&secret).unwrap();
            prop_assert_eq!(vault.decrypt(&encrypted).unwrap(), secret);
        }
    }
}
