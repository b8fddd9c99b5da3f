//! Error types for the auth module

use thiserror::Error;

/// Result type for auth operations
pub type AuthResult<T> = Result<T, AuthError>;

/// Errors that can occur while handling credentials
#[derive(Debug, Error)]
pub enum AuthError {
    /// Key material rejected at startup
    #[error("Invalid encryption key: {0}")]
    InvalidKey(String),

    /// Encrypting a secret failed
    #[error("Encryption failed: {0}")]
    Encryption(String),

    /// Ciphertext is malformed or was produced with another key
    #[error("Decryption failed: {0}")]
    Decryption(String),
}
