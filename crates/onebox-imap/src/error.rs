//! Error types for IMAP operations

use thiserror::Error;

/// Result type for IMAP operations
pub type ImapResult<T> = Result<T, ImapError>;

/// Errors that can occur during IMAP operations
#[derive(Debug, Error)]
pub enum ImapError {
    /// Connection failed
    #[error("Failed to connect to IMAP server: {0}")]
    ConnectionFailed(String),

    /// Authentication failed
    #[error("IMAP authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Server returned an error
    #[error("IMAP server error: {0}")]
    ServerError(String),

    /// Folder not found
    #[error("Folder not found: {0}")]
    FolderNotFound(String),

    /// A ranged fetch broke off before the sequence was exhausted
    #[error("Fetch failed at UID {uid:?}: {reason}")]
    FetchFailed { uid: Option<u32>, reason: String },

    /// TLS error
    #[error("TLS error: {0}")]
    TlsError(String),

    /// Server closed the connection
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Session is not connected
    #[error("IMAP session is not connected")]
    NotConnected,

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,
}

impl ImapError {
    /// Whether reconnecting may fix this error
    ///
    /// Authentication failures and missing folders need operator action;
    /// everything on the transport side is worth another attempt.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            ImapError::AuthenticationFailed(_) | ImapError::FolderNotFound(_)
        )
    }

    /// Whether the server rejected the credentials
    pub fn is_auth(&self) -> bool {
        matches!(self, ImapError::AuthenticationFailed(_))
    }
}

impl From<async_imap::error::Error> for ImapError {
    fn from(e: async_imap::error::Error) -> Self {
        use async_imap::error::Error;
        match e {
            Error::Io(io) => ImapError::IoError(io),
            Error::ConnectionLost => ImapError::ConnectionLost("server hung up".to_string()),
            other => ImapError::ServerError(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ImapError::ConnectionFailed("refused".into()).is_transient());
        assert!(ImapError::Timeout.is_transient());
        assert!(ImapError::FetchFailed {
            uid: Some(13),
            reason: "reset".into()
        }
        .is_transient());
        assert!(!ImapError::AuthenticationFailed("bad password".into()).is_transient());
        assert!(!ImapError::FolderNotFound("Nope".into()).is_transient());
        assert!(ImapError::AuthenticationFailed("x".into()).is_auth());
    }
}
