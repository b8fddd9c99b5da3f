//! Error types for the core module

use onebox_imap::ImapError;
use thiserror::Error;

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in core operations
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database error
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Account not found
    #[error("Account not found: {0}")]
    AccountNotFound(i64),

    /// Message not found
    #[error("Message not found: {0}")]
    MessageNotFound(i64),

    /// Server rejected the account's credentials
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Transport or protocol failure
    #[error("IMAP error: {0}")]
    Imap(ImapError),

    /// A ranged fetch broke off partway
    #[error("Fetch failed at UID {uid:?}: {reason}")]
    Fetch { uid: Option<u32>, reason: String },

    /// Stored credentials could not be decrypted
    #[error("Decryption error: {0}")]
    Decryption(String),

    /// A fetcher for this account is already tracked
    #[error("Account {0} is already syncing")]
    AlreadyRunning(i64),

    /// The reconnect budget ran out
    #[error("Gave up after {attempts} reconnect attempts")]
    ReconnectExhausted { attempts: u32 },

    /// The operation observed a stop request
    #[error("Cancelled")]
    Cancelled,
}

impl CoreError {
    /// Errors after which the loop may back off and retry
    pub fn is_recoverable(&self) -> bool {
        match self {
            CoreError::Imap(e) => e.is_transient(),
            CoreError::Fetch { .. } | CoreError::DatabaseError(_) => true,
            _ => false,
        }
    }
}

impl CoreError {
    /// A write keyed on `account_id` that tripped the accounts foreign key
    /// means the account was deleted underneath the caller
    pub(crate) fn for_account(e: sqlx::Error, account_id: i64) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                CoreError::AccountNotFound(account_id)
            }
            _ => e.into(),
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        CoreError::DatabaseError(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::DatabaseError(e.to_string())
    }
}

impl From<onebox_auth::AuthError> for CoreError {
    fn from(e: onebox_auth::AuthError) -> Self {
        CoreError::Decryption(e.to_string())
    }
}

impl From<ImapError> for CoreError {
    fn from(e: ImapError) -> Self {
        match e {
            ImapError::AuthenticationFailed(msg) => CoreError::Auth(msg),
            ImapError::FetchFailed { uid, reason } => CoreError::Fetch { uid, reason },
            other => CoreError::Imap(other),
        }
    }
}
