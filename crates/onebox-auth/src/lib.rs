//! Credential handling for Onebox
//!
//! Mailbox passwords are stored encrypted; the [`Vault`] turns them back into
//! plaintext only when a session is about to log in.

mod error;
mod vault;

pub use error::{AuthError, AuthResult};
pub use vault::{Vault, MIN_KEY_LENGTH};
