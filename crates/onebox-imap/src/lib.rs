//! IMAP session layer for Onebox
//!
//! Provides the [`MailSession`] contract used by the sync engine and an
//! [`ImapSession`] implementation on top of async-imap, with IDLE used as the
//! wait-for-change primitive.

mod cancel;
mod client;
mod error;
mod message;
mod session;

pub use cancel::{cancellation, CancelHandle, CancelToken};
pub use client::{ImapConfig, ImapSession};
pub use error::{ImapError, ImapResult};
pub use message::{join_addresses, Attachment, EmailAddress, FetchedMessage};
pub use session::{IdleEvent, MailSession, MailboxStatus};
