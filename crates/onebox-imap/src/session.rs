//! The session contract the sync engine is written against

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::{CancelToken, FetchedMessage, ImapResult};

/// Why [`MailSession::wait_for_change`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleEvent {
    /// The server reported a mailbox change
    Changed,
    /// Keepalive interval elapsed without news
    Timeout,
    /// The caller's cancellation token fired
    Cancelled,
}

/// Folder status returned by SELECT
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailboxStatus {
    pub name: String,
    pub exists: u32,
    pub uid_next: Option<u32>,
    pub uid_validity: Option<u32>,
}

/// One authenticated connection bound to one mailbox
#[async_trait]
pub trait MailSession: Send {
    /// Open the transport and log in
    ///
    /// Bad credentials yield [`crate::ImapError::AuthenticationFailed`];
    /// network and TLS problems yield transient errors.
    async fn connect(&mut self) -> ImapResult<()>;

    /// Select a folder, failing with [`crate::ImapError::FolderNotFound`] if absent
    async fn select_folder(&mut self, folder: &str) -> ImapResult<MailboxStatus>;

    /// Lazily fetch messages with `from_uid <= uid <= to_uid` in ascending UID order
    ///
    /// `to_uid = None` means up to the newest message. A failure mid-range is
    /// yielded as the final item; items yielded before it remain valid.
    async fn fetch_range<'a>(
        &'a mut self,
        folder: &str,
        from_uid: u32,
        to_uid: Option<u32>,
    ) -> ImapResult<BoxStream<'a, ImapResult<FetchedMessage>>>;

    /// Block until the server signals a change or `cancel` fires
    ///
    /// Cancellation is not an error: it returns [`IdleEvent::Cancelled`].
    async fn wait_for_change(
        &mut self,
        folder: &str,
        cancel: &mut CancelToken,
    ) -> ImapResult<IdleEvent>;

    /// Log out and drop the transport. Safe to call in any state, any number of times.
    async fn disconnect(&mut self);

    /// Whether a logged-in transport is currently held
    fn is_connected(&self) -> bool;
}
