//! IMAP session implementation on top of async-imap

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_imap::extensions::idle::IdleResponse;
use async_imap::Session;
use async_native_tls::{TlsConnector, TlsStream};
use async_std::net::TcpStream;
use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use tracing::{debug, info, warn};

use crate::{
    CancelToken, FetchedMessage, IdleEvent, ImapError, ImapResult, MailSession, MailboxStatus,
};

/// Items requested per message; PEEK keeps the \Seen flag untouched
const FETCH_QUERY: &str = "(UID BODY.PEEK[])";

/// Polling interval for servers without IDLE
const POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Upper bound on LOGOUT against a possibly dead peer
const LOGOUT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection parameters for one mailbox
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub use_tls: bool,
    /// IDLE is re-issued after this long (RFC 2177 recommends < 29 min)
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
}

impl ImapConfig {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
        use_tls: bool,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
            use_tls,
            idle_timeout: Duration::from_secs(28 * 60),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Plain or TLS transport
#[derive(Debug)]
enum ImapStream {
    Plain(TcpStream),
    Tls(TlsStream<TcpStream>),
}

impl AsyncRead for ImapStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ImapStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ImapStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ImapStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ImapStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ImapStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ImapStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ImapStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ImapStream::Plain(s) => Pin::new(s).poll_close(cx),
            ImapStream::Tls(s) => Pin::new(s).poll_close(cx),
        }
    }
}

/// Password-authenticated IMAP session
pub struct ImapSession {
    config: ImapConfig,
    session: Option<Session<ImapStream>>,
    supports_idle: bool,
    last_status: Option<MailboxStatus>,
    /// Folder status as of the last fetch
    synced: Option<MailboxStatus>,
}

impl ImapSession {
    /// Create a disconnected session
    pub fn new(config: ImapConfig) -> Self {
        Self {
            config,
            session: None,
            supports_idle: false,
            last_status: None,
            synced: None,
        }
    }

    /// Get the session, returning an error if not connected
    fn session_mut(&mut self) -> ImapResult<&mut Session<ImapStream>> {
        self.session.as_mut().ok_or(ImapError::NotConnected)
    }

    async fn open_stream(&self) -> ImapResult<ImapStream> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        info!("Connecting to {}", addr);

        let tcp_stream = async_std::future::timeout(self.config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ImapError::Timeout)?
            .map_err(|e| ImapError::ConnectionFailed(e.to_string()))?;

        if !self.config.use_tls {
            warn!("Using plaintext IMAP for {}", addr);
            return Ok(ImapStream::Plain(tcp_stream));
        }

        let tls_stream = TlsConnector::new()
            .connect(&self.config.host, tcp_stream)
            .await
            .map_err(|e| ImapError::TlsError(e.to_string()))?;

        debug!("TLS connection established");
        Ok(ImapStream::Tls(tls_stream))
    }

    /// Re-select and compare with the last known status; used without IDLE
    async fn poll_for_change(
        &mut self,
        folder: &str,
        cancel: &mut CancelToken,
    ) -> ImapResult<IdleEvent> {
        let before = self.last_status.clone();

        tokio::select! {
            _ = async_std::task::sleep(POLL_INTERVAL) => {}
            _ = cancel.cancelled() => return Ok(IdleEvent::Cancelled),
        }

        let after = self.select_folder(folder).await?;
        let changed = before.map_or(true, |b| mailbox_changed(&b, &after));

        Ok(if changed {
            IdleEvent::Changed
        } else {
            IdleEvent::Timeout
        })
    }
}

#[async_trait]
impl MailSession for ImapSession {
    async fn connect(&mut self) -> ImapResult<()> {
        self.disconnect().await;

        let stream = self.open_stream().await?;
        let client = async_imap::Client::new(stream);

        info!("Authenticating with LOGIN for {}", self.config.username);
        let mut session = client
            .login(&self.config.username, &self.config.password)
            .await
            .map_err(|(e, _)| match e {
                async_imap::error::Error::No(msg) | async_imap::error::Error::Bad(msg) => {
                    ImapError::AuthenticationFailed(msg)
                }
                other => ImapError::from(other),
            })?;

        let capabilities = session.capabilities().await?;
        self.supports_idle = capabilities.has_str("IDLE");
        if !self.supports_idle {
            warn!(
                "{} does not advertise IDLE, falling back to polling",
                self.config.host
            );
        }

        self.session = Some(session);
        info!("LOGIN authentication successful");
        Ok(())
    }

    async fn select_folder(&mut self, folder: &str) -> ImapResult<MailboxStatus> {
        let session = self.session_mut()?;

        let mailbox = session.select(folder).await.map_err(|e| match e {
            async_imap::error::Error::No(msg) | async_imap::error::Error::Bad(msg) => {
                ImapError::FolderNotFound(format!("{}: {}", folder, msg))
            }
            other => ImapError::from(other),
        })?;

        let status = MailboxStatus {
            name: folder.to_string(),
            exists: mailbox.exists,
            uid_next: mailbox.uid_next,
            uid_validity: mailbox.uid_validity,
        };

        debug!("Selected folder {} with {} messages", folder, status.exists);
        self.last_status = Some(status.clone());
        Ok(status)
    }

    async fn fetch_range<'a>(
        &'a mut self,
        folder: &str,
        from_uid: u32,
        to_uid: Option<u32>,
    ) -> ImapResult<BoxStream<'a, ImapResult<FetchedMessage>>> {
        let status = self.select_folder(folder).await?;
        self.synced = Some(status);
        let session = self.session_mut()?;

        let range = match to_uid {
            Some(to) => format!("{}:{}", from_uid, to),
            None => format!("{}:*", from_uid),
        };

        // "N:*" matches the highest UID even when it is below N, so filter
        let found = session
            .uid_search(format!("UID {}", range))
            .await
            .map_err(|e| ImapError::FetchFailed {
                uid: None,
                reason: e.to_string(),
            })?;
        let mut uids: Vec<u32> = found
            .into_iter()
            .filter(|uid| *uid >= from_uid && to_uid.map_or(true, |to| *uid <= to))
            .collect();
        uids.sort_unstable();

        debug!("UID range {} in {} holds {} new messages", range, folder, uids.len());

        let messages = stream::unfold(
            (session, uids.into_iter(), false),
            |(session, mut pending, failed)| async move {
                if failed {
                    return None;
                }
                let uid = pending.next()?;
                match fetch_one(session, uid).await {
                    Ok(message) => Some((Ok(message), (session, pending, false))),
                    Err(e) => Some((Err(e), (session, pending, true))),
                }
            },
        );

        Ok(messages.boxed())
    }

    async fn wait_for_change(
        &mut self,
        folder: &str,
        cancel: &mut CancelToken,
    ) -> ImapResult<IdleEvent> {
        if cancel.is_cancelled() {
            return Ok(IdleEvent::Cancelled);
        }

        let current = self.select_folder(folder).await?;

        // Mail delivered after the last fetch raises no IDLE notification
        if let Some(synced) = self.synced.take() {
            if synced.name == folder && mailbox_changed(&synced, &current) {
                debug!("{} changed since the last fetch, skipping IDLE", folder);
                return Ok(IdleEvent::Changed);
            }
        }

        if !self.supports_idle {
            return self.poll_for_change(folder, cancel).await;
        }

        let session = self.session.take().ok_or(ImapError::NotConnected)?;
        let mut handle = session.idle();
        handle.init().await?;
        debug!("Entered IDLE on {}", folder);

        let response = {
            let (idle_wait, interrupt) = handle.wait_with_timeout(self.config.idle_timeout);
            tokio::pin!(idle_wait);

            tokio::select! {
                result = &mut idle_wait => {
                    drop(interrupt);
                    result?
                }
                _ = cancel.cancelled() => {
                    // Dropping the stop source makes the wait resolve as interrupted
                    drop(interrupt);
                    idle_wait.await?
                }
            }
        };

        let session = handle.done().await?;
        self.session = Some(session);

        let event = match response {
            IdleResponse::NewData(_) => IdleEvent::Changed,
            IdleResponse::Timeout => IdleEvent::Timeout,
            IdleResponse::ManualInterrupt => IdleEvent::Cancelled,
        };
        debug!("Left IDLE on {}: {:?}", folder, event);
        Ok(event)
    }

    async fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            match async_std::future::timeout(LOGOUT_TIMEOUT, session.logout()).await {
                Ok(Ok(())) => debug!("Logged out of {}", self.config.host),
                Ok(Err(e)) => debug!("LOGOUT failed for {}: {}", self.config.host, e),
                Err(_) => debug!("LOGOUT timed out for {}", self.config.host),
            }
        }
        self.last_status = None;
        self.synced = None;
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }
}

/// Whether the folder gained, lost or renumbered messages between two SELECTs
fn mailbox_changed(before: &MailboxStatus, after: &MailboxStatus) -> bool {
    before.exists != after.exists
        || before.uid_next != after.uid_next
        || before.uid_validity != after.uid_validity
}

/// Fetch a single message by UID, draining the response stream
async fn fetch_one(
    session: &mut Session<ImapStream>,
    uid: u32,
) -> ImapResult<FetchedMessage> {
    let fetch_failed = |e: async_imap::error::Error| ImapError::FetchFailed {
        uid: Some(uid),
        reason: e.to_string(),
    };

    let mut responses = session
        .uid_fetch(uid.to_string(), FETCH_QUERY)
        .await
        .map_err(fetch_failed)?;

    let mut message = None;
    while let Some(fetch) = responses.try_next().await.map_err(fetch_failed)? {
        if fetch.uid != Some(uid) {
            continue;
        }
        if let Some(body) = fetch.body() {
            message = Some(FetchedMessage::parse(uid, body));
        }
    }

    message.ok_or(ImapError::FetchFailed {
        uid: Some(uid),
        reason: "server returned no body".to_string(),
    })
}
