//! Session lifecycle and the reconnect state machine

use std::sync::Arc;
use std::time::Duration;

use onebox_imap::{CancelToken, IdleEvent, MailSession};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{AccountStatus, CoreError, CoreResult, Database};

/// Where a connection manager is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Blocked in wait-for-change
    Listening,
    /// Waiting before the next connect attempt
    Backoff { attempt: u32, delay: Duration },
    /// Terminal: credentials rejected or reconnects exhausted
    Error,
}

/// Exponential reconnect delays: `min(base * 2^attempt, cap)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

/// Owns one account's session and keeps it connected
pub struct ConnectionManager {
    account_id: i64,
    session: Box<dyn MailSession>,
    database: Arc<Database>,
    policy: BackoffPolicy,
    cancel: CancelToken,
    state: watch::Sender<ConnectionState>,
    attempt: u32,
}

impl ConnectionManager {
    pub fn new(
        account_id: i64,
        session: Box<dyn MailSession>,
        database: Arc<Database>,
        policy: BackoffPolicy,
        cancel: CancelToken,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            account_id,
            session,
            database,
            policy,
            cancel,
            state,
            attempt: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe state transitions from outside the loop
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        debug!("Account {} connection state: {:?}", self.account_id, state);
        self.state.send_replace(state);
    }

    async fn set_status(&mut self, status: AccountStatus) {
        if let Err(e) = self
            .database
            .update_account_status(self.account_id, status)
            .await
        {
            warn!(
                "Failed to record status {} for account {}: {}",
                status, self.account_id, e
            );
        }
    }

    /// Connect, retrying transient failures with backoff
    ///
    /// Rejected credentials and an exhausted retry budget are terminal and
    /// leave the account marked as errored.
    pub async fn connect(&mut self) -> CoreResult<()> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }

            self.set_state(ConnectionState::Connecting);
            let result = tokio::select! {
                result = self.session.connect() => result,
                _ = self.cancel.cancelled() => return Err(CoreError::Cancelled),
            };

            match result {
                Ok(()) => {
                    self.set_state(ConnectionState::Connected);
                    self.set_status(AccountStatus::Active).await;
                    return Ok(());
                }
                Err(e) if e.is_auth() => {
                    error!("Account {} rejected credentials: {}", self.account_id, e);
                    self.fail().await;
                    return Err(e.into());
                }
                Err(e) => {
                    warn!("Account {} failed to connect: {}", self.account_id, e);
                    self.backoff().await?;
                }
            }
        }
    }

    /// Refill the retry budget once the session has done useful work
    ///
    /// Connecting alone does not count: a server that accepts logins but
    /// fails every sync must still run out of attempts.
    pub fn mark_healthy(&mut self) {
        if self.attempt > 0 {
            info!(
                "Account {} recovered after {} reconnect attempts",
                self.account_id, self.attempt
            );
        }
        self.attempt = 0;
    }

    /// The connected session, connecting first if needed
    pub async fn session(&mut self) -> CoreResult<&mut dyn MailSession> {
        if !self.session.is_connected() {
            self.connect().await?;
        }
        Ok(self.session.as_mut())
    }

    /// Listen for changes on `folder`
    ///
    /// A transport failure while listening is recovered here and reported
    /// as [`IdleEvent::Changed`] so the caller re-syncs whatever it missed.
    pub async fn run(&mut self, folder: &str) -> CoreResult<IdleEvent> {
        if !self.session.is_connected() {
            self.connect().await?;
        }

        self.set_state(ConnectionState::Listening);
        let result = self.session.wait_for_change(folder, &mut self.cancel).await;

        match result {
            Ok(IdleEvent::Cancelled) => Ok(IdleEvent::Cancelled),
            Ok(event) => {
                self.set_state(ConnectionState::Connected);
                Ok(event)
            }
            Err(e) => {
                self.recover(e.into()).await?;
                Ok(IdleEvent::Changed)
            }
        }
    }

    /// Drop the session after `error` and wait out the backoff
    ///
    /// Errors that reconnecting cannot fix are terminal and returned as-is.
    pub async fn recover(&mut self, error: CoreError) -> CoreResult<()> {
        if matches!(error, CoreError::Cancelled) {
            return Err(error);
        }
        if !error.is_recoverable() {
            error!("Account {} stopped: {}", self.account_id, error);
            self.fail().await;
            return Err(error);
        }

        warn!("Account {} lost its session: {}", self.account_id, error);
        self.session.disconnect().await;
        self.set_state(ConnectionState::Disconnected);
        self.backoff().await
    }

    async fn backoff(&mut self) -> CoreResult<()> {
        if self.attempt >= self.policy.max_attempts {
            error!(
                "Max reconnect attempts reached for account {}",
                self.account_id
            );
            self.fail().await;
            return Err(CoreError::ReconnectExhausted {
                attempts: self.attempt,
            });
        }

        self.attempt += 1;
        let delay = self.policy.delay_for(self.attempt);
        info!(
            "Reconnecting account {} in {:?} (attempt {}/{})",
            self.account_id, delay, self.attempt, self.policy.max_attempts
        );
        self.set_state(ConnectionState::Backoff {
            attempt: self.attempt,
            delay,
        });

        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = self.cancel.cancelled() => Err(CoreError::Cancelled),
        }
    }

    async fn fail(&mut self) {
        self.session.disconnect().await;
        self.set_state(ConnectionState::Error);
        self.set_status(AccountStatus::Error).await;
    }

    /// Log out and settle in a terminal state
    ///
    /// An errored account keeps its error status; anything else goes inactive.
    pub async fn stop(&mut self) {
        self.session.disconnect().await;
        if self.state() == ConnectionState::Error {
            return;
        }
        self.set_state(ConnectionState::Disconnected);
        self.set_status(AccountStatus::Inactive).await;
        debug!("Account {} connection stopped", self.account_id);
    }
}
