//! One fetcher per account, started and stopped on request

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use onebox_auth::Vault;
use onebox_imap::{cancellation, CancelHandle, ImapConfig, ImapSession, MailSession};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    Account, AccountStatus, ConnectionManager, ConnectionState, CoreError, CoreResult, Database,
    IngestSink, SyncEngine, SyncSettings,
};

/// Builds a disconnected session for an account
pub trait SessionFactory: Send + Sync {
    fn create(&self, account: &Account) -> CoreResult<Box<dyn MailSession>>;
}

/// Decrypts the stored password and builds a real IMAP session
pub struct ImapSessionFactory {
    vault: Arc<Vault>,
    idle_timeout: Duration,
}

impl ImapSessionFactory {
    pub fn new(vault: Arc<Vault>, idle_timeout: Duration) -> Self {
        Self {
            vault,
            idle_timeout,
        }
    }
}

impl SessionFactory for ImapSessionFactory {
    fn create(&self, account: &Account) -> CoreResult<Box<dyn MailSession>> {
        let password = self.vault.decrypt(&account.encrypted_password)?;
        let mut config = ImapConfig::new(
            &account.host,
            account.port,
            &account.username,
            password,
            account.use_tls,
        );
        config.idle_timeout = self.idle_timeout;
        Ok(Box::new(ImapSession::new(config)))
    }
}

struct FetcherHandle {
    cancel: CancelHandle,
    task: JoinHandle<CoreResult<()>>,
    state: watch::Receiver<ConnectionState>,
}

/// Owns the table of running fetchers
pub struct FetcherSupervisor {
    database: Arc<Database>,
    factory: Arc<dyn SessionFactory>,
    sink: Arc<dyn IngestSink>,
    settings: SyncSettings,
    fetchers: Mutex<HashMap<i64, FetcherHandle>>,
}

impl FetcherSupervisor {
    pub fn new(
        database: Arc<Database>,
        factory: Arc<dyn SessionFactory>,
        sink: Arc<dyn IngestSink>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            database,
            factory,
            sink,
            settings,
            fetchers: Mutex::new(HashMap::new()),
        }
    }

    /// Launch the sync loop for an account
    ///
    /// Fails with [`CoreError::AlreadyRunning`] while a loop for the account is
    /// alive. A loop that already ended on its own is replaced, which is how an
    /// errored account is restarted.
    pub async fn start_account(&self, account_id: i64) -> CoreResult<()> {
        let mut fetchers = self.fetchers.lock().await;

        if let Some(existing) = fetchers.get(&account_id) {
            if !existing.task.is_finished() {
                return Err(CoreError::AlreadyRunning(account_id));
            }
            debug!("Replacing finished fetcher for account {}", account_id);
            fetchers.remove(&account_id);
        }

        let account = self.database.get_account(account_id).await?;
        let session = self.factory.create(&account)?;

        let (cancel, token) = cancellation();
        let connection = ConnectionManager::new(
            account_id,
            session,
            self.database.clone(),
            self.settings.backoff,
            token.clone(),
        );
        let state = connection.subscribe();
        let mut engine = SyncEngine::new(
            account_id,
            self.database.clone(),
            connection,
            self.sink.clone(),
            token,
        );

        let folder = self.settings.folder.clone();
        let task = tokio::spawn(
            async move { engine.run_loop(&folder).await }
                .instrument(info_span!("fetcher", account_id)),
        );

        fetchers.insert(
            account_id,
            FetcherHandle {
                cancel,
                task,
                state,
            },
        );
        info!("Started fetcher for account {} ({})", account_id, account.username);
        Ok(())
    }

    /// Cancel an account's loop and wait for it to finish
    ///
    /// Returns whether a fetcher was tracked; stopping twice is a no-op.
    pub async fn stop_account(&self, account_id: i64) -> CoreResult<bool> {
        let mut fetchers = self.fetchers.lock().await;
        let Some(handle) = fetchers.remove(&account_id) else {
            debug!("No fetcher to stop for account {}", account_id);
            return Ok(false);
        };

        self.shut_down(account_id, handle).await;
        Ok(true)
    }

    async fn shut_down(&self, account_id: i64, handle: FetcherHandle) {
        handle.cancel.cancel();
        let mut task = handle.task;

        match tokio::time::timeout(self.settings.stop_timeout, &mut task).await {
            Ok(Ok(Ok(()))) => info!("Stopped fetcher for account {}", account_id),
            Ok(Ok(Err(e))) => debug!("Fetcher for account {} had ended with: {}", account_id, e),
            Ok(Err(e)) => error!("Fetcher for account {} panicked: {}", account_id, e),
            Err(_) => {
                warn!(
                    "Fetcher for account {} did not stop within {:?}, aborting",
                    account_id, self.settings.stop_timeout
                );
                task.abort();
                if let Err(e) = self
                    .database
                    .update_account_status(account_id, AccountStatus::Inactive)
                    .await
                {
                    warn!("Failed to mark account {} inactive: {}", account_id, e);
                }
            }
        }
    }

    /// Start every account that is not in the error state
    ///
    /// Returns how many fetchers were started. Failures are logged per account.
    pub async fn start_active_accounts(&self) -> CoreResult<usize> {
        let mut started = 0;
        for account in self.database.list_accounts().await? {
            if account.status == AccountStatus::Error {
                info!(
                    "Skipping account {}: needs attention before it can sync",
                    account.id
                );
                continue;
            }
            match self.start_account(account.id).await {
                Ok(()) => started += 1,
                Err(e) => warn!("Could not start account {}: {}", account.id, e),
            }
        }
        Ok(started)
    }

    /// Stop every fetcher
    pub async fn shutdown(&self) {
        let mut fetchers = self.fetchers.lock().await;
        let handles: Vec<(i64, FetcherHandle)> = fetchers.drain().collect();
        info!("Stopping {} fetchers", handles.len());

        for (_, handle) in &handles {
            handle.cancel.cancel();
        }
        for (account_id, handle) in handles {
            self.shut_down(account_id, handle).await;
        }
    }

    /// Whether a live loop exists for the account
    pub async fn is_running(&self, account_id: i64) -> bool {
        self.fetchers
            .lock()
            .await
            .get(&account_id)
            .is_some_and(|h| !h.task.is_finished())
    }

    pub async fn running_accounts(&self) -> Vec<i64> {
        let fetchers = self.fetchers.lock().await;
        let mut ids: Vec<i64> = fetchers
            .iter()
            .filter(|(_, h)| !h.task.is_finished())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Latest connection state of a tracked fetcher
    pub async fn connection_state(&self, account_id: i64) -> Option<ConnectionState> {
        self.fetchers
            .lock()
            .await
            .get(&account_id)
            .map(|h| *h.state.borrow())
    }
}
