//! Incremental sync: watermark delta, store, advance, hand off

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use onebox_imap::{CancelToken, IdleEvent};
use tracing::{debug, error, info};

use crate::{ConnectionManager, CoreError, CoreResult, Database, StoredMessage};

/// Receives every message right after it is durably stored
#[async_trait]
pub trait IngestSink: Send + Sync {
    async fn on_message_ingested(&self, message: StoredMessage);
}

/// Outcome of one delta run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeltaReport {
    /// First UID requested
    pub from_uid: u32,
    /// Watermark after the run
    pub last_uid: u32,
    pub stored: usize,
}

/// Follows one folder of one account
pub struct SyncEngine {
    account_id: i64,
    database: Arc<Database>,
    connection: ConnectionManager,
    sink: Arc<dyn IngestSink>,
    cancel: CancelToken,
}

impl SyncEngine {
    pub fn new(
        account_id: i64,
        database: Arc<Database>,
        connection: ConnectionManager,
        sink: Arc<dyn IngestSink>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            account_id,
            database,
            connection,
            sink,
            cancel,
        }
    }

    /// Fetch and store everything above the watermark
    ///
    /// Each message is stored, then the watermark is advanced to its UID, then
    /// it is handed to the sink. A failure part way leaves the watermark at
    /// the last message that made it to the database. An account deleted in
    /// the meantime fails with [`CoreError::AccountNotFound`].
    pub async fn run_delta(&mut self, folder: &str) -> CoreResult<DeltaReport> {
        self.database.get_account(self.account_id).await?;
        let watermark = self.database.get_watermark(self.account_id, folder).await?;
        let mut report = DeltaReport {
            from_uid: watermark.saturating_add(1),
            last_uid: watermark,
            stored: 0,
        };

        let session = self.connection.session().await?;
        let mut messages = session.fetch_range(folder, report.from_uid, None).await?;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(CoreError::Cancelled),
                next = messages.next() => next,
            };
            let Some(fetched) = next else {
                break;
            };
            let fetched = fetched?;

            let stored = self
                .database
                .upsert_message(self.account_id, folder, &fetched)
                .await?;
            self.database
                .advance_watermark(self.account_id, folder, fetched.uid)
                .await?;

            report.last_uid = report.last_uid.max(fetched.uid);
            report.stored += 1;

            self.sink.on_message_ingested(stored).await;
        }
        drop(messages);

        self.database.touch_last_sync(self.account_id).await?;
        if report.stored > 0 {
            info!(
                "Account {} synced {} new messages in {} (watermark {})",
                self.account_id, report.stored, folder, report.last_uid
            );
        } else {
            debug!("Account {} has nothing new in {}", self.account_id, folder);
        }

        Ok(report)
    }

    /// Delta, listen, repeat until cancelled or a terminal error
    pub async fn run_loop(&mut self, folder: &str) -> CoreResult<()> {
        info!("Starting sync loop for account {} on {}", self.account_id, folder);

        let result = self.follow(folder).await;
        self.connection.stop().await;

        match result {
            Ok(()) | Err(CoreError::Cancelled) => {
                info!("Sync loop for account {} stopped", self.account_id);
                Ok(())
            }
            Err(e) => {
                error!("Sync loop for account {} failed: {}", self.account_id, e);
                Err(e)
            }
        }
    }

    async fn follow(&mut self, folder: &str) -> CoreResult<()> {
        loop {
            if let Err(e) = self.run_delta(folder).await {
                self.connection.recover(e).await?;
                continue;
            }
            self.connection.mark_healthy();

            match self.connection.run(folder).await? {
                IdleEvent::Cancelled => return Ok(()),
                IdleEvent::Changed => debug!("Account {} reported a change in {}", self.account_id, folder),
                IdleEvent::Timeout => debug!("Account {} IDLE keepalive elapsed", self.account_id),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fast_policy, setup_account, RecordingSink, ScriptedSession};
    use crate::{AccountStatus, MessageFilter};
    use onebox_imap::{cancellation, CancelHandle, ImapError};
    use std::time::Duration;

    fn engine(
        db: &Arc<Database>,
        account_id: i64,
        session: &ScriptedSession,
        sink: &Arc<RecordingSink>,
    ) -> (SyncEngine, CancelHandle) {
        let (handle, token) = cancellation();
        let connection = ConnectionManager::new(
            account_id,
            Box::new(session.clone()),
            db.clone(),
            fast_policy(),
            token.clone(),
        );
        let engine = SyncEngine::new(account_id, db.clone(), connection, sink.clone(), token);
        (engine, handle)
    }

    async fn row_count(db: &Database, account_id: i64) -> i64 {
        db.count_messages(&MessageFilter::for_account(account_id))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_delta_picks_up_above_watermark() {
        let (db, account_id) = setup_account().await;
        db.advance_watermark(account_id, "INBOX", 10).await.unwrap();

        let session = ScriptedSession::new();
        session.deliver([9, 10, 11, 12]);
        let sink = Arc::new(RecordingSink::default());
        let (mut engine, _handle) = engine(&db, account_id, &session, &sink);

        let report = engine.run_delta("INBOX").await.unwrap();

        assert_eq!(
            report,
            DeltaReport {
                from_uid: 11,
                last_uid: 12,
                stored: 2
            }
        );
        assert_eq!(db.get_watermark(account_id, "INBOX").await.unwrap(), 12);
        assert_eq!(row_count(&db, account_id).await, 2);
        assert_eq!(sink.uids(), vec![11, 12]);
        assert_eq!(session.read(|s| s.fetch_calls.clone()), vec![(11, None)]);
    }

    #[tokio::test]
    async fn test_mid_range_failure_resumes_at_failed_uid() {
        let (db, account_id) = setup_account().await;
        db.advance_watermark(account_id, "INBOX", 10).await.unwrap();

        let session = ScriptedSession::new();
        session.deliver([11, 12, 13]);
        session.script(|s| s.fail_fetch_once = Some(13));
        let sink = Arc::new(RecordingSink::default());
        let (mut engine, _handle) = engine(&db, account_id, &session, &sink);

        let first = engine.run_delta("INBOX").await;
        assert!(matches!(first, Err(CoreError::Fetch { uid: Some(13), .. })));
        assert_eq!(db.get_watermark(account_id, "INBOX").await.unwrap(), 12);
        assert_eq!(row_count(&db, account_id).await, 2);

        let second = engine.run_delta("INBOX").await.unwrap();
        assert_eq!(second.stored, 1);
        assert_eq!(db.get_watermark(account_id, "INBOX").await.unwrap(), 13);
        assert_eq!(sink.uids(), vec![11, 12, 13]);
        assert_eq!(
            session.read(|s| s.fetch_calls.clone()),
            vec![(11, None), (13, None)]
        );
    }

    #[tokio::test]
    async fn test_replayed_range_creates_no_duplicates() {
        let (db, account_id) = setup_account().await;
        let session = ScriptedSession::new();
        session.deliver([1, 2, 3]);
        let sink = Arc::new(RecordingSink::default());
        let (mut engine, _handle) = engine(&db, account_id, &session, &sink);

        engine.run_delta("INBOX").await.unwrap();
        sqlx::query("DELETE FROM sync_state")
            .execute(&db.pool)
            .await
            .unwrap();
        let replay = engine.run_delta("INBOX").await.unwrap();

        assert_eq!(replay.stored, 3);
        assert_eq!(row_count(&db, account_id).await, 3);
        assert_eq!(db.get_watermark(account_id, "INBOX").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_empty_delta_keeps_watermark() {
        let (db, account_id) = setup_account().await;
        db.advance_watermark(account_id, "INBOX", 4).await.unwrap();
        let session = ScriptedSession::new();
        session.deliver([1, 2, 3, 4]);
        let sink = Arc::new(RecordingSink::default());
        let (mut engine, _handle) = engine(&db, account_id, &session, &sink);

        let report = engine.run_delta("INBOX").await.unwrap();

        assert_eq!(report.stored, 0);
        assert_eq!(report.last_uid, 4);
        assert!(sink.uids().is_empty());
        assert!(db.get_account(account_id).await.unwrap().last_sync_at.is_some());
    }

    #[tokio::test]
    async fn test_loop_resyncs_on_change_and_stops_on_cancel() {
        let (db, account_id) = setup_account().await;
        let session = ScriptedSession::new();
        session.deliver([1, 2]);
        session.script(|s| s.idle_events.push_back(Ok(IdleEvent::Changed)));
        let sink = Arc::new(RecordingSink::default());
        let (mut engine, handle) = engine(&db, account_id, &session, &sink);

        let task = tokio::spawn(async move { engine.run_loop("INBOX").await });

        tokio::time::timeout(Duration::from_secs(2), async {
            while session.read(|s| s.fetch_calls.len()) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        handle.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(
            session.read(|s| s.fetch_calls.clone()),
            vec![(1, None), (3, None)]
        );
        assert_eq!(sink.uids(), vec![1, 2]);
        assert_eq!(session.read(|s| s.connects), 1);
        let account = db.get_account(account_id).await.unwrap();
        assert_eq!(account.status, AccountStatus::Inactive);
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_run_loop_can_be_spawned() {
        let (db, account_id) = setup_account().await;
        let session = ScriptedSession::new();
        let sink = Arc::new(RecordingSink::default());
        let (mut engine, handle) = engine(&db, account_id, &session, &sink);

        let fut = async move { engine.run_loop("INBOX").await };
        assert_send(&fut);

        handle.cancel();
        assert!(tokio::spawn(fut).await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_deleted_account_ends_loop() {
        let (db, account_id) = setup_account().await;
        let session = ScriptedSession::new();
        session.deliver([1, 2]);
        let sink = Arc::new(RecordingSink::default());
        let (mut engine, _handle) = engine(&db, account_id, &session, &sink);
        db.delete_account(account_id).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), engine.run_loop("INBOX"))
            .await
            .unwrap();

        assert!(matches!(result, Err(CoreError::AccountNotFound(id)) if id == account_id));
        assert!(session.read(|s| s.fetch_calls.is_empty()));
        assert!(sink.uids().is_empty());
    }

    #[tokio::test]
    async fn test_loop_ends_when_reconnects_run_out() {
        let (db, account_id) = setup_account().await;
        let session = ScriptedSession::new();
        session.script(|s| {
            for _ in 0..10 {
                s.connect_results
                    .push_back(Err(ImapError::ConnectionFailed("refused".into())));
            }
        });
        let sink = Arc::new(RecordingSink::default());
        let (mut engine, _handle) = engine(&db, account_id, &session, &sink);

        let result = tokio::time::timeout(Duration::from_secs(2), engine.run_loop("INBOX"))
            .await
            .unwrap();

        assert!(matches!(
            result,
            Err(CoreError::ReconnectExhausted { attempts: 5 })
        ));
        assert_eq!(session.read(|s| s.connects), 6);
        let account = db.get_account(account_id).await.unwrap();
        assert_eq!(account.status, AccountStatus::Error);
    }

    #[tokio::test]
    async fn test_failing_delta_exhausts_budget_despite_reconnects() {
        let (db, account_id) = setup_account().await;
        let session = ScriptedSession::new();
        session.deliver([1]);
        session.script(|s| s.fail_fetch_always = true);
        let sink = Arc::new(RecordingSink::default());
        let (mut engine, _handle) = engine(&db, account_id, &session, &sink);

        let result = tokio::time::timeout(Duration::from_secs(2), engine.run_loop("INBOX"))
            .await
            .unwrap();

        assert!(matches!(
            result,
            Err(CoreError::ReconnectExhausted { attempts: 5 })
        ));
        assert_eq!(session.read(|s| s.connects), 6);
        assert_eq!(
            db.get_account(account_id).await.unwrap().status,
            AccountStatus::Error
        );
    }

    #[tokio::test]
    async fn test_loop_ends_on_rejected_credentials() {
        let (db, account_id) = setup_account().await;
        let session = ScriptedSession::new();
        session.script(|s| {
            s.connect_results
                .push_back(Err(ImapError::AuthenticationFailed("NO".into())))
        });
        let sink = Arc::new(RecordingSink::default());
        let (mut engine, _handle) = engine(&db, account_id, &session, &sink);

        let result = engine.run_loop("INBOX").await;

        assert!(matches!(result, Err(CoreError::Auth(_))));
        let account = db.get_account(account_id).await.unwrap();
        assert_eq!(account.status, AccountStatus::Error);
    }
}
