//! Per-folder sync watermarks

use serde::Serialize;

use crate::database::now;
use crate::{CoreError, CoreResult, Database};

/// Highest UID durably processed for one (account, folder)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct SyncState {
    pub account_id: i64,
    pub folder: String,
    pub last_uid: i64,
    pub last_sync_at: Option<i64>,
}

impl Database {
    /// Watermark for a folder, 0 if it was never synced
    pub async fn get_watermark(&self, account_id: i64, folder: &str) -> CoreResult<u32> {
        let state = self.get_sync_state(account_id, folder).await?;
        let last_uid = state.map_or(0, |s| s.last_uid);
        u32::try_from(last_uid)
            .map_err(|_| CoreError::DatabaseError(format!("invalid watermark {}", last_uid)))
    }

    pub async fn get_sync_state(
        &self,
        account_id: i64,
        folder: &str,
    ) -> CoreResult<Option<SyncState>> {
        let state = sqlx::query_as::<_, SyncState>(
            "SELECT account_id, folder, last_uid, last_sync_at FROM sync_state WHERE account_id = ? AND folder = ?",
        )
        .bind(account_id)
        .bind(folder)
        .fetch_optional(&self.pool)
        .await?;

        Ok(state)
    }

    /// Raise the watermark to `uid`; never lowers it
    pub async fn advance_watermark(&self, account_id: i64, folder: &str, uid: u32) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (account_id, folder, last_uid, last_sync_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(account_id, folder) DO UPDATE SET
                last_uid = MAX(sync_state.last_uid, excluded.last_uid),
                last_sync_at = excluded.last_sync_at
            "#,
        )
        .bind(account_id)
        .bind(folder)
        .bind(i64::from(uid))
        .bind(now())
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::for_account(e, account_id))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::tests::sample_account;

    #[tokio::test]
    async fn test_unsynced_folder_starts_at_zero() {
        let db = Database::open_memory().await.unwrap();
        let account = db.create_account(&sample_account()).await.unwrap();

        assert_eq!(db.get_watermark(account.id, "INBOX").await.unwrap(), 0);
        assert!(db.get_sync_state(account.id, "INBOX").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_watermark_is_monotonic() {
        let db = Database::open_memory().await.unwrap();
        let account = db.create_account(&sample_account()).await.unwrap();

        db.advance_watermark(account.id, "INBOX", 12).await.unwrap();
        db.advance_watermark(account.id, "INBOX", 7).await.unwrap();
        assert_eq!(db.get_watermark(account.id, "INBOX").await.unwrap(), 12);

        db.advance_watermark(account.id, "INBOX", 13).await.unwrap();
        assert_eq!(db.get_watermark(account.id, "INBOX").await.unwrap(), 13);
        assert_eq!(db.get_watermark(account.id, "Sent").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_deleted_account_cannot_advance() {
        let db = Database::open_memory().await.unwrap();
        let account = db.create_account(&sample_account()).await.unwrap();
        db.delete_account(account.id).await.unwrap();

        let result = db.advance_watermark(account.id, "INBOX", 4).await;
        assert!(matches!(result, Err(CoreError::AccountNotFound(_))));
    }
}
