//! Stored messages and their labels

use onebox_imap::{join_addresses, Attachment, FetchedMessage};
use serde::Serialize;
use sqlx::QueryBuilder;
use tracing::debug;

use crate::database::now;
use crate::{CoreError, CoreResult, Database, EmailLabel, LabelEntry, LabelSet, MessageFilter, Page};

/// A message row as persisted in `emails`
#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    pub id: i64,
    pub account_id: i64,
    pub folder: String,
    pub uid: u32,
    pub message_id: Option<String>,
    pub thread_id: Option<String>,
    pub from: String,
    pub to: String,
    pub cc: String,
    pub subject: Option<String>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub snippet: Option<String>,
    /// Unix seconds
    pub date: Option<i64>,
    pub attachments: Vec<Attachment>,
    pub raw_headers: Vec<(String, String)>,
    pub labels: LabelSet,
    pub created_at: i64,
    pub updated_at: i64,
}

impl StoredMessage {
    /// Plain-text body truncated to `max_chars`
    pub fn body_excerpt(&self, max_chars: usize) -> String {
        self.body_text
            .as_deref()
            .unwrap_or_default()
            .chars()
            .take(max_chars)
            .collect()
    }
}

#[derive(sqlx::FromRow)]
struct EmailRow {
    id: i64,
    account_id: i64,
    folder: String,
    uid: i64,
    message_id: Option<String>,
    thread_id: Option<String>,
    from_address: String,
    to_address: String,
    cc_address: String,
    subject: Option<String>,
    body_text: Option<String>,
    body_html: Option<String>,
    snippet: Option<String>,
    date: Option<i64>,
    attachments: String,
    raw_headers: String,
    labels: String,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<EmailRow> for StoredMessage {
    type Error = CoreError;

    fn try_from(row: EmailRow) -> CoreResult<Self> {
        Ok(StoredMessage {
            id: row.id,
            account_id: row.account_id,
            folder: row.folder,
            uid: u32::try_from(row.uid)
                .map_err(|_| CoreError::DatabaseError(format!("invalid uid {}", row.uid)))?,
            message_id: row.message_id,
            thread_id: row.thread_id,
            from: row.from_address,
            to: row.to_address,
            cc: row.cc_address,
            subject: row.subject,
            body_text: row.body_text,
            body_html: row.body_html,
            snippet: row.snippet,
            date: row.date,
            attachments: serde_json::from_str(&row.attachments)?,
            raw_headers: serde_json::from_str(&row.raw_headers)?,
            labels: serde_json::from_str(&row.labels)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const EMAIL_COLUMNS: &str = "id, account_id, folder, uid, message_id, thread_id, \
     from_address, to_address, cc_address, subject, body_text, body_html, snippet, date, \
     attachments, raw_headers, labels, created_at, updated_at";

impl Database {
    /// Insert or update a message keyed by (account, folder, uid)
    ///
    /// On conflict the envelope and body are overwritten while the row id,
    /// labels, and creation time are kept.
    pub async fn upsert_message(
        &self,
        account_id: i64,
        folder: &str,
        message: &FetchedMessage,
    ) -> CoreResult<StoredMessage> {
        let now = now();
        let attachments = serde_json::to_string(&message.attachments)?;
        let raw_headers = serde_json::to_string(&message.raw_headers)?;

        let row: EmailRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO emails (
                account_id, uid, folder, message_id, thread_id,
                from_address, to_address, cc_address, subject,
                body_text, body_html, snippet, date,
                attachments, raw_headers, labels, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, '[]', ?, ?)
            ON CONFLICT(account_id, folder, uid) DO UPDATE SET
                message_id = excluded.message_id,
                thread_id = excluded.thread_id,
                from_address = excluded.from_address,
                to_address = excluded.to_address,
                cc_address = excluded.cc_address,
                subject = excluded.subject,
                body_text = excluded.body_text,
                body_html = excluded.body_html,
                snippet = excluded.snippet,
                date = excluded.date,
                attachments = excluded.attachments,
                raw_headers = excluded.raw_headers,
                updated_at = excluded.updated_at
            RETURNING {}
            "#,
            EMAIL_COLUMNS
        ))
        .bind(account_id)
        .bind(i64::from(message.uid))
        .bind(folder)
        .bind(&message.message_id)
        .bind(message.thread_id())
        .bind(join_addresses(&message.from))
        .bind(join_addresses(&message.to))
        .bind(join_addresses(&message.cc))
        .bind(&message.subject)
        .bind(&message.body_text)
        .bind(&message.body_html)
        .bind(message.snippet())
        .bind(message.date)
        .bind(&attachments)
        .bind(&raw_headers)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| CoreError::for_account(e, account_id))?;

        debug!(
            "Stored UID {} in {} for account {} as message {}",
            message.uid, folder, account_id, row.id
        );
        row.try_into()
    }

    /// Get a stored message by row id
    pub async fn get_message(&self, message_id: i64) -> CoreResult<StoredMessage> {
        let row: Option<EmailRow> = sqlx::query_as(&format!(
            "SELECT {} FROM emails WHERE id = ?",
            EMAIL_COLUMNS
        ))
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or(CoreError::MessageNotFound(message_id))?.try_into()
    }

    /// List messages matching `filter`, newest first
    pub async fn list_messages(
        &self,
        filter: &MessageFilter,
        page: Page,
    ) -> CoreResult<Vec<StoredMessage>> {
        let mut query = QueryBuilder::new(format!("SELECT {} FROM emails", EMAIL_COLUMNS));
        filter.push_where(&mut query);
        query
            .push(" ORDER BY date DESC, uid DESC LIMIT ")
            .push_bind(i64::from(page.size))
            .push(" OFFSET ")
            .push_bind(page.offset() as i64);

        let rows: Vec<EmailRow> = query.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(StoredMessage::try_from).collect()
    }

    /// Count messages matching `filter`
    pub async fn count_messages(&self, filter: &MessageFilter) -> CoreResult<i64> {
        let mut query = QueryBuilder::new("SELECT COUNT(*) FROM emails");
        filter.push_where(&mut query);

        let (count,): (i64,) = query.build_query_as().fetch_one(&self.pool).await?;
        Ok(count)
    }

    /// Attach a label entry, replacing any entry for the same label
    pub async fn add_label(&self, message_id: i64, entry: LabelEntry) -> CoreResult<LabelSet> {
        let label = entry.label;
        let labels = self
            .modify_labels(message_id, move |labels| labels.insert(entry))
            .await?;
        debug!("Labelled message {} as {}", message_id, label);
        Ok(labels)
    }

    /// Remove a label from a message; absent labels are ignored
    pub async fn remove_label(&self, message_id: i64, label: EmailLabel) -> CoreResult<LabelSet> {
        self.modify_labels(message_id, move |labels| {
            labels.remove(label);
        })
        .await
    }

    async fn modify_labels(
        &self,
        message_id: i64,
        apply: impl FnOnce(&mut LabelSet),
    ) -> CoreResult<LabelSet> {
        let mut tx = self.pool.begin().await?;

        let current: Option<(String,)> = sqlx::query_as("SELECT labels FROM emails WHERE id = ?")
            .bind(message_id)
            .fetch_optional(&mut *tx)
            .await?;
        let (current,) = current.ok_or(CoreError::MessageNotFound(message_id))?;

        let mut labels: LabelSet = serde_json::from_str(&current)?;
        apply(&mut labels);

        sqlx::query("UPDATE emails SET labels = ?, updated_at = ? WHERE id = ?")
            .bind(serde_json::to_string(&labels)?)
            .bind(now())
            .bind(message_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(labels)
    }
}
