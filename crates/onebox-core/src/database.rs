//! Database storage using SQLite

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tracing::{debug, info};

use crate::{CoreError, CoreResult};

/// Connection state of an account as seen by operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Inactive,
    Active,
    Error,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Inactive => "inactive",
            AccountStatus::Active => "active",
            AccountStatus::Error => "error",
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inactive" => Ok(AccountStatus::Inactive),
            "active" => Ok(AccountStatus::Active),
            "error" => Ok(AccountStatus::Error),
            other => Err(CoreError::DatabaseError(format!(
                "unknown account status: {}",
                other
            ))),
        }
    }
}

/// A provisioned mailbox
#[derive(Debug, Clone, Serialize)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing)]
    pub encrypted_password: String,
    pub use_tls: bool,
    pub status: AccountStatus,
    /// Unix seconds
    pub last_sync_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Fields supplied when provisioning an account
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Already encrypted by the vault
    pub encrypted_password: String,
    pub use_tls: bool,
}

#[derive(sqlx::FromRow)]
struct AccountRow {
    id: i64,
    name: String,
    host: String,
    port: i64,
    username: String,
    encrypted_password: String,
    use_tls: bool,
    status: String,
    last_sync_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<AccountRow> for Account {
    type Error = CoreError;

    fn try_from(row: AccountRow) -> CoreResult<Self> {
        Ok(Account {
            id: row.id,
            name: row.name,
            host: row.host,
            port: u16::try_from(row.port)
                .map_err(|_| CoreError::DatabaseError(format!("invalid port {}", row.port)))?,
            username: row.username,
            encrypted_password: row.encrypted_password,
            use_tls: row.use_tls,
            status: row.status.parse()?,
            last_sync_at: row.last_sync_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const ACCOUNT_COLUMNS: &str = "id, name, host, port, username, encrypted_password, use_tls, \
     status, last_sync_at, created_at, updated_at";

/// Current time as unix seconds
pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Database connection pool
pub struct Database {
    pub(crate) pool: Pool<Sqlite>,
}

impl Database {
    /// Open or create a database at the given path
    pub async fn open(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| CoreError::DatabaseError(e.to_string()))?;
            }
        }

        info!("Opening database at {}", path.display());

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.initialize().await?;

        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub async fn open_memory() -> CoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        // A single connection that never recycles, or the data vanishes
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.initialize().await?;

        Ok(db)
    }

    /// Initialize the database schema
    async fn initialize(&self) -> CoreResult<()> {
        debug!("Initializing database schema");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                username TEXT NOT NULL,
                encrypted_password TEXT NOT NULL,
                use_tls INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'inactive',
                last_sync_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS emails (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                uid INTEGER NOT NULL,
                folder TEXT NOT NULL,
                message_id TEXT,
                thread_id TEXT,
                from_address TEXT NOT NULL DEFAULT '',
                to_address TEXT NOT NULL DEFAULT '',
                cc_address TEXT NOT NULL DEFAULT '',
                subject TEXT,
                body_text TEXT,
                body_html TEXT,
                snippet TEXT,
                date INTEGER,
                attachments TEXT NOT NULL DEFAULT '[]',
                raw_headers TEXT NOT NULL DEFAULT '[]',
                labels TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(account_id, folder, uid)
            );

            CREATE INDEX IF NOT EXISTS idx_emails_account_folder ON emails(account_id, folder);
            CREATE INDEX IF NOT EXISTS idx_emails_date ON emails(date DESC);
            CREATE INDEX IF NOT EXISTS idx_emails_message_id ON emails(message_id);
            CREATE INDEX IF NOT EXISTS idx_emails_thread_id ON emails(thread_id);

            CREATE TABLE IF NOT EXISTS sync_state (
                account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                folder TEXT NOT NULL,
                last_uid INTEGER NOT NULL DEFAULT 0,
                last_sync_at INTEGER,
                PRIMARY KEY(account_id, folder)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database schema initialized");
        Ok(())
    }

    /// Insert a new account, returning the stored record
    pub async fn create_account(&self, account: &NewAccount) -> CoreResult<Account> {
        let now = now();
        let row: AccountRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO accounts (name, host, port, username, encrypted_password, use_tls, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 'inactive', ?, ?)
            RETURNING {}
            "#,
            ACCOUNT_COLUMNS
        ))
        .bind(&account.name)
        .bind(&account.host)
        .bind(i64::from(account.port))
        .bind(&account.username)
        .bind(&account.encrypted_password)
        .bind(account.use_tls)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        info!("Created account {} ({})", row.id, row.username);
        row.try_into()
    }

    /// Get an account by id
    pub async fn get_account(&self, account_id: i64) -> CoreResult<Account> {
        let row: Option<AccountRow> = sqlx::query_as(&format!(
            "SELECT {} FROM accounts WHERE id = ?",
            ACCOUNT_COLUMNS
        ))
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or(CoreError::AccountNotFound(account_id))?.try_into()
    }

    /// Get all accounts, oldest first
    pub async fn list_accounts(&self) -> CoreResult<Vec<Account>> {
        let rows: Vec<AccountRow> = sqlx::query_as(&format!(
            "SELECT {} FROM accounts ORDER BY id",
            ACCOUNT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Account::try_from).collect()
    }

    /// Delete an account together with its messages and sync state
    pub async fn delete_account(&self, account_id: i64) -> CoreResult<()> {
        let result = sqlx::query("DELETE FROM accounts WHERE id = ?")
            .bind(account_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::AccountNotFound(account_id));
        }
        info!("Deleted account {}", account_id);
        Ok(())
    }

    /// Replace the stored credentials
    ///
    /// An account in error goes back to inactive so the next boot resumes it.
    pub async fn update_password(&self, account_id: i64, encrypted_password: &str) -> CoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET encrypted_password = ?,
                status = CASE WHEN status = 'error' THEN 'inactive' ELSE status END,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(encrypted_password)
        .bind(now())
        .bind(account_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::AccountNotFound(account_id));
        }
        info!("Updated credentials of account {}", account_id);
        Ok(())
    }

    /// Set the account status; written by the fetcher machinery
    pub(crate) async fn update_account_status(
        &self,
        account_id: i64,
        status: AccountStatus,
    ) -> CoreResult<()> {
        sqlx::query("UPDATE accounts SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now())
            .bind(account_id)
            .execute(&self.pool)
            .await?;

        debug!("Account {} status -> {}", account_id, status);
        Ok(())
    }

    /// Record that a delta run finished
    pub async fn touch_last_sync(&self, account_id: i64) -> CoreResult<()> {
        sqlx::query("UPDATE accounts SET last_sync_at = ?, updated_at = ? WHERE id = ?")
            .bind(now())
            .bind(now())
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
