//! Wiring between configuration, storage, collaborators and fetchers

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use onebox_auth::Vault;
use onebox_core::{
    Database, EmailLabel, FanOutPipeline, FetcherSupervisor, ImapSessionFactory, MessageFilter,
    NewAccount, Page, VectorHit,
};
use onebox_integrations::{
    ElasticsearchIndex, GeminiClient, QdrantStore, SearchRequest, SearchResults, WebhookNotifier,
    EMBEDDING_DIMENSIONS,
};
use tracing::{info, warn};

use crate::config::AppConfig;

/// Largest page the store hands out when walking an account's messages
const SCAN_PAGE_SIZE: u32 = 500;

/// How long shutdown waits for in-flight fan-out work
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct App {
    pub config: AppConfig,
    pub database: Arc<Database>,
    pub vault: Arc<Vault>,
}

impl App {
    pub async fn open(config: AppConfig) -> Result<Self> {
        let database = Database::open(&config.database_path)
            .await
            .with_context(|| format!("opening {}", config.database_path.display()))?;
        let vault = Vault::new(&config.encryption_key).context("loading encryption key")?;

        Ok(Self {
            config,
            database: Arc::new(database),
            vault: Arc::new(vault),
        })
    }

    fn search_index(&self) -> Result<ElasticsearchIndex> {
        Ok(ElasticsearchIndex::new(
            &self.config.elasticsearch_url,
            &self.config.elasticsearch_index,
        )?)
    }

    /// Assemble the fan-out pipeline from whichever collaborators are configured
    pub async fn pipeline(&self) -> Result<FanOutPipeline> {
        let index = self.search_index()?;
        if let Err(e) = index.ensure_index().await {
            warn!("Elasticsearch is not ready, indexing will fail until it is: {}", e);
        }
        let mut pipeline = FanOutPipeline::new(self.database.clone()).with_index(Arc::new(index));

        match &self.config.gemini_api_key {
            Some(key) => {
                let gemini = Arc::new(GeminiClient::new(key, &self.config.gemini_model)?);
                let vectors = QdrantStore::new(&self.config.qdrant_url, &self.config.qdrant_collection)?;
                if let Err(e) = vectors.ensure_collection(EMBEDDING_DIMENSIONS).await {
                    warn!("Qdrant is not ready, embeddings will fail until it is: {}", e);
                }
                pipeline = pipeline
                    .with_classifier(gemini.clone())
                    .with_embeddings(gemini, Arc::new(vectors));
            }
            None => warn!("GEMINI_API_KEY is not set, classification and embeddings are disabled"),
        }

        let notifier = WebhookNotifier::new(
            self.config.slack_webhook_url.as_deref(),
            self.config.webhook_url.as_deref(),
        )?;
        if notifier.is_configured() {
            pipeline = pipeline
                .with_notifier(Arc::new(notifier))
                .notify_on(EmailLabel::Interested);
        }

        Ok(pipeline)
    }

    /// Follow every account not in error until Ctrl-C
    pub async fn run(&self) -> Result<()> {
        self.follow(None).await
    }

    /// Follow one account until Ctrl-C, whatever its status
    ///
    /// This is how an account in error is brought back after the cause
    /// (e.g. a changed password) has been dealt with.
    pub async fn sync_account(&self, account_id: i64) -> Result<()> {
        self.follow(Some(account_id)).await
    }

    async fn follow(&self, only: Option<i64>) -> Result<()> {
        let pipeline = Arc::new(self.pipeline().await?);
        let factory = Arc::new(ImapSessionFactory::new(
            self.vault.clone(),
            self.config.idle_timeout,
        ));
        let supervisor = FetcherSupervisor::new(
            self.database.clone(),
            factory,
            pipeline.clone(),
            self.config.sync.clone(),
        );

        let started = match only {
            Some(account_id) => {
                supervisor.start_account(account_id).await?;
                1
            }
            None => supervisor.start_active_accounts().await?,
        };
        info!("Following {} account(s) in {}", started, self.config.sync.folder);

        tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
        info!("Shutting down");
        supervisor.shutdown().await;

        if tokio::time::timeout(DRAIN_TIMEOUT, pipeline.drain()).await.is_err() {
            warn!(
                "Fan-out work still pending after {:?}, some messages may be missing from the index",
                DRAIN_TIMEOUT
            );
        }
        Ok(())
    }

    pub async fn add_account(&self, account: NewAccount, password: &str) -> Result<i64> {
        let account = NewAccount {
            encrypted_password: self.vault.encrypt(password)?,
            ..account
        };
        let created = self.database.create_account(&account).await?;
        info!("Added account {} ({})", created.id, created.username);
        Ok(created.id)
    }

    /// Replace an account's password; an errored account becomes resumable
    pub async fn set_password(&self, account_id: i64, password: &str) -> Result<()> {
        let encrypted = self.vault.encrypt(password)?;
        self.database.update_password(account_id, &encrypted).await?;
        Ok(())
    }

    /// Delete an account with its messages and drop them from the search index
    pub async fn remove_account(&self, account_id: i64) -> Result<()> {
        self.database.get_account(account_id).await?;

        let mut message_ids = Vec::new();
        let filter = MessageFilter::for_account(account_id);
        for page in 1.. {
            let batch = self
                .database
                .list_messages(&filter, Page::new(page, SCAN_PAGE_SIZE))
                .await?;
            let done = batch.len() < SCAN_PAGE_SIZE as usize;
            message_ids.extend(batch.into_iter().map(|m| m.id));
            if done {
                break;
            }
        }

        self.database.delete_account(account_id).await?;
        info!("Removed account {} and {} message(s)", account_id, message_ids.len());

        let index = self.search_index()?;
        for id in message_ids {
            if let Err(e) = index.delete(id).await {
                warn!("Failed to remove message {} from the index: {}", id, e);
            }
        }
        Ok(())
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResults> {
        Ok(self.search_index()?.search(request).await?)
    }

    pub async fn similar(&self, message_id: i64, limit: usize) -> Result<Vec<VectorHit>> {
        let message = self.database.get_message(message_id).await?;
        let pipeline = self.pipeline().await?;
        pipeline.find_similar(&message, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    async fn app() -> App {
        let vars = HashMap::from([("ENCRYPTION_KEY", "0123456789abcdef0123456789abcdef")]);
        let config = AppConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string())).unwrap();
        App {
            vault: Arc::new(Vault::new(&config.encryption_key).unwrap()),
            database: Arc::new(Database::open_memory().await.unwrap()),
            config,
        }
    }

    fn new_account() -> NewAccount {
        NewAccount {
            name: "Sales".to_string(),
            host: "imap.example.com".to_string(),
            port: 993,
            username: "sales@example.com".to_string(),
            encrypted_password: String::new(),
            use_tls: true,
        }
    }

    #[tokio::test]
    async fn test_add_account_encrypts_password() {
        let app = app().await;

        let id = app.add_account(new_account(), "hunter2").await.unwrap();
        let stored = app.database.get_account(id).await.unwrap();

        assert_ne!(stored.encrypted_password, "hunter2");
        assert_eq!(app.vault.decrypt(&stored.encrypted_password).unwrap(), "hunter2");
    }

    #[tokio::test]
    async fn test_remove_account() {
        let app = app().await;
        let id = app.add_account(new_account(), "pw").await.unwrap();

        app.remove_account(id).await.unwrap();

        assert!(app.database.list_accounts().await.unwrap().is_empty());
        assert!(app.remove_account(id).await.is_err());
    }

    #[tokio::test]
    async fn test_set_password_reencrypts() {
        let app = app().await;
        let id = app.add_account(new_account(), "old").await.unwrap();

        app.set_password(id, "new").await.unwrap();

        let stored = app.database.get_account(id).await.unwrap();
        assert_eq!(app.vault.decrypt(&stored.encrypted_password).unwrap(), "new");
        assert!(app.set_password(id + 1, "x").await.is_err());
    }
}
