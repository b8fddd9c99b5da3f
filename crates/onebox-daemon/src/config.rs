//! Environment configuration for the daemon

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use onebox_auth::MIN_KEY_LENGTH;
use onebox_core::{BackoffPolicy, SyncSettings};
use onebox_integrations::DEFAULT_MODEL;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("ENCRYPTION_KEY must be at least {MIN_KEY_LENGTH} bytes, got {0}")]
    WeakKey(usize),

    #[error("Invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub encryption_key: String,
    pub elasticsearch_url: String,
    pub elasticsearch_index: String,
    pub qdrant_url: String,
    pub qdrant_collection: String,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub slack_webhook_url: Option<String>,
    pub webhook_url: Option<String>,
    pub sync: SyncSettings,
    pub idle_timeout: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from any variable source; blank values count as unset
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let or = |name: &str, default: &str| get(name).unwrap_or_else(|| default.to_string());

        let encryption_key = get("ENCRYPTION_KEY").ok_or(ConfigError::Missing("ENCRYPTION_KEY"))?;
        if encryption_key.len() < MIN_KEY_LENGTH {
            return Err(ConfigError::WeakKey(encryption_key.len()));
        }

        let backoff = BackoffPolicy {
            base: Duration::from_millis(parse(&get, "BACKOFF_BASE_MS", 1000)?),
            cap: Duration::from_millis(parse(&get, "BACKOFF_CAP_MS", 30_000)?),
            max_attempts: parse(&get, "MAX_RECONNECT_ATTEMPTS", 5)?,
        };

        Ok(Self {
            database_path: PathBuf::from(or("DATABASE_PATH", "onebox.db")),
            encryption_key,
            elasticsearch_url: or("ELASTICSEARCH_URL", "http://localhost:9200"),
            elasticsearch_index: or("ELASTICSEARCH_INDEX", "emails"),
            qdrant_url: or("QDRANT_URL", "http://localhost:6333"),
            qdrant_collection: or("QDRANT_COLLECTION", "email_context"),
            gemini_api_key: get("GEMINI_API_KEY"),
            gemini_model: or("GEMINI_MODEL", DEFAULT_MODEL),
            slack_webhook_url: get("SLACK_WEBHOOK_URL"),
            webhook_url: get("WEBHOOK_URL"),
            sync: SyncSettings {
                folder: or("SYNC_FOLDER", "INBOX"),
                backoff,
                ..SyncSettings::default()
            },
            idle_timeout: Duration::from_secs(parse(&get, "IDLE_TIMEOUT_SECS", 28 * 60)?),
        })
    }
}

fn parse<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(name) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}
