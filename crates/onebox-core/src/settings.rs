//! Tunables for the fetcher loops

use std::time::Duration;

use crate::BackoffPolicy;

/// Settings shared by every fetcher a supervisor starts
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Folder each fetcher follows
    pub folder: String,
    pub backoff: BackoffPolicy,
    /// How long `stop_account` waits before aborting a loop
    pub stop_timeout: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            folder: "INBOX".to_string(),
            backoff: BackoffPolicy::default(),
            stop_timeout: Duration::from_secs(10),
        }
    }
}
