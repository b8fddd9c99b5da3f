//! Core sync engine for Onebox
//!
//! Provides durable storage, the per-account connection state machine, the
//! incremental sync engine, the fan-out pipeline, and the fetcher supervisor.

mod connection;
mod database;
mod error;
mod filter;
mod labels;
mod messages;
mod pipeline;
mod settings;
mod supervisor;
mod sync;
mod watermark;

#[cfg(test)]
mod test_support;

pub use connection::{BackoffPolicy, ConnectionManager, ConnectionState};
pub use database::{Account, AccountStatus, Database, NewAccount};
pub use error::{CoreError, CoreResult};
pub use filter::{MessageFilter, Page};
pub use labels::{EmailLabel, LabelEntry, LabelSet};
pub use messages::StoredMessage;
pub use pipeline::{
    Branch, BranchFailure, Classification, Classifier, Embedder, FanOutPipeline, FanOutReport,
    Notifier, SearchIndex, VectorHit, VectorQuery, VectorStore,
};
pub use settings::SyncSettings;
pub use supervisor::{FetcherSupervisor, ImapSessionFactory, SessionFactory};
pub use sync::{DeltaReport, IngestSink, SyncEngine};
pub use watermark::SyncState;
