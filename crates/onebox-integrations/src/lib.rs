//! HTTP collaborators for the Onebox fan-out pipeline

mod elasticsearch;
mod error;
mod gemini;
mod http;
mod notify;
mod qdrant;

pub use elasticsearch::{build_search_body, ElasticsearchIndex, SearchHit, SearchRequest, SearchResults};
pub use error::{IntegrationError, IntegrationResult};
pub use gemini::{
    classification_prompt, parse_classification, GeminiClient, DEFAULT_MODEL, EMBEDDING_DIMENSIONS,
    EMBEDDING_MODEL,
};
pub use notify::{slack_payload, webhook_payload, WebhookNotifier, INTERESTED_EVENT};
pub use qdrant::QdrantStore;
