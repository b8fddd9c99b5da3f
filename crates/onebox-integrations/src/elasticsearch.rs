//! Full-text search over stored messages via Elasticsearch

use std::collections::HashMap;

use async_trait::async_trait;
use onebox_core::{LabelSet, MessageFilter, Page, SearchIndex, StoredMessage};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};
use url::Url;

use crate::http::{base_url, check_status};
use crate::{IntegrationError, IntegrationResult};

const SERVICE: &str = "elasticsearch";

/// Fields searched by free text, subject weighted highest
const SEARCH_FIELDS: [&str; 4] = ["subject^3", "body_text^2", "from", "to"];

/// A search over indexed messages
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: Option<String>,
    pub filter: MessageFilter,
    pub page: Page,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: i64,
    pub score: Option<f64>,
    pub document: Value,
    /// Highlighted fragments per field
    pub highlights: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResults {
    pub total: u64,
    pub hits: Vec<SearchHit>,
}

#[derive(Deserialize)]
struct SearchResponse {
    hits: HitsEnvelope,
}

#[derive(Deserialize)]
struct HitsEnvelope {
    total: TotalHits,
    hits: Vec<RawHit>,
}

#[derive(Deserialize)]
struct TotalHits {
    value: u64,
}

#[derive(Deserialize)]
struct RawHit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_score")]
    score: Option<f64>,
    #[serde(rename = "_source", default)]
    source: Value,
    #[serde(default)]
    highlight: HashMap<String, Vec<String>>,
}

pub struct ElasticsearchIndex {
    client: reqwest::Client,
    base: Url,
    index: String,
}

impl ElasticsearchIndex {
    pub fn new(base_url_str: &str, index: impl Into<String>) -> IntegrationResult<Self> {
        Ok(Self {
            client: reqwest::Client::new(),
            base: base_url(base_url_str)?,
            index: index.into(),
        })
    }

    fn url(&self, path: &str) -> IntegrationResult<Url> {
        Ok(self.base.join(&format!("{}/{}", self.index, path))?)
    }

    /// Create the index with its mapping unless it already exists
    pub async fn ensure_index(&self) -> IntegrationResult<()> {
        let url = self.base.join(&self.index)?;
        let response = self.client.head(url.clone()).send().await?;

        if response.status().is_success() {
            debug!("Elasticsearch index {} exists", self.index);
            return Ok(());
        }
        if response.status() != reqwest::StatusCode::NOT_FOUND {
            check_status(SERVICE, response).await?;
        }

        let response = self.client.put(url).json(&index_mapping()).send().await?;
        check_status(SERVICE, response).await?;
        info!("Created Elasticsearch index {}", self.index);
        Ok(())
    }

    /// Upsert every field except labels, merging into an existing document
    pub async fn index_message(&self, message: &StoredMessage) -> IntegrationResult<()> {
        self.partial_upsert(message.id, document(message)).await?;
        debug!("Indexed message {}", message.id);
        Ok(())
    }

    /// Upsert only the labels field
    pub async fn set_labels(&self, message_id: i64, labels: &LabelSet) -> IntegrationResult<()> {
        let names: Vec<&str> = labels.labels().map(|l| l.as_str()).collect();
        self.partial_upsert(message_id, json!({ "labels": names }))
            .await?;
        debug!("Updated labels of message {} in the index", message_id);
        Ok(())
    }

    async fn partial_upsert(&self, message_id: i64, doc: Value) -> IntegrationResult<()> {
        let mut url = self.url(&format!("_update/{}", message_id))?;
        url.query_pairs_mut().append_pair("retry_on_conflict", "3");

        let response = self
            .client
            .post(url)
            .json(&json!({ "doc": doc, "doc_as_upsert": true }))
            .send()
            .await?;
        check_status(SERVICE, response).await?;
        Ok(())
    }

    pub async fn search(&self, request: &SearchRequest) -> IntegrationResult<SearchResults> {
        let response = self
            .client
            .post(self.url("_search")?)
            .json(&build_search_body(request))
            .send()
            .await?;
        let response = check_status(SERVICE, response).await?;

        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| IntegrationError::ParseError(e.to_string()))?;
        let results = into_results(body)?;

        debug!("Search matched {} messages", results.total);
        Ok(results)
    }

    /// Remove a message from the index; a missing document is not an error
    pub async fn delete(&self, message_id: i64) -> IntegrationResult<()> {
        let response = self
            .client
            .delete(self.url(&format!("_doc/{}", message_id))?)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(SERVICE, response).await?;
        Ok(())
    }
}

#[async_trait]
impl SearchIndex for ElasticsearchIndex {
    async fn index(&self, message: &StoredMessage) -> anyhow::Result<()> {
        Ok(self.index_message(message).await?)
    }

    async fn update_labels(&self, message_id: i64, labels: &LabelSet) -> anyhow::Result<()> {
        Ok(self.set_labels(message_id, labels).await?)
    }
}

fn index_mapping() -> Value {
    json!({
        "mappings": {
            "properties": {
                "id": { "type": "long" },
                "account_id": { "type": "long" },
                "uid": { "type": "long" },
                "folder": { "type": "keyword" },
                "message_id": { "type": "keyword" },
                "thread_id": { "type": "keyword" },
                "from": { "type": "text" },
                "to": { "type": "text" },
                "cc": { "type": "text" },
                "subject": { "type": "text" },
                "body_text": { "type": "text" },
                "snippet": { "type": "text" },
                "date": { "type": "date", "format": "epoch_second" },
                "labels": { "type": "keyword" },
                "attachments": { "type": "object", "enabled": false }
            }
        }
    })
}

/// Indexed form of a message; labels are written separately
fn document(message: &StoredMessage) -> Value {
    json!({
        "id": message.id,
        "account_id": message.account_id,
        "uid": message.uid,
        "folder": message.folder,
        "message_id": message.message_id,
        "thread_id": message.thread_id,
        "from": message.from,
        "to": message.to,
        "cc": message.cc,
        "subject": message.subject,
        "body_text": message.body_text,
        "snippet": message.snippet,
        "date": message.date,
        "attachments": message.attachments,
    })
}

/// Translate a request into an Elasticsearch `bool` query
pub fn build_search_body(request: &SearchRequest) -> Value {
    let filter = &request.filter;
    let mut must = Vec::new();
    let mut filters = Vec::new();

    if let Some(query) = request.query.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
        must.push(json!({
            "multi_match": { "query": query, "fields": SEARCH_FIELDS }
        }));
    }
    if let Some(from) = &filter.from {
        must.push(json!({ "match": { "from": from } }));
    }
    if let Some(to) = &filter.to {
        must.push(json!({ "match": { "to": to } }));
    }
    if must.is_empty() {
        must.push(json!({ "match_all": {} }));
    }

    if let Some(account_id) = filter.account_id {
        filters.push(json!({ "term": { "account_id": account_id } }));
    }
    if let Some(folder) = &filter.folder {
        filters.push(json!({ "term": { "folder": folder } }));
    }
    if let Some(label) = filter.label {
        filters.push(json!({ "term": { "labels": label.as_str() } }));
    }
    if filter.date_from.is_some() || filter.date_to.is_some() {
        let mut range = serde_json::Map::new();
        if let Some(date_from) = filter.date_from {
            range.insert("gte".to_string(), json!(date_from));
        }
        if let Some(date_to) = filter.date_to {
            range.insert("lte".to_string(), json!(date_to));
        }
        filters.push(json!({ "range": { "date": range } }));
    }

    json!({
        "from": request.page.offset(),
        "size": request.page.size,
        "query": { "bool": { "must": must, "filter": filters } },
        "sort": [{ "date": { "order": "desc" } }, "_score"],
        "highlight": { "fields": { "subject": {}, "body_text": {} } }
    })
}

fn into_results(response: SearchResponse) -> IntegrationResult<SearchResults> {
    let hits = response
        .hits
        .hits
        .into_iter()
        .map(|hit| {
            let id = hit
                .id
                .parse()
                .map_err(|_| IntegrationError::ParseError(format!("non-numeric id {}", hit.id)))?;
            Ok(SearchHit {
                id,
                score: hit.score,
                document: hit.source,
                highlights: hit.highlight,
            })
        })
        .collect::<IntegrationResult<Vec<_>>>()?;

    Ok(SearchResults {
        total: response.hits.total.value,
        hits,
    })
}
