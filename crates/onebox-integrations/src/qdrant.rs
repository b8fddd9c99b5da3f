//! Vector storage via the Qdrant REST API

use async_trait::async_trait;
use onebox_core::{VectorHit, VectorQuery, VectorStore};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};
use url::Url;

use crate::http::{base_url, check_status};
use crate::{IntegrationError, IntegrationResult};

const SERVICE: &str = "qdrant";

#[derive(Deserialize)]
struct SearchResponse {
    result: Vec<ScoredPoint>,
}

#[derive(Deserialize)]
struct ScoredPoint {
    id: Value,
    score: f32,
    #[serde(default)]
    payload: Value,
}

pub struct QdrantStore {
    client: reqwest::Client,
    base: Url,
    collection: String,
}

impl QdrantStore {
    pub fn new(base_url_str: &str, collection: impl Into<String>) -> IntegrationResult<Self> {
        Ok(Self {
            client: reqwest::Client::new(),
            base: base_url(base_url_str)?,
            collection: collection.into(),
        })
    }

    fn url(&self, path: &str) -> IntegrationResult<Url> {
        Ok(self
            .base
            .join(&format!("collections/{}{}", self.collection, path))?)
    }

    /// Create the collection for `dimensions`-long vectors unless it exists
    pub async fn ensure_collection(&self, dimensions: usize) -> IntegrationResult<()> {
        let response = self.client.get(self.url("")?).send().await?;
        if response.status().is_success() {
            debug!("Qdrant collection {} exists", self.collection);
            return Ok(());
        }
        if response.status() != reqwest::StatusCode::NOT_FOUND {
            check_status(SERVICE, response).await?;
        }

        let response = self
            .client
            .put(self.url("")?)
            .json(&json!({ "vectors": { "size": dimensions, "distance": "Cosine" } }))
            .send()
            .await?;
        check_status(SERVICE, response).await?;
        info!(
            "Created Qdrant collection {} ({} dimensions)",
            self.collection, dimensions
        );
        Ok(())
    }

    pub async fn upsert_point(&self, id: u64, vector: Vec<f32>, payload: Value) -> IntegrationResult<()> {
        let mut url = self.url("/points")?;
        url.query_pairs_mut().append_pair("wait", "true");

        let response = self
            .client
            .put(url)
            .json(&json!({ "points": [{ "id": id, "vector": vector, "payload": payload }] }))
            .send()
            .await?;
        check_status(SERVICE, response).await?;
        debug!("Stored vector for point {}", id);
        Ok(())
    }

    pub async fn search_points(&self, query: &VectorQuery) -> IntegrationResult<Vec<VectorHit>> {
        let response = self
            .client
            .post(self.url("/points/search")?)
            .json(&build_search_body(query))
            .send()
            .await?;
        let response = check_status(SERVICE, response).await?;

        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| IntegrationError::ParseError(e.to_string()))?;

        body.result
            .into_iter()
            .map(|point| {
                let id = point.id.as_u64().ok_or_else(|| {
                    IntegrationError::ParseError(format!("unexpected point id {}", point.id))
                })?;
                Ok(VectorHit {
                    id,
                    score: point.score,
                    payload: point.payload,
                })
            })
            .collect()
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn upsert(&self, id: u64, vector: Vec<f32>, payload: Value) -> anyhow::Result<()> {
        Ok(self.upsert_point(id, vector, payload).await?)
    }

    async fn search(&self, query: VectorQuery) -> anyhow::Result<Vec<VectorHit>> {
        Ok(self.search_points(&query).await?)
    }
}

pub fn build_search_body(query: &VectorQuery) -> Value {
    let must: Vec<Value> = query
        .must
        .iter()
        .map(|(key, value)| json!({ "key": key, "match": { "value": value } }))
        .collect();

    let mut filter = json!({ "must": must });
    if !query.exclude_ids.is_empty() {
        filter["must_not"] = json!([{ "has_id": query.exclude_ids }]);
    }

    json!({
        "vector": query.vector,
        "limit": query.limit,
        "with_payload": true,
        "filter": filter,
    })
}
