//! Gemini-backed classification and embeddings

use async_trait::async_trait;
use onebox_core::{Classification, Classifier, EmailLabel, Embedder, StoredMessage};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};
use url::Url;

use crate::http::{base_url, check_status};
use crate::{IntegrationError, IntegrationResult};

const SERVICE: &str = "gemini";
const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/";

pub const DEFAULT_MODEL: &str = "gemini-pro";
pub const EMBEDDING_MODEL: &str = "text-embedding-004";
/// Length of vectors produced by [`EMBEDDING_MODEL`]
pub const EMBEDDING_DIMENSIONS: usize = 768;

/// Characters of body text shown to the classifier
const PROMPT_BODY_CHARS: usize = 500;

/// Label used when the model's answer cannot be used
const FALLBACK_LABEL: EmailLabel = EmailLabel::NotInterested;

pub struct GeminiClient {
    client: reqwest::Client,
    base: Url,
    api_key: String,
    model: String,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> IntegrationResult<Self> {
        Ok(Self {
            client: reqwest::Client::new(),
            base: base_url(API_BASE)?,
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    fn url(&self, model: &str, method: &str) -> IntegrationResult<Url> {
        let mut url = self.base.join(&format!("models/{}:{}", model, method))?;
        url.query_pairs_mut().append_pair("key", &self.api_key);
        Ok(url)
    }

    /// Single-turn text generation
    pub async fn generate(&self, prompt: &str) -> IntegrationResult<String> {
        let response = self
            .client
            .post(self.url(&self.model, "generateContent")?)
            .json(&json!({ "contents": [{ "parts": [{ "text": prompt }] }] }))
            .send()
            .await?;
        let response = check_status(SERVICE, response).await?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| IntegrationError::ParseError(e.to_string()))?;

        let text = body["candidates"][0]["content"]["parts"]
            .as_array()
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p["text"].as_str())
                    .collect::<String>()
            })
            .unwrap_or_default();
        Ok(text)
    }

    /// Embed a text with [`EMBEDDING_MODEL`]
    pub async fn embed_text(&self, text: &str) -> IntegrationResult<Vec<f32>> {
        #[derive(Deserialize)]
        struct EmbedResponse {
            embedding: Embedding,
        }
        #[derive(Deserialize)]
        struct Embedding {
            values: Vec<f32>,
        }

        let response = self
            .client
            .post(self.url(EMBEDDING_MODEL, "embedContent")?)
            .json(&json!({
                "model": format!("models/{}", EMBEDDING_MODEL),
                "content": { "parts": [{ "text": text }] }
            }))
            .send()
            .await?;
        let response = check_status(SERVICE, response).await?;

        let body: EmbedResponse = response
            .json()
            .await
            .map_err(|e| IntegrationError::ParseError(e.to_string()))?;
        Ok(body.embedding.values)
    }
}

#[async_trait]
impl Classifier for GeminiClient {
    async fn classify(&self, message: &StoredMessage) -> anyhow::Result<Classification> {
        let prompt = classification_prompt(
            message.subject.as_deref().unwrap_or_default(),
            &message.body_excerpt(PROMPT_BODY_CHARS),
        );
        let answer = self.generate(&prompt).await?;
        let classification = parse_classification(&answer, &self.model);
        debug!(
            "Message {} classified as {} ({:.2})",
            message.id, classification.label, classification.confidence
        );
        Ok(classification)
    }
}

#[async_trait]
impl Embedder for GeminiClient {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        Ok(self.embed_text(text).await?)
    }
}

pub fn classification_prompt(subject: &str, body: &str) -> String {
    format!(
        r#"You are an email classification AI. Analyze the following email and classify it into ONE of these categories:
- Interested
- Meeting Booked
- Not Interested
- Spam
- Out of Office

Subject: {subject}
Body: {body}

Return ONLY a JSON object with this exact format:
{{
  "label": "category_name",
  "confidence": 0.85
}}

Rules:
- "Interested" = Lead shows interest, asks questions, wants to know more
- "Meeting Booked" = Contains meeting confirmations, calendar invites, scheduled time
- "Not Interested" = Polite rejection, not interested, unsubscribe requests
- "Spam" = Promotional, marketing, unsolicited bulk emails
- "Out of Office" = Auto-reply, vacation message, unavailable notice
"#
    )
}

/// Read a label out of free-form model output
///
/// Any answer without a usable JSON object, or naming a label outside the
/// closed set, becomes `Not Interested` with confidence 0.
pub fn parse_classification(answer: &str, model: &str) -> Classification {
    #[derive(Deserialize)]
    struct Answer {
        label: String,
        confidence: Option<f32>,
    }

    let fallback = |reason: &str| {
        warn!("Unusable classification ({}): {}", reason, answer.trim());
        Classification {
            label: FALLBACK_LABEL,
            confidence: 0.0,
            model: model.to_string(),
        }
    };

    let (Some(start), Some(end)) = (answer.find('{'), answer.rfind('}')) else {
        return fallback("no JSON object");
    };
    if end < start {
        return fallback("no JSON object");
    }

    let parsed: Answer = match serde_json::from_str(&answer[start..=end]) {
        Ok(parsed) => parsed,
        Err(_) => return fallback("invalid JSON"),
    };
    let Ok(label) = parsed.label.parse::<EmailLabel>() else {
        return fallback("unknown label");
    };

    Classification {
        label,
        confidence: parsed
            .confidence
            .filter(|c| c.is_finite())
            .map_or(0.0, |c| c.clamp(0.0, 1.0)),
        model: model.to_string(),
    }
}
