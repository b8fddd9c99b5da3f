//! Slack and generic webhook notifications

use async_trait::async_trait;
use onebox_core::{Classification, Notifier, StoredMessage};
use serde_json::{json, Value};
use tracing::{info, warn};
use url::Url;

use crate::http::check_status;
use crate::IntegrationResult;

/// Event name sent to the generic webhook
pub const INTERESTED_EVENT: &str = "email.interested";

/// Posts high-priority messages to whichever channels are configured
///
/// Delivery is best effort: a failing channel is logged and the others
/// still receive the event.
pub struct WebhookNotifier {
    client: reqwest::Client,
    slack: Option<Url>,
    webhook: Option<Url>,
}

impl WebhookNotifier {
    pub fn new(slack: Option<&str>, webhook: Option<&str>) -> IntegrationResult<Self> {
        Ok(Self {
            client: reqwest::Client::new(),
            slack: slack.map(Url::parse).transpose()?,
            webhook: webhook.map(Url::parse).transpose()?,
        })
    }

    pub fn is_configured(&self) -> bool {
        self.slack.is_some() || self.webhook.is_some()
    }

    async fn post(&self, url: &Url, payload: &Value) -> IntegrationResult<()> {
        let response = self.client.post(url.clone()).json(payload).send().await?;
        check_status("webhook", response).await?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(
        &self,
        message: &StoredMessage,
        classification: &Classification,
    ) -> anyhow::Result<()> {
        let now = chrono::Utc::now();

        if let Some(url) = &self.slack {
            match self.post(url, &slack_payload(message, classification, now)).await {
                Ok(()) => info!("Slack notification sent for message {}", message.id),
                Err(e) => warn!("Slack notification failed for message {}: {}", message.id, e),
            }
        }

        if let Some(url) = &self.webhook {
            match self.post(url, &webhook_payload(message, classification, now)).await {
                Ok(()) => info!("Webhook sent for message {}", message.id),
                Err(e) => warn!("Webhook failed for message {}: {}", message.id, e),
            }
        }

        Ok(())
    }
}

/// Slack incoming-webhook message with blocks
pub fn slack_payload(
    message: &StoredMessage,
    classification: &Classification,
    now: chrono::DateTime<chrono::Utc>,
) -> Value {
    json!({
        "text": "*New Interested Lead!*",
        "blocks": [
            {
                "type": "header",
                "text": { "type": "plain_text", "text": "New Interested Email Received", "emoji": true }
            },
            {
                "type": "section",
                "fields": [
                    { "type": "mrkdwn", "text": format!("*From:*\n{}", message.from) },
                    {
                        "type": "mrkdwn",
                        "text": format!(
                            "*Classification:*\n{} ({:.0}% confidence)",
                            classification.label,
                            classification.confidence * 100.0
                        )
                    }
                ]
            },
            {
                "type": "section",
                "text": { "type": "mrkdwn", "text": format!("*Subject:*\n{}", message.subject.as_deref().unwrap_or("(no subject)")) }
            },
            {
                "type": "section",
                "text": { "type": "mrkdwn", "text": format!("*Preview:*\n{}", message.snippet.as_deref().unwrap_or_default()) }
            },
            {
                "type": "context",
                "elements": [
                    { "type": "mrkdwn", "text": format!("Email ID: {} | Timestamp: {}", message.id, now.to_rfc3339()) }
                ]
            }
        ]
    })
}

/// Generic JSON webhook body
pub fn webhook_payload(
    message: &StoredMessage,
    classification: &Classification,
    now: chrono::DateTime<chrono::Utc>,
) -> Value {
    json!({
        "event": INTERESTED_EVENT,
        "timestamp": now.to_rfc3339(),
        "data": {
            "email_id": message.id,
            "account_id": message.account_id,
            "subject": message.subject,
            "from": message.from,
            "snippet": message.snippet,
            "classification": classification.label,
            "confidence": classification.confidence,
        }
    })
}
