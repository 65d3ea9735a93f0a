use crate::config::WebhookConfig;
use crate::db::{BotRecord, BotStore};
use crate::types::Message;
use reqwest::{Client, StatusCode};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Skipped,
    Delivered,
    Rejected(u16),
    Failed(String),
    Resynced(Option<u16>),
}

#[derive(Clone)]
pub struct WebhookDispatcher {
    client: Client,
    bots: Arc<dyn BotStore>,
    stale_token_marker: String,
}

impl WebhookDispatcher {
    pub fn new(bots: Arc<dyn BotStore>, config: &WebhookConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds.max(1)))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            bots,
            stale_token_marker: config.stale_token_marker.to_lowercase(),
        }
    }

    pub async fn post(&self, bot: &RwLock<BotRecord>, message: &Message) -> DeliveryOutcome {
        let (bot_id, url) = {
            let bot = bot.read().await;
            (bot.id.clone(), bot.webhook.clone())
        };
        let Some(url) = url.filter(|u| !u.trim().is_empty()) else {
            return DeliveryOutcome::Skipped;
        };

        let (status, body) = match self.attempt(&url, message).await {
            Ok(resp) => resp,
            Err(err) => {
                tracing::warn!(bot = %bot_id, %url, "webhook post failed: {err}");
                return DeliveryOutcome::Failed(err.to_string());
            }
        };

        if status.is_success() {
            return DeliveryOutcome::Delivered;
        }

        if status != StatusCode::UNPROCESSABLE_ENTITY
            || !body.to_lowercase().contains(&self.stale_token_marker)
        {
            tracing::warn!(bot = %bot_id, %url, status = status.as_u16(), "webhook rejected message {}", message.id);
            return DeliveryOutcome::Rejected(status.as_u16());
        }

        tracing::info!(bot = %bot_id, "webhook reported a stale callback token, resynchronizing");
        let fresh = match self.bots.resync_webhook(&bot_id).await {
            Ok(fresh) => fresh,
            Err(err) => {
                tracing::warn!(bot = %bot_id, "webhook resync failed: {err:#}");
                return DeliveryOutcome::Failed(err.to_string());
            }
        };
        bot.write().await.webhook = fresh.clone();

        let Some(fresh) = fresh else {
            return DeliveryOutcome::Resynced(None);
        };
        match self.attempt(&fresh, message).await {
            Ok((status, _)) => {
                if !status.is_success() {
                    tracing::warn!(bot = %bot_id, url = %fresh, status = status.as_u16(), "webhook retry rejected message {}", message.id);
                }
                DeliveryOutcome::Resynced(Some(status.as_u16()))
            }
            Err(err) => {
                tracing::warn!(bot = %bot_id, url = %fresh, "webhook retry failed: {err}");
                DeliveryOutcome::Failed(err.to_string())
            }
        }
    }

    // The body is rebuilt on every call so a retry never reuses a consumed one.
    async fn attempt(&self, url: &str, message: &Message) -> reqwest::Result<(StatusCode, String)> {
        let resp = self
            .client
            .post(url)
            .json(&json!({ "message": message }))
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Ok((status, body))
    }
}
