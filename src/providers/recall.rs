//! Recall.ai bot platform client.

use super::{BotPlatform, ProviderError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

const PROVIDER: &str = "recall";

pub struct RecallBot {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct BotCreated {
    id: String,
}

#[derive(Debug, Deserialize)]
struct BotDetail {
    #[serde(default)]
    status_changes: Vec<StatusChange>,
}

#[derive(Debug, Deserialize)]
struct StatusChange {
    code: String,
}

impl RecallBot {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn auth_header(&self) -> String {
        format!("Token {}", self.api_key)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(ProviderError::Http {
            provider: PROVIDER,
            status: status.as_u16(),
            message,
        })
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Network(err.to_string())
        }
    }
}

#[async_trait]
impl BotPlatform for RecallBot {
    async fn dispatch_bot(
        &self,
        meeting_url: &str,
        callback_url: &str,
        bot_name: &str,
    ) -> Result<String, ProviderError> {
        let response = self
            .client
            .post(format!("{}/bot/", self.base_url))
            .header("Authorization", self.auth_header())
            .json(&json!({
                "meeting_url": meeting_url,
                "bot_name": bot_name,
                "transcription_options": { "provider": "deepgram" },
                "real_time_transcription": { "destination_url": callback_url },
            }))
            .send()
            .await?;

        let response = Self::check(response).await?;
        let bot: BotCreated = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        info!("Created bot {} for meeting {}", bot.id, meeting_url);
        Ok(bot.id)
    }

    async fn speak(&self, bot_id: &str, text: &str) -> Result<(), ProviderError> {
        let response = self
            .client
            .post(format!("{}/bot/{}/speak/", self.base_url, bot_id))
            .header("Authorization", self.auth_header())
            .json(&json!({ "text": text }))
            .send()
            .await?;

        Self::check(response).await?;
        info!(
            "Bot {} speaking: {}...",
            bot_id,
            text.chars().take(50).collect::<String>()
        );
        Ok(())
    }

    async fn bot_status(&self, bot_id: &str) -> Result<Option<String>, ProviderError> {
        let response = self
            .client
            .get(format!("{}/bot/{}/", self.base_url, bot_id))
            .header("Authorization", self.auth_header())
            .send()
            .await?;

        let response = Self::check(response).await?;
        let detail: BotDetail = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        // status_changes is append-only; the last entry is the current state.
        Ok(detail.status_changes.into_iter().last().map(|c| c.code))
    }

    async fn request_leave(&self, bot_id: &str) -> Result<(), ProviderError> {
        let response = self
            .client
            .post(format!("{}/bot/{}/leave/", self.base_url, bot_id))
            .header("Authorization", self.auth_header())
            .send()
            .await;

        match response {
            Ok(response) => {
                Self::check(response).await?;
                info!("Bot {} left meeting", bot_id);
                Ok(())
            }
            Err(e) => {
                error!("Failed to make bot {} leave: {}", bot_id, e);
                Err(e.into())
            }
        }
    }
}
