//! OpenAI chat-completions client for briefing and answer composition.

use super::{BriefOutline, LanguageModel, ProviderError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

const PROVIDER: &str = "openai";

const BRIEF_SYSTEM_PROMPT: &str = "You are a meeting assistant. Generate concise briefings from meeting transcripts.\n\n\
Your briefing should include:\n\
1. Main topics being discussed\n\
2. Key decisions made\n\
3. Action items mentioned\n\
4. Current discussion focus\n\n\
Keep it concise and informative.";

const KEY_POINTS_SYSTEM_PROMPT: &str = "Extract 3-5 key bullet points from this meeting brief. \
Return only the bullet points, one per line.";

const SPEAKERS_SYSTEM_PROMPT: &str = "Extract unique speaker names/identifiers from this transcript. \
Return as a comma-separated list.";

const RESPOND_SYSTEM_PROMPT: &str = "You are an AI assistant in a live meeting. Answer questions based on the meeting discussion.\n\n\
Guidelines:\n\
- Be concise and natural\n\
- Base answers on the meeting context provided\n\
- If information isn't in the context, say so politely\n\
- Keep responses suitable for speaking aloud in a meeting\n\
- Aim for 2-3 sentences";

pub struct OpenAiModel {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

impl OpenAiModel {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    async fn chat(
        &self,
        system: &str,
        user: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, ProviderError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": [
                    { "role": "system", "content": system },
                    { "role": "user", "content": user },
                ],
                "temperature": temperature,
                "max_tokens": max_tokens,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Http {
                provider: PROVIDER,
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::InvalidResponse("no completion choices".to_string()))
    }
}

/// Parse the key-point completion: one point per line, bullet markers
/// stripped, at most five.
fn parse_key_points(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| line.trim().trim_start_matches(['-', '•', '*', ' ']).trim())
        .filter(|line| !line.is_empty())
        .take(5)
        .map(str::to_string)
        .collect()
}

/// Parse the speaker completion: comma-separated names.
fn parse_speakers(text: &str) -> Vec<String> {
    text.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl LanguageModel for OpenAiModel {
    async fn summarize(&self, transcript: &str) -> Result<BriefOutline, ProviderError> {
        let user = format!("Transcript:\n{transcript}\n\nGenerate a brief meeting summary.");
        let summary = self.chat(BRIEF_SYSTEM_PROMPT, &user, 0.7, 500).await?;

        let key_points = self
            .chat(KEY_POINTS_SYSTEM_PROMPT, &summary, 0.3, 200)
            .await
            .map(|text| parse_key_points(&text))
            .unwrap_or_default();

        let speakers = self
            .chat(SPEAKERS_SYSTEM_PROMPT, transcript, 0.3, 100)
            .await
            .map(|text| parse_speakers(&text))
            .unwrap_or_default();

        Ok(BriefOutline {
            summary,
            key_points,
            speakers,
        })
    }

    async fn respond(&self, question: &str, context: &str) -> Result<String, ProviderError> {
        let user = format!(
            "Meeting context:\n{context}\n\nQuestion: {question}\n\n\
             Provide a natural, concise response suitable for speaking in the meeting."
        );
        self.chat(RESPOND_SYSTEM_PROMPT, &user, 0.7, 150).await
    }
}
