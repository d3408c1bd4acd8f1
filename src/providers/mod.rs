//! Collaborator contracts and their HTTP implementations.
//!
//! The orchestrator core depends on two external collaborators, modeled
//! as traits so the session machinery can be exercised against mocks:
//! - `BotPlatform` — dispatches a bot into a meeting, makes it speak,
//!   asks it to leave (Recall.ai in production).
//! - `LanguageModel` — summarization and answer composition (OpenAI in
//!   production).
//!
//! Failures are classified transient vs. fatal so the retry layer can
//! apply bounded exponential backoff to network-class errors while
//! auth/quota failures fail fast.

pub mod openai;
pub mod recall;
pub mod retry;

pub use openai::OpenAiModel;
pub use recall::RecallBot;
pub use retry::RetryPolicy;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("network error: {0}")]
    Network(String),

    #[error("{provider} returned HTTP {status}: {message}")]
    Http {
        provider: &'static str,
        status: u16,
        message: String,
    },

    #[error("collaborator call timed out")]
    Timeout,

    #[error("unexpected response shape: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Transient failures are worth retrying: network-class errors,
    /// timeouts, rate limiting and server-side 5xx. Client-side 4xx
    /// (bad auth, exhausted quota semantics aside from 429) are fatal.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            Self::InvalidResponse(_) => false,
        }
    }
}

/// Meeting-bot platform contract.
#[async_trait]
pub trait BotPlatform: Send + Sync {
    /// Dispatch a bot to a meeting. `callback_url` is where the platform
    /// delivers transcript events. Returns the platform's bot id.
    async fn dispatch_bot(
        &self,
        meeting_url: &str,
        callback_url: &str,
        bot_name: &str,
    ) -> Result<String, ProviderError>;

    /// Ask the bot to speak. Resolves once the platform acknowledges the
    /// speak command was issued, not when the audio finishes.
    async fn speak(&self, bot_id: &str, text: &str) -> Result<(), ProviderError>;

    /// Ask the bot to leave the meeting.
    async fn request_leave(&self, bot_id: &str) -> Result<(), ProviderError>;

    /// Current platform-side status code for a bot, e.g. `in_call_recording`.
    /// `None` when the platform has not reported any status yet.
    async fn bot_status(&self, bot_id: &str) -> Result<Option<String>, ProviderError>;
}

/// What the summarizer produces for one transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BriefOutline {
    pub summary: String,
    pub key_points: Vec<String>,
    pub speakers: Vec<String>,
}

/// Language-model collaborator contract.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn summarize(&self, transcript: &str) -> Result<BriefOutline, ProviderError>;

    /// Compose a spoken answer to `question` grounded in the meeting
    /// `context`.
    async fn respond(&self, question: &str, context: &str) -> Result<String, ProviderError>;
}
