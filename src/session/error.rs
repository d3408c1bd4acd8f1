//! Error taxonomy for session operations.
//!
//! Input errors are rejected synchronously with no state change;
//! collaborator errors carry the provider failure; consistency errors
//! (duplicate utterances, stale transitions) are handled inline and
//! never surface here.

use crate::providers::ProviderError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("meeting URL is not a supported platform: {0}")]
    InvalidMeetingUrl(String),

    #[error("bot dispatch failed: {0}")]
    Dispatch(#[source] ProviderError),

    #[error("meeting {0} not found")]
    NotFound(String),

    #[error("session is {0} and no longer accepts this operation")]
    Terminal(&'static str),

    #[error("session is {0}; transcript ingestion requires an active session")]
    NotActive(&'static str),

    #[error("no briefing available: {0}")]
    BriefingUnavailable(String),

    #[error("speech request {0} not found")]
    UnknownSpeechRequest(String),

    #[error("speech request {0} is already speaking and cannot be cancelled")]
    TooLateToCancel(String),

    #[error("session task is gone")]
    SessionGone,
}

impl SessionError {
    /// True for errors caused by the caller's input rather than by the
    /// session or a collaborator.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidMeetingUrl(_)
                | Self::NotFound(_)
                | Self::Terminal(_)
                | Self::NotActive(_)
                | Self::UnknownSpeechRequest(_)
                | Self::TooLateToCancel(_)
        )
    }
}
