//! Session status types and platform detection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a meeting session.
///
/// `pending → joining → active → ending → ended`, with `error` reachable
/// from any non-terminal state. Only `active` accepts transcript
/// ingestion, briefing generation and speech requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Joining,
    Active,
    Ending,
    Ended,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Joining => "joining",
            Self::Active => "active",
            Self::Ending => "ending",
            Self::Ended => "ended",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Error)
    }
}

/// Meeting platform, detected from the meeting URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Zoom,
    MicrosoftTeams,
    GoogleMeet,
}

impl Platform {
    /// Detect the platform from a meeting URL. Returns `None` for URLs we
    /// cannot send a bot to.
    pub fn detect(meeting_url: &str) -> Option<Self> {
        let url = meeting_url.to_lowercase();
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return None;
        }
        if url.contains("zoom.us") {
            Some(Self::Zoom)
        } else if url.contains("teams.microsoft.com") || url.contains("teams.live.com") {
            Some(Self::MicrosoftTeams)
        } else if url.contains("meet.google.com") {
            Some(Self::GoogleMeet)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Zoom => "zoom",
            Self::MicrosoftTeams => "microsoft_teams",
            Self::GoogleMeet => "google_meet",
        }
    }
}

/// Point-in-time view of one session, readable by API handlers and
/// checkpointed to the store on every state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub meeting_id: String,
    pub status: SessionStatus,
    pub user_id: String,
    pub bot_id: String,
    pub bot_name: String,
    pub platform: Platform,
    pub meeting_url: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Why the session reached a terminal state, if it has.
    pub ended_reason: Option<String>,
}

impl SessionInfo {
    pub fn duration_minutes(&self) -> i64 {
        (Utc::now() - self.created_at).num_minutes().max(0)
    }
}
