//! Speech request types, the per-session FIFO queue, and pause watching.
//!
//! The bot has a single speaking channel. The scheduler (driven by the
//! session actor) processes exactly one request at a time through
//! `composing → waiting-for-pause → speaking → spoken`; everything else
//! waits in the queue in submission order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

/// Lifecycle status of one question-to-spoken-answer cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpeechStatus {
    Queued,
    Composing,
    WaitingForPause,
    Speaking,
    Spoken,
    Failed,
}

impl SpeechStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Composing => "composing",
            Self::WaitingForPause => "waiting-for-pause",
            Self::Speaking => "speaking",
            Self::Spoken => "spoken",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Spoken | Self::Failed)
    }
}

/// One question/answer cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechRequest {
    pub id: String,
    pub question: String,
    /// Generated answer, absent until composition completes.
    pub response: Option<String>,
    pub status: SpeechStatus,
    pub wait_for_pause: bool,
    pub requested_at: DateTime<Utc>,
    pub will_speak_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure: Option<String>,
}

impl SpeechRequest {
    pub fn new(question: String, wait_for_pause: bool) -> Self {
        Self {
            id: format!("q_{}", &Uuid::new_v4().simple().to_string()[..8]),
            question,
            response: None,
            status: SpeechStatus::Queued,
            wait_for_pause,
            requested_at: Utc::now(),
            will_speak_at: None,
            completed_at: None,
            failure: None,
        }
    }
}

/// FIFO queue of speech requests for one session. The head is the only
/// request a driver may be working on.
#[derive(Default)]
pub struct SpeechQueue {
    requests: VecDeque<SpeechRequest>,
}

impl SpeechQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, request: SpeechRequest) {
        self.requests.push_back(request);
    }

    pub fn head(&self) -> Option<&SpeechRequest> {
        self.requests.front()
    }

    pub fn head_mut(&mut self) -> Option<&mut SpeechRequest> {
        self.requests.front_mut()
    }

    pub fn pop_head(&mut self) -> Option<SpeechRequest> {
        self.requests.pop_front()
    }

    pub fn get(&self, id: &str) -> Option<&SpeechRequest> {
        self.requests.iter().find(|r| r.id == id)
    }

    /// Remove a queued (non-head) request outright.
    pub fn remove(&mut self, id: &str) -> Option<SpeechRequest> {
        let idx = self.requests.iter().position(|r| r.id == id)?;
        self.requests.remove(idx)
    }

    pub fn depth(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Mark every remaining request failed, returning the affected
    /// requests for fan-out. Used on session teardown.
    pub fn fail_all(&mut self, reason: &str) -> Vec<SpeechRequest> {
        let mut failed = Vec::new();
        while let Some(mut request) = self.requests.pop_front() {
            request.status = SpeechStatus::Failed;
            request.failure = Some(reason.to_string());
            request.completed_at = Some(Utc::now());
            failed.push(request);
        }
        failed
    }
}

/// Why the pause wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseOutcome {
    /// The conversation went quiet for the configured interval.
    Quiet,
    /// The conversation never paused; the maximum wait bound elapsed.
    MaxWaitElapsed,
}

/// Wait for a contiguous quiet interval (no new final utterance) of
/// `quiet_interval`, bounded by `max_wait`.
///
/// `last_final` carries the arrival instant of the most recent final
/// utterance; the session actor updates it on every final ingest. This
/// wakes on either the quiet duration elapsing or the bound expiring,
/// whichever comes first.
pub async fn await_pause(
    mut last_final: watch::Receiver<Option<Instant>>,
    quiet_interval: Duration,
    max_wait: Duration,
) -> PauseOutcome {
    let deadline = Instant::now() + max_wait;

    loop {
        let wake_at = {
            let last = *last_final.borrow_and_update();
            match last {
                // No speech at all counts as quiet.
                None => return PauseOutcome::Quiet,
                Some(at) => {
                    let quiet_until = at + quiet_interval;
                    if quiet_until <= Instant::now() {
                        return PauseOutcome::Quiet;
                    }
                    quiet_until
                }
            }
        };

        if wake_at >= deadline {
            tokio::time::sleep_until(deadline).await;
            return PauseOutcome::MaxWaitElapsed;
        }

        tokio::select! {
            _ = tokio::time::sleep_until(wake_at) => {
                // Quiet interval elapsed without a new final utterance;
                // loop once more to confirm against the watch value.
            }
            changed = last_final.changed() => {
                if changed.is_err() {
                    // Session torn down; stop waiting.
                    return PauseOutcome::Quiet;
                }
            }
        }
    }
}
