//! Session event fan-out.
//!
//! Every state transition, buffer update and speech-request change is
//! published to a per-session broadcast channel. Subscribers get a fresh
//! snapshot event on (re)connect followed by live events, so a dropped
//! connection never leaves a silent gap; delivery is at-least-once in
//! emission order.

use crate::briefing::Briefing;
use crate::session::{SessionInfo, SessionStatus};
use crate::speech::SpeechRequest;
use crate::transcript::Utterance;
use serde::Serialize;
use tokio::sync::broadcast;

/// Events observable on a session's subscription stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged {
        status: SessionStatus,
        reason: Option<String>,
    },
    Utterance {
        utterance: Utterance,
    },
    BriefingUpdated {
        briefing: Briefing,
    },
    SpeechUpdate {
        request: SpeechRequest,
    },
    /// Sent once to each newly connected subscriber before live events.
    Snapshot {
        info: SessionInfo,
        briefing: Option<Briefing>,
        transcript: Vec<Utterance>,
    },
}

/// Per-session fan-out hub. Holds no subscriber state beyond the
/// broadcast channel; dropping a receiver is the unsubscribe.
pub struct EventHub {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: SessionEvent) {
        // No subscribers is fine; events are observable, not durable.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(256)
    }
}
