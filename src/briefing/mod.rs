//! Briefing value and the per-session cache/refresh bookkeeping.
//!
//! A briefing is derived from the transcript at a point in time and is
//! superseded, never mutated. The cache keeps summarization calls to a
//! minimum: a briefing whose high-water-mark matches the buffer is a
//! hit, and concurrent refreshes for the same session collapse into one
//! in-flight collaborator call whose result every caller receives.
//!
//! The bookkeeping here runs inside the session actor, which is what
//! makes the single-flight guarantee hold without extra locking; the
//! collaborator call itself happens on a spawned task and commits its
//! result back through the actor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::warn;

use crate::session::SessionError;

/// A generated meeting summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Briefing {
    pub summary: String,
    pub key_points: Vec<String>,
    pub speakers: Vec<String>,
    /// Seconds of meeting audio the briefing covers.
    pub covered_secs: f64,
    pub generated_at: DateTime<Utc>,
    /// Transcript sequence number the briefing was computed up to.
    pub high_water_mark: u64,
    /// Set when a refresh failed and this is the previous briefing.
    pub stale: bool,
}

impl Briefing {
    /// Well-defined "no content yet" value for an empty transcript.
    /// Never the product of a collaborator call.
    pub fn sentinel() -> Self {
        Self {
            summary: "Meeting is starting. No discussion yet.".to_string(),
            key_points: Vec::new(),
            speakers: Vec::new(),
            covered_secs: 0.0,
            generated_at: Utc::now(),
            high_water_mark: 0,
            stale: false,
        }
    }
}

/// Reply channel handed to each `get` caller.
pub type BriefingWaiter = oneshot::Sender<Result<Briefing, SessionError>>;

/// Single-flight cache state. Owned by the session actor.
#[derive(Default)]
pub struct BriefingCache {
    cached: Option<Briefing>,
    waiters: Vec<BriefingWaiter>,
    in_flight: bool,
}

impl BriefingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached(&self) -> Option<&Briefing> {
        self.cached.as_ref()
    }

    /// Cache hit iff the cached briefing covers the buffer's current
    /// high-water-mark and the caller did not force a refresh.
    pub fn hit(&self, buffer_hwm: u64, force: bool) -> Option<Briefing> {
        if force {
            return None;
        }
        self.cached
            .as_ref()
            .filter(|b| b.high_water_mark == buffer_hwm)
            .cloned()
    }

    /// Register a caller for the in-flight refresh, starting one if none
    /// is running. Returns true when the caller should launch the
    /// collaborator call.
    pub fn join_flight(&mut self, waiter: BriefingWaiter) -> bool {
        self.waiters.push(waiter);
        if self.in_flight {
            false
        } else {
            self.in_flight = true;
            true
        }
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Commit the outcome of a refresh and resolve every waiter.
    ///
    /// On success the briefing becomes the cached value (the
    /// high-water-mark never moves backwards). On failure, waiters get
    /// the previous briefing flagged stale if one exists, or the error.
    pub fn commit(&mut self, outcome: Result<Briefing, String>) -> Option<Briefing> {
        self.in_flight = false;
        let waiters = std::mem::take(&mut self.waiters);

        match outcome {
            Ok(briefing) => {
                let supersedes = self
                    .cached
                    .as_ref()
                    .map(|c| briefing.high_water_mark >= c.high_water_mark)
                    .unwrap_or(true);
                if supersedes {
                    self.cached = Some(briefing.clone());
                } else {
                    warn!(
                        hwm = briefing.high_water_mark,
                        "Discarding briefing older than cached high-water-mark"
                    );
                }
                for waiter in waiters {
                    let _ = waiter.send(Ok(briefing.clone()));
                }
                Some(briefing)
            }
            Err(reason) => {
                match &self.cached {
                    Some(previous) => {
                        let mut stale = previous.clone();
                        stale.stale = true;
                        for waiter in waiters {
                            let _ = waiter.send(Ok(stale.clone()));
                        }
                    }
                    None => {
                        for waiter in waiters {
                            let _ =
                                waiter.send(Err(SessionError::BriefingUnavailable(reason.clone())));
                        }
                    }
                }
                None
            }
        }
    }

    /// Resolve any remaining waiters on session teardown.
    pub fn fail_all(&mut self, reason: &str) {
        self.in_flight = false;
        for waiter in std::mem::take(&mut self.waiters) {
            let _ = waiter.send(Err(SessionError::BriefingUnavailable(reason.to_string())));
        }
    }
}
