//! Per-session orchestrator.
//!
//! One actor task per meeting owns all mutable session state: lifecycle
//! status, the transcript buffer, the briefing cache and the speech
//! queue. Its command channel is the session's single sequencing point —
//! no two mutations interleave. Collaborator calls (summarize, compose,
//! speak, leave) never run on the actor; they run on spawned driver
//! tasks and commit their results back as commands, so ingestion is
//! never blocked behind a slow provider.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::briefing::{Briefing, BriefingCache, BriefingWaiter};
use crate::config::{BriefingConfig, SessionConfig, SpeechConfig};
use crate::providers::{BotPlatform, LanguageModel, RetryPolicy};
use crate::session::events::{EventHub, SessionEvent};
use crate::session::{SessionError, SessionInfo, SessionStatus};
use crate::speech::{self, PauseOutcome, SpeechQueue, SpeechRequest, SpeechStatus};
use crate::store::{SessionSnapshot, SessionStore};
use crate::transcript::{IngestOutcome, TranscriptBuffer, Utterance};

/// How many completed speech requests to keep around for status lookups.
const FINISHED_REQUESTS_KEPT: usize = 32;

/// Everything a session needs from the outside world, injected at
/// construction. No globals.
#[derive(Clone)]
pub struct SessionRuntime {
    pub platform: Arc<dyn BotPlatform>,
    pub model: Arc<dyn LanguageModel>,
    pub store: Arc<dyn SessionStore>,
    pub speech: SpeechConfig,
    pub briefing: BriefingConfig,
    pub session: SessionConfig,
    /// Terminal sessions announce themselves here; the registry listens
    /// and drops its handle.
    pub on_terminal: mpsc::UnboundedSender<String>,
}

impl SessionRuntime {
    fn platform_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.session.retry_attempts,
            Duration::from_millis(self.session.retry_base_delay_ms),
            Duration::from_secs(self.session.platform_timeout_seconds),
        )
    }

    fn summarize_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.session.retry_attempts,
            Duration::from_millis(self.session.retry_base_delay_ms),
            Duration::from_secs(self.briefing.call_timeout_seconds),
        )
    }

    fn compose_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.session.retry_attempts,
            Duration::from_millis(self.session.retry_base_delay_ms),
            Duration::from_secs(self.speech.call_timeout_seconds),
        )
    }
}

/// Status query result: current state plus the numbers the transport
/// layer reports upward.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub info: SessionInfo,
    pub high_water_mark: u64,
    pub queue_depth: usize,
    pub utterance_count: usize,
    pub active_request: Option<SpeechRequest>,
}

enum Command {
    ConfirmJoined,
    Ingest {
        utterance: Utterance,
        reply: oneshot::Sender<u64>,
    },
    RequestLeave {
        reply: oneshot::Sender<()>,
    },
    LeaveResolved {
        timed_out: bool,
    },
    MarkError {
        reason: String,
    },
    ForceEnd {
        reason: String,
    },
    Status {
        reply: oneshot::Sender<SessionSummary>,
    },
    GetBriefing {
        force: bool,
        reply: BriefingWaiter,
    },
    CommitBriefing {
        outcome: Result<Briefing, String>,
    },
    Submit {
        question: String,
        wait_for_pause: bool,
        reply: oneshot::Sender<Result<SpeechRequest, SessionError>>,
    },
    Cancel {
        request_id: String,
        reply: oneshot::Sender<Result<SpeechRequest, SessionError>>,
    },
    SpeechPhase {
        request_id: String,
        phase: DriverPhase,
    },
    Subscribe {
        reply: oneshot::Sender<(SessionEvent, broadcast::Receiver<SessionEvent>)>,
    },
}

/// Progress reports from a speech driver task.
enum DriverPhase {
    Composed { response: String },
    WaitingForPause,
    Speaking,
    Spoken,
    Failed { reason: String },
}

/// Cloneable handle to one session's actor. All operations on a session
/// go through here.
#[derive(Clone)]
pub struct SessionHandle {
    meeting_id: String,
    tx: mpsc::UnboundedSender<Command>,
    info_rx: watch::Receiver<SessionInfo>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("meeting_id", &self.meeting_id)
            .finish()
    }
}

impl SessionHandle {
    pub fn meeting_id(&self) -> &str {
        &self.meeting_id
    }

    /// Cheap, lock-free view of the current session info.
    pub fn info(&self) -> SessionInfo {
        self.info_rx.borrow().clone()
    }

    fn guard_active(&self) -> Result<(), SessionError> {
        let status = self.info_rx.borrow().status;
        if status.is_terminal() {
            Err(SessionError::Terminal(status.as_str()))
        } else if status != SessionStatus::Active {
            Err(SessionError::NotActive(status.as_str()))
        } else {
            Ok(())
        }
    }

    fn guard_not_terminal(&self) -> Result<(), SessionError> {
        let status = self.info_rx.borrow().status;
        if status.is_terminal() {
            Err(SessionError::Terminal(status.as_str()))
        } else {
            Ok(())
        }
    }

    fn send(&self, command: Command) -> Result<(), SessionError> {
        self.tx.send(command).map_err(|_| SessionError::SessionGone)
    }

    /// Feed one transcript event into the session. Returns the buffer's
    /// new high-water-mark.
    pub async fn ingest(&self, utterance: Utterance) -> Result<u64, SessionError> {
        self.guard_active()?;
        let (reply, rx) = oneshot::channel();
        self.send(Command::Ingest { utterance, reply })?;
        rx.await.map_err(|_| SessionError::SessionGone)
    }

    /// Bot platform confirmed the bot is in the call.
    pub fn confirm_joined(&self) -> Result<(), SessionError> {
        self.send(Command::ConfirmJoined)
    }

    /// Wait for the session to leave its pre-join states. Resolves
    /// immediately once the session is active (or further along).
    pub async fn wait_until_active(&self) -> Result<(), SessionError> {
        let mut rx = self.info_rx.clone();
        let info = rx
            .wait_for(|info| {
                !matches!(info.status, SessionStatus::Pending | SessionStatus::Joining)
            })
            .await
            .map_err(|_| SessionError::SessionGone)?;
        match info.status {
            SessionStatus::Active => Ok(()),
            status if status.is_terminal() => Err(SessionError::Terminal(status.as_str())),
            status => Err(SessionError::NotActive(status.as_str())),
        }
    }

    /// Begin leaving the meeting. Resolves when the session reaches
    /// `ending`; the `ended` transition follows on bot ack or timeout.
    pub async fn request_leave(&self) -> Result<(), SessionError> {
        self.guard_not_terminal()?;
        let (reply, rx) = oneshot::channel();
        self.send(Command::RequestLeave { reply })?;
        rx.await.map_err(|_| SessionError::SessionGone)
    }

    /// Move the session to `error`. Idempotent; a no-op on terminal
    /// sessions.
    pub fn mark_error(&self, reason: impl Into<String>) {
        let _ = self.send(Command::MarkError {
            reason: reason.into(),
        });
    }

    /// Force-end the session (idle sweep). No-op on terminal sessions.
    pub fn force_end(&self, reason: impl Into<String>) {
        let _ = self.send(Command::ForceEnd {
            reason: reason.into(),
        });
    }

    pub async fn status(&self) -> Result<SessionSummary, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { reply })?;
        rx.await.map_err(|_| SessionError::SessionGone)
    }

    /// Get the current briefing, refreshing through the summarizer when
    /// the cached one is behind the transcript (or `force` is set).
    pub async fn briefing(&self, force: bool) -> Result<Briefing, SessionError> {
        self.guard_active()?;
        let (reply, rx) = oneshot::channel();
        self.send(Command::GetBriefing { force, reply })?;
        rx.await.map_err(|_| SessionError::SessionGone)?
    }

    /// Queue a question for the bot to answer aloud.
    pub async fn submit_question(
        &self,
        question: String,
        wait_for_pause: bool,
    ) -> Result<SpeechRequest, SessionError> {
        self.guard_active()?;
        let (reply, rx) = oneshot::channel();
        self.send(Command::Submit {
            question,
            wait_for_pause,
            reply,
        })?;
        rx.await.map_err(|_| SessionError::SessionGone)?
    }

    pub async fn cancel_question(&self, request_id: &str) -> Result<SpeechRequest, SessionError> {
        self.guard_not_terminal()?;
        let (reply, rx) = oneshot::channel();
        self.send(Command::Cancel {
            request_id: request_id.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| SessionError::SessionGone)?
    }

    /// Subscribe to the session's event stream. The returned snapshot
    /// event precedes any live event the receiver will see.
    pub async fn subscribe(
        &self,
    ) -> Result<(SessionEvent, broadcast::Receiver<SessionEvent>), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Subscribe { reply })?;
        rx.await.map_err(|_| SessionError::SessionGone)
    }
}

pub struct SessionMachine;

impl SessionMachine {
    /// Spawn the actor for a freshly created session and hand back its
    /// handle. `info` must be in `pending`.
    pub fn spawn(info: SessionInfo, runtime: SessionRuntime) -> SessionHandle {
        Self::spawn_actor(info, TranscriptBuffer::new(), 0, runtime)
    }

    /// Rebuild a session from a checkpoint after a restart.
    ///
    /// The checkpointed transcript text (final-only, speaker-labeled) is
    /// seeded back as a single final utterance at the saved
    /// high-water-mark, so briefings and answer context pick up where the
    /// previous process left off. Live ingestion continues from the next
    /// sequence number onward.
    pub fn resume(snapshot: SessionSnapshot, runtime: SessionRuntime) -> SessionHandle {
        let mut buffer = TranscriptBuffer::new();
        if snapshot.high_water_mark > 0 && !snapshot.transcript_text.is_empty() {
            buffer.ingest(Utterance {
                seq: snapshot.high_water_mark,
                speaker: None,
                text: snapshot.transcript_text,
                is_final: true,
                start_secs: 0.0,
                end_secs: 0.0,
            });
        }
        Self::spawn_actor(snapshot.info, buffer, snapshot.high_water_mark, runtime)
    }

    fn spawn_actor(
        info: SessionInfo,
        buffer: TranscriptBuffer,
        last_published_seq: u64,
        runtime: SessionRuntime,
    ) -> SessionHandle {
        let meeting_id = info.meeting_id.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let (info_tx, info_rx) = watch::channel(info.clone());
        let (last_final_tx, _) = watch::channel(None);

        let actor = SessionActor {
            info,
            buffer,
            briefing: BriefingCache::new(),
            queue: SpeechQueue::new(),
            finished: VecDeque::new(),
            hub: EventHub::default(),
            runtime,
            info_tx,
            last_final_tx,
            last_published_seq,
            driver: None,
            self_tx: tx.clone(),
        };

        tokio::spawn(actor.run(rx));

        SessionHandle {
            meeting_id,
            tx,
            info_rx,
        }
    }
}

struct SessionActor {
    info: SessionInfo,
    buffer: TranscriptBuffer,
    briefing: BriefingCache,
    queue: SpeechQueue,
    finished: VecDeque<SpeechRequest>,
    hub: EventHub,
    runtime: SessionRuntime,
    info_tx: watch::Sender<SessionInfo>,
    last_final_tx: watch::Sender<Option<Instant>>,
    last_published_seq: u64,
    driver: Option<JoinHandle<()>>,
    self_tx: mpsc::UnboundedSender<Command>,
}

impl SessionActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            self.handle(command);
        }
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
        debug!("Session {} actor stopped", self.info.meeting_id);
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::ConfirmJoined => self.confirm_joined(),
            Command::Ingest { utterance, reply } => {
                let hwm = self.ingest(utterance);
                let _ = reply.send(hwm);
            }
            Command::RequestLeave { reply } => {
                self.request_leave();
                let _ = reply.send(());
            }
            Command::LeaveResolved { timed_out } => self.leave_resolved(timed_out),
            Command::MarkError { reason } => self.mark_error(reason),
            Command::ForceEnd { reason } => self.force_end(reason),
            Command::Status { reply } => {
                let _ = reply.send(self.summary());
            }
            Command::GetBriefing { force, reply } => self.get_briefing(force, reply),
            Command::CommitBriefing { outcome } => self.commit_briefing(outcome),
            Command::Submit {
                question,
                wait_for_pause,
                reply,
            } => {
                let _ = reply.send(self.submit(question, wait_for_pause));
            }
            Command::Cancel { request_id, reply } => {
                let _ = reply.send(self.cancel(&request_id));
            }
            Command::SpeechPhase { request_id, phase } => self.speech_phase(&request_id, phase),
            Command::Subscribe { reply } => {
                let snapshot = SessionEvent::Snapshot {
                    info: self.info.clone(),
                    briefing: self.briefing.cached().cloned(),
                    transcript: self.buffer.snapshot(),
                };
                let _ = reply.send((snapshot, self.hub.subscribe()));
            }
        }
    }

    // ---- lifecycle -------------------------------------------------------

    fn confirm_joined(&mut self) {
        match self.info.status {
            SessionStatus::Pending | SessionStatus::Joining => {
                info!("Bot joined meeting {}", self.info.meeting_id);
                self.transition(SessionStatus::Active, None);
            }
            status => {
                warn!(
                    "Stale joined confirmation for meeting {} in state {}",
                    self.info.meeting_id,
                    status.as_str()
                );
            }
        }
    }

    fn request_leave(&mut self) {
        match self.info.status {
            SessionStatus::Ending | SessionStatus::Ended | SessionStatus::Error => {
                debug!(
                    "Leave requested for meeting {} already {}",
                    self.info.meeting_id,
                    self.info.status.as_str()
                );
            }
            _ => {
                self.transition(SessionStatus::Ending, None);
                self.spawn_leave_driver();
            }
        }
    }

    fn leave_resolved(&mut self, timed_out: bool) {
        if self.info.status != SessionStatus::Ending {
            return;
        }
        let reason = if timed_out {
            warn!(
                "Bot leave timed out for meeting {}; forcing ended",
                self.info.meeting_id
            );
            "LeaveTimedOut"
        } else {
            "left"
        };
        self.transition(SessionStatus::Ended, Some(reason.to_string()));
    }

    fn mark_error(&mut self, reason: String) {
        if self.info.status.is_terminal() {
            debug!(
                "mark_error on terminal meeting {} ignored",
                self.info.meeting_id
            );
            return;
        }
        error!("Meeting {} errored: {}", self.info.meeting_id, reason);
        self.transition(SessionStatus::Error, Some(reason));
    }

    fn force_end(&mut self, reason: String) {
        if self.info.status.is_terminal() {
            return;
        }
        info!("Meeting {} force-ended: {}", self.info.meeting_id, reason);
        self.transition(SessionStatus::Ended, Some(reason));
    }

    fn transition(&mut self, status: SessionStatus, reason: Option<String>) {
        self.info.status = status;
        self.info.last_activity = Utc::now();
        if reason.is_some() {
            self.info.ended_reason = reason.clone();
        }
        let _ = self.info_tx.send(self.info.clone());
        self.hub.publish(SessionEvent::StateChanged { status, reason });

        if status.is_terminal() {
            self.teardown();
        } else {
            self.checkpoint();
        }
    }

    /// Release everything the session owns once it is terminal.
    fn teardown(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
        for request in self.queue.fail_all("session ended") {
            self.hub.publish(SessionEvent::SpeechUpdate { request });
        }
        self.briefing.fail_all("session ended");

        let store = self.runtime.store.clone();
        let meeting_id = self.info.meeting_id.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = store.delete(&meeting_id) {
                warn!("Failed to drop checkpoint for meeting {}: {}", meeting_id, e);
            }
        });

        let _ = self.runtime.on_terminal.send(self.info.meeting_id.clone());
    }

    fn spawn_leave_driver(&self) {
        let platform = self.runtime.platform.clone();
        let retry = self.runtime.platform_retry();
        let bot_id = self.info.bot_id.clone();
        let tx = self.self_tx.clone();
        let leave_timeout = Duration::from_secs(self.runtime.session.leave_timeout_seconds);

        tokio::spawn(async move {
            let leave = retry.run("bot leave", || {
                let platform = platform.clone();
                let bot_id = bot_id.clone();
                async move { platform.request_leave(&bot_id).await }
            });
            let timed_out = match tokio::time::timeout(leave_timeout, leave).await {
                Ok(Ok(())) => false,
                Ok(Err(e)) => {
                    warn!("Bot {} leave failed: {}", bot_id, e);
                    true
                }
                Err(_) => true,
            };
            let _ = tx.send(Command::LeaveResolved { timed_out });
        });
    }

    /// Actor-side activity check. The handle guards before enqueueing,
    /// but that read races with transitions already in the queue; this
    /// is the authoritative check.
    fn require_active(&self) -> Result<(), SessionError> {
        let status = self.info.status;
        if status.is_terminal() {
            Err(SessionError::Terminal(status.as_str()))
        } else if status != SessionStatus::Active {
            Err(SessionError::NotActive(status.as_str()))
        } else {
            Ok(())
        }
    }

    // ---- transcript ------------------------------------------------------

    fn ingest(&mut self, utterance: Utterance) -> u64 {
        if self.info.status != SessionStatus::Active {
            // Raced with a transition after the handle's guard.
            debug!(
                "Dropping transcript event for {} session {}",
                self.info.status.as_str(),
                self.info.meeting_id
            );
            return self.buffer.high_water_mark();
        }
        let seq = utterance.seq;
        let is_final = utterance.is_final;
        let accepted = self.buffer.ingest(utterance.clone());
        self.info.last_activity = Utc::now();

        if accepted != IngestOutcome::Rejected {
            if is_final {
                let _ = self.last_final_tx.send(Some(Instant::now()));
            }
            // Fan-out stays in non-decreasing seq order; a late
            // correction for an earlier seq lands in the buffer and
            // reaches subscribers through their next snapshot.
            if seq >= self.last_published_seq {
                self.last_published_seq = seq;
                self.hub.publish(SessionEvent::Utterance { utterance });
            } else {
                debug!(seq, "Suppressing out-of-order fan-out for late correction");
            }
        }

        self.buffer.high_water_mark()
    }

    // ---- briefing --------------------------------------------------------

    fn get_briefing(&mut self, force: bool, reply: BriefingWaiter) {
        // The handle pre-checks too, but a command queued behind a
        // terminal transition still reaches us; re-check here.
        if let Err(e) = self.require_active() {
            let _ = reply.send(Err(e));
            return;
        }
        // Interim utterances never feed the summarizer; until the first
        // final one lands the transcript text is empty and the briefing
        // is the sentinel.
        if self.buffer.final_count() == 0 {
            let _ = reply.send(Ok(Briefing::sentinel()));
            return;
        }

        let hwm = self.buffer.high_water_mark();
        if let Some(hit) = self.briefing.hit(hwm, force) {
            let _ = reply.send(Ok(hit));
            return;
        }

        self.info.last_activity = Utc::now();
        if self.briefing.join_flight(reply) {
            self.spawn_briefing_flight(hwm);
        }
    }

    fn spawn_briefing_flight(&self, hwm: u64) {
        let model = self.runtime.model.clone();
        let retry = self.runtime.summarize_retry();
        let tx = self.self_tx.clone();
        let transcript = self.buffer.text_since(0);
        let labeled_speakers = self.buffer.speakers();
        let covered_secs = self.buffer.covered_secs();

        tokio::spawn(async move {
            let result = retry
                .run("summarize", || {
                    let model = model.clone();
                    let transcript = transcript.clone();
                    async move { model.summarize(&transcript).await }
                })
                .await;

            let outcome = match result {
                Ok(outline) => {
                    // Transcript speaker labels win; the model's analysis
                    // fills in when the recognizer gave us none.
                    let speakers = if labeled_speakers.is_empty() {
                        outline.speakers
                    } else {
                        labeled_speakers
                    };
                    Ok(Briefing {
                        summary: outline.summary,
                        key_points: outline.key_points,
                        speakers,
                        covered_secs,
                        generated_at: Utc::now(),
                        high_water_mark: hwm,
                        stale: false,
                    })
                }
                Err(e) => Err(e.to_string()),
            };
            let _ = tx.send(Command::CommitBriefing { outcome });
        });
    }

    fn commit_briefing(&mut self, outcome: Result<Briefing, String>) {
        if let Some(briefing) = self.briefing.commit(outcome) {
            self.hub.publish(SessionEvent::BriefingUpdated { briefing });
            self.checkpoint();
        }
    }

    // ---- speech ----------------------------------------------------------

    fn submit(
        &mut self,
        question: String,
        wait_for_pause: bool,
    ) -> Result<SpeechRequest, SessionError> {
        self.require_active()?;
        let request = SpeechRequest::new(question, wait_for_pause);
        info!(
            "Meeting {} queued speech request {} (depth {})",
            self.info.meeting_id,
            request.id,
            self.queue.depth() + 1
        );
        self.info.last_activity = Utc::now();
        self.queue.push(request.clone());
        self.hub.publish(SessionEvent::SpeechUpdate {
            request: request.clone(),
        });
        self.maybe_start_driver();
        Ok(request)
    }

    /// Start a driver for the head request if none is running. The bot's
    /// speaking channel is single-writer: exactly one request is in
    /// flight per session, and the next starts only once the head is
    /// terminal, which is what keeps completion strictly FIFO.
    fn maybe_start_driver(&mut self) {
        if self.driver.is_some() {
            return;
        }
        let Some(head) = self.queue.head_mut() else {
            return;
        };

        head.status = SpeechStatus::Composing;
        let request = head.clone();
        self.hub.publish(SessionEvent::SpeechUpdate {
            request: request.clone(),
        });

        let model = self.runtime.model.clone();
        let platform = self.runtime.platform.clone();
        let compose_retry = self.runtime.compose_retry();
        let speak_retry = self.runtime.platform_retry();
        let tx = self.self_tx.clone();
        let bot_id = self.info.bot_id.clone();
        let context = self.buffer.tail_text(self.runtime.speech.context_chars);
        let quiet = self.runtime.speech.quiet_interval();
        let max_wait = self.runtime.speech.max_pause_wait();
        let last_final = self.last_final_tx.subscribe();

        self.driver = Some(tokio::spawn(async move {
            let request_id = request.id.clone();
            let phase = |p: DriverPhase| {
                let _ = tx.send(Command::SpeechPhase {
                    request_id: request_id.clone(),
                    phase: p,
                });
            };

            let question = request.question.clone();
            let composed = compose_retry
                .run("compose response", || {
                    let model = model.clone();
                    let question = question.clone();
                    let context = context.clone();
                    async move { model.respond(&question, &context).await }
                })
                .await;

            let response = match composed {
                Ok(response) => response,
                Err(e) => {
                    phase(DriverPhase::Failed {
                        reason: format!("CompositionFailed: {e}"),
                    });
                    return;
                }
            };
            phase(DriverPhase::Composed {
                response: response.clone(),
            });

            if request.wait_for_pause {
                phase(DriverPhase::WaitingForPause);
                match speech::await_pause(last_final, quiet, max_wait).await {
                    PauseOutcome::Quiet => {}
                    PauseOutcome::MaxWaitElapsed => {
                        debug!("No pause observed; speaking after max wait bound");
                    }
                }
            }

            phase(DriverPhase::Speaking);
            let spoken = speak_retry
                .run("bot speak", || {
                    let platform = platform.clone();
                    let bot_id = bot_id.clone();
                    let response = response.clone();
                    async move { platform.speak(&bot_id, &response).await }
                })
                .await;

            match spoken {
                Ok(()) => phase(DriverPhase::Spoken),
                Err(e) => phase(DriverPhase::Failed {
                    reason: format!("SpeakFailed: {e}"),
                }),
            }
        }));
    }

    fn speech_phase(&mut self, request_id: &str, phase: DriverPhase) {
        let Some(head) = self.queue.head_mut() else {
            return;
        };
        if head.id != request_id {
            // Stale report from an aborted driver.
            return;
        }

        let mut terminal = false;
        match phase {
            DriverPhase::Composed { response } => {
                head.response = Some(response);
            }
            DriverPhase::WaitingForPause => {
                head.status = SpeechStatus::WaitingForPause;
            }
            DriverPhase::Speaking => {
                head.status = SpeechStatus::Speaking;
                head.will_speak_at = Some(Utc::now());
            }
            DriverPhase::Spoken => {
                head.status = SpeechStatus::Spoken;
                head.completed_at = Some(Utc::now());
                terminal = true;
            }
            DriverPhase::Failed { reason } => {
                head.status = SpeechStatus::Failed;
                head.failure = Some(reason);
                head.completed_at = Some(Utc::now());
                terminal = true;
            }
        }

        let request = head.clone();
        self.hub.publish(SessionEvent::SpeechUpdate {
            request: request.clone(),
        });

        if terminal {
            self.driver = None;
            self.queue.pop_head();
            self.remember_finished(request);
            self.maybe_start_driver();
        }
    }

    fn cancel(&mut self, request_id: &str) -> Result<SpeechRequest, SessionError> {
        let status = match self.queue.get(request_id) {
            Some(request) => request.status,
            None => {
                if self.finished.iter().any(|r| r.id == request_id) {
                    return Err(SessionError::TooLateToCancel(request_id.to_string()));
                }
                return Err(SessionError::UnknownSpeechRequest(request_id.to_string()));
            }
        };

        match status {
            SpeechStatus::Queued => {
                let mut request = self
                    .queue
                    .remove(request_id)
                    .expect("queued request just looked up");
                request.status = SpeechStatus::Failed;
                request.failure = Some("Cancelled".to_string());
                request.completed_at = Some(Utc::now());
                self.hub.publish(SessionEvent::SpeechUpdate {
                    request: request.clone(),
                });
                self.remember_finished(request.clone());
                Ok(request)
            }
            SpeechStatus::Composing => {
                if let Some(driver) = self.driver.take() {
                    driver.abort();
                }
                let mut request = self
                    .queue
                    .pop_head()
                    .expect("composing request is the head");
                request.status = SpeechStatus::Failed;
                request.failure = Some("Cancelled".to_string());
                request.completed_at = Some(Utc::now());
                self.hub.publish(SessionEvent::SpeechUpdate {
                    request: request.clone(),
                });
                self.remember_finished(request.clone());
                self.maybe_start_driver();
                Ok(request)
            }
            _ => Err(SessionError::TooLateToCancel(request_id.to_string())),
        }
    }

    fn remember_finished(&mut self, request: SpeechRequest) {
        self.finished.push_back(request);
        while self.finished.len() > FINISHED_REQUESTS_KEPT {
            self.finished.pop_front();
        }
    }

    // ---- status / checkpoint --------------------------------------------

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            info: self.info.clone(),
            high_water_mark: self.buffer.high_water_mark(),
            queue_depth: self.queue.depth(),
            utterance_count: self.buffer.len(),
            active_request: self.queue.head().cloned(),
        }
    }

    /// Opportunistic checkpoint; never on the critical path and never
    /// fatal.
    fn checkpoint(&self) {
        let snapshot = SessionSnapshot {
            info: self.info.clone(),
            high_water_mark: self.buffer.high_water_mark(),
            transcript_text: self.buffer.text_since(0),
        };
        let store = self.runtime.store.clone();
        let meeting_id = self.info.meeting_id.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = store.put(&meeting_id, &snapshot) {
                warn!("Checkpoint failed for meeting {}: {}", meeting_id, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testutil::{pending_info, utterance, world};
    use std::sync::atomic::Ordering;

    /// Poll until `check` passes or the deadline hits.
    async fn wait_until<F>(what: &str, mut check: F)
    where
        F: FnMut() -> bool,
    {
        for _ in 0..300 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for: {what}");
    }

    async fn active_session() -> (SessionHandle, crate::session::testutil::TestWorld) {
        let w = world();
        let handle = SessionMachine::spawn(pending_info("m_test"), w.runtime.clone());
        handle.confirm_joined().unwrap();
        let h = handle.clone();
        wait_until("session active", move || {
            h.info().status == SessionStatus::Active
        })
        .await;
        (handle, w)
    }

    #[tokio::test]
    async fn test_confirm_joined_activates_pending() {
        let (handle, _w) = active_session().await;
        assert_eq!(handle.info().status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn test_stale_confirm_joined_is_noop() {
        let (handle, _w) = active_session().await;
        // Second confirmation is a warning, not an error or a transition.
        handle.confirm_joined().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handle.info().status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn test_ingest_rejected_before_active() {
        let w = world();
        let handle = SessionMachine::spawn(pending_info("m_test"), w.runtime.clone());
        let err = handle.ingest(utterance(1, "hello", true)).await.unwrap_err();
        assert!(matches!(err, SessionError::NotActive("pending")));
    }

    #[tokio::test]
    async fn test_ingest_returns_high_water_mark() {
        let (handle, _w) = active_session().await;
        assert_eq!(handle.ingest(utterance(1, "one", true)).await.unwrap(), 1);
        assert_eq!(handle.ingest(utterance(3, "three", true)).await.unwrap(), 3);
        assert_eq!(handle.ingest(utterance(2, "two", true)).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_interim_then_final_keeps_final_text() {
        let (handle, _w) = active_session().await;
        handle
            .ingest(utterance(1, "we should", false))
            .await
            .unwrap();
        handle
            .ingest(utterance(1, "we should approve the budget", true))
            .await
            .unwrap();

        let summary = handle.status().await.unwrap();
        assert_eq!(summary.utterance_count, 1);
        assert_eq!(summary.high_water_mark, 1);

        let (snapshot, _rx) = handle.subscribe().await.unwrap();
        match snapshot {
            SessionEvent::Snapshot { transcript, .. } => {
                assert_eq!(transcript.len(), 1);
                assert!(transcript[0].is_final);
                assert_eq!(transcript[0].text, "we should approve the budget");
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_terminal_session_rejects_everything() {
        let (handle, _w) = active_session().await;
        handle.force_end("test over");
        let h = handle.clone();
        wait_until("session ended", move || h.info().status.is_terminal()).await;

        assert!(matches!(
            handle.ingest(utterance(1, "late", true)).await,
            Err(SessionError::Terminal("ended"))
        ));
        assert!(matches!(
            handle.submit_question("q?".to_string(), false).await,
            Err(SessionError::Terminal("ended"))
        ));
        assert!(matches!(
            handle.briefing(false).await,
            Err(SessionError::Terminal("ended"))
        ));
    }

    #[tokio::test]
    async fn test_commands_queued_behind_terminal_transition_rejected() {
        let (handle, w) = active_session().await;
        handle.ingest(utterance(1, "content", true)).await.unwrap();

        // Back to back, without waiting for the transition: the submit
        // and briefing commands land in the queue behind the end, past
        // the handle's fast-path guard. The actor must still reject them.
        handle.force_end("sweep");
        let submit = handle.submit_question("too late?".to_string(), false).await;
        let briefing = handle.briefing(true).await;

        assert!(matches!(submit, Err(SessionError::Terminal("ended"))));
        assert!(matches!(briefing, Err(SessionError::Terminal("ended"))));
        assert_eq!(w.model.summarize_calls.load(Ordering::SeqCst), 0);
        assert!(w.platform.speak_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_briefing_sentinel_with_only_interim_utterances() {
        let (handle, w) = active_session().await;
        handle
            .ingest(utterance(1, "we were just", false))
            .await
            .unwrap();
        handle
            .ingest(utterance(2, "about to start", false))
            .await
            .unwrap();

        let briefing = handle.briefing(false).await.unwrap();
        assert_eq!(briefing.summary, "Meeting is starting. No discussion yet.");
        assert_eq!(w.model.summarize_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_briefing_sentinel_on_empty_transcript() {
        let (handle, w) = active_session().await;
        let briefing = handle.briefing(false).await.unwrap();
        assert_eq!(briefing.summary, "Meeting is starting. No discussion yet.");
        assert_eq!(briefing.high_water_mark, 0);
        // The sentinel never costs a collaborator call.
        assert_eq!(w.model.summarize_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_briefing_cache_hit_at_same_hwm() {
        let (handle, w) = active_session().await;
        handle.ingest(utterance(1, "budget talk", true)).await.unwrap();

        let first = handle.briefing(false).await.unwrap();
        let second = handle.briefing(false).await.unwrap();
        assert_eq!(first.summary, second.summary);
        assert_eq!(first.high_water_mark, 1);
        assert_eq!(w.model.summarize_calls.load(Ordering::SeqCst), 1);

        // New transcript content invalidates the cache.
        handle.ingest(utterance(2, "more talk", true)).await.unwrap();
        let third = handle.briefing(false).await.unwrap();
        assert_eq!(third.high_water_mark, 2);
        assert_eq!(w.model.summarize_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_briefing_force_refresh_bypasses_cache() {
        let (handle, w) = active_session().await;
        handle.ingest(utterance(1, "hello", true)).await.unwrap();

        handle.briefing(false).await.unwrap();
        handle.briefing(true).await.unwrap();
        assert_eq!(w.model.summarize_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_briefings_single_flight() {
        let (handle, w) = active_session().await;
        handle.ingest(utterance(42, "hello", true)).await.unwrap();
        w.model.summarize_delay_ms.store(100, Ordering::SeqCst);

        let h1 = handle.clone();
        let h2 = handle.clone();
        let (a, b) = tokio::join!(h1.briefing(false), h2.briefing(false));
        let a = a.unwrap();
        let b = b.unwrap();

        assert_eq!(w.model.summarize_calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.summary, b.summary);
        assert_eq!(a.high_water_mark, 42);
        assert_eq!(b.high_water_mark, 42);
    }

    #[tokio::test]
    async fn test_briefing_failure_returns_stale_previous() {
        let (handle, w) = active_session().await;
        handle.ingest(utterance(1, "hello", true)).await.unwrap();
        let fresh = handle.briefing(false).await.unwrap();
        assert!(!fresh.stale);

        handle.ingest(utterance(2, "more", true)).await.unwrap();
        w.model.fail_summarize.store(true, Ordering::SeqCst);

        let stale = handle.briefing(false).await.unwrap();
        assert!(stale.stale);
        assert_eq!(stale.high_water_mark, 1);
        assert_eq!(stale.summary, fresh.summary);
    }

    #[tokio::test]
    async fn test_briefing_unavailable_without_previous() {
        let (handle, w) = active_session().await;
        handle.ingest(utterance(1, "hello", true)).await.unwrap();
        w.model.fail_summarize.store(true, Ordering::SeqCst);

        let err = handle.briefing(false).await.unwrap_err();
        assert!(matches!(err, SessionError::BriefingUnavailable(_)));
    }

    #[tokio::test]
    async fn test_speech_request_reaches_spoken() {
        let (handle, w) = active_session().await;
        handle.ingest(utterance(1, "context", true)).await.unwrap();

        let request = handle
            .submit_question("What's the budget status?".to_string(), false)
            .await
            .unwrap();
        assert_eq!(request.status, SpeechStatus::Queued);

        wait_until("speak call issued", || {
            !w.platform.speak_calls.lock().unwrap().is_empty()
        })
        .await;

        let calls = w.platform.speak_calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "bot_test");
        assert_eq!(calls[0].1, "Answering: What's the budget status?");
    }

    #[tokio::test]
    async fn test_speech_requests_complete_in_fifo_order() {
        let (handle, w) = active_session().await;
        w.model.respond_delay_ms.store(30, Ordering::SeqCst);

        let first = handle
            .submit_question("first?".to_string(), false)
            .await
            .unwrap();
        let second = handle
            .submit_question("second?".to_string(), false)
            .await
            .unwrap();
        let third = handle
            .submit_question("third?".to_string(), false)
            .await
            .unwrap();
        assert_ne!(first.id, second.id);
        assert_ne!(second.id, third.id);

        wait_until("all requests spoken", || {
            w.platform.speak_calls.lock().unwrap().len() == 3
        })
        .await;

        let calls = w.platform.speak_calls.lock().unwrap();
        let spoken: Vec<&str> = calls.iter().map(|(_, text)| text.as_str()).collect();
        assert_eq!(
            spoken,
            vec![
                "Answering: first?",
                "Answering: second?",
                "Answering: third?"
            ]
        );
    }

    #[tokio::test]
    async fn test_wait_for_pause_speaks_after_max_wait_bound() {
        let (handle, w) = active_session().await;

        // Conversation that never pauses: a final utterance every 20ms,
        // against a 50ms quiet interval and a 300ms max wait.
        let talker_handle = handle.clone();
        let talker = tokio::spawn(async move {
            let mut seq = 100u64;
            loop {
                tokio::time::sleep(Duration::from_millis(20)).await;
                if talker_handle
                    .ingest(utterance(seq, "still talking", true))
                    .await
                    .is_err()
                {
                    break;
                }
                seq += 1;
            }
        });

        handle
            .submit_question("can I interject?".to_string(), true)
            .await
            .unwrap();

        wait_until("bot spoke despite no pause", || {
            !w.platform.speak_calls.lock().unwrap().is_empty()
        })
        .await;
        talker.abort();
    }

    #[tokio::test]
    async fn test_composition_failure_fails_request_and_advances() {
        let (handle, w) = active_session().await;
        w.model.fail_respond.store(true, Ordering::SeqCst);

        let (_, mut rx) = handle.subscribe().await.unwrap();
        let request = handle
            .submit_question("doomed?".to_string(), false)
            .await
            .unwrap();

        // Watch for the failure on the event stream.
        let failed = loop {
            match rx.recv().await.unwrap() {
                SessionEvent::SpeechUpdate { request: r }
                    if r.id == request.id && r.status == SpeechStatus::Failed =>
                {
                    break r;
                }
                _ => continue,
            }
        };
        assert!(failed.failure.unwrap().starts_with("CompositionFailed"));

        // The scheduler is free again for the next request.
        w.model.fail_respond.store(false, Ordering::SeqCst);
        handle
            .submit_question("alive?".to_string(), false)
            .await
            .unwrap();
        wait_until("next request spoken", || {
            !w.platform.speak_calls.lock().unwrap().is_empty()
        })
        .await;
    }

    #[tokio::test]
    async fn test_cancel_queued_request() {
        let (handle, w) = active_session().await;
        w.model.respond_delay_ms.store(200, Ordering::SeqCst);

        let head = handle
            .submit_question("slow one".to_string(), false)
            .await
            .unwrap();
        let queued = handle
            .submit_question("cancel me".to_string(), false)
            .await
            .unwrap();

        let cancelled = handle.cancel_question(&queued.id).await.unwrap();
        assert_eq!(cancelled.status, SpeechStatus::Failed);
        assert_eq!(cancelled.failure.as_deref(), Some("Cancelled"));

        // The head still completes; the cancelled one never speaks.
        wait_until("head spoken", || {
            !w.platform.speak_calls.lock().unwrap().is_empty()
        })
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let calls = w.platform.speak_calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, "Answering: slow one");
        drop(calls);
        let _ = head;
    }

    #[tokio::test]
    async fn test_cancel_composing_request_aborts_driver() {
        let (handle, w) = active_session().await;
        w.model.respond_delay_ms.store(500, Ordering::SeqCst);

        let request = handle
            .submit_question("abort me".to_string(), false)
            .await
            .unwrap();

        let mut composing = false;
        for _ in 0..100 {
            let summary = handle.status().await.unwrap();
            if summary
                .active_request
                .map(|r| r.id == request.id && r.status == SpeechStatus::Composing)
                .unwrap_or(false)
            {
                composing = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(composing, "request never reached composing");

        let cancelled = handle.cancel_question(&request.id).await.unwrap();
        assert_eq!(cancelled.status, SpeechStatus::Failed);

        // Give an aborted driver a chance to (incorrectly) speak.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(w.platform.speak_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_completed_request_is_too_late() {
        let (handle, w) = active_session().await;
        let request = handle
            .submit_question("quick".to_string(), false)
            .await
            .unwrap();

        wait_until("request spoken", || {
            !w.platform.speak_calls.lock().unwrap().is_empty()
        })
        .await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let err = handle.cancel_question(&request.id).await.unwrap_err();
        assert!(matches!(err, SessionError::TooLateToCancel(_)));
    }

    #[tokio::test]
    async fn test_cancel_unknown_request() {
        let (handle, _w) = active_session().await;
        let err = handle.cancel_question("q_missing").await.unwrap_err();
        assert!(matches!(err, SessionError::UnknownSpeechRequest(_)));
    }

    #[tokio::test]
    async fn test_leave_reaches_ended_on_ack() {
        let (handle, mut w) = active_session().await;
        handle.request_leave().await.unwrap();

        let h = handle.clone();
        wait_until("session ended", move || {
            h.info().status == SessionStatus::Ended
        })
        .await;
        assert_eq!(handle.info().ended_reason.as_deref(), Some("left"));
        assert_eq!(w.platform.leave_calls.load(Ordering::SeqCst), 1);

        // The registry hears about the terminal session.
        let announced = w.terminal_rx.recv().await.unwrap();
        assert_eq!(announced, "m_test");
    }

    #[tokio::test]
    async fn test_leave_timeout_forces_ended() {
        let (handle, w) = active_session().await;
        w.platform.hang_leave.store(true, Ordering::SeqCst);

        handle.request_leave().await.unwrap();
        assert_eq!(handle.info().status, SessionStatus::Ending);

        let h = handle.clone();
        wait_until("forced ended", move || {
            h.info().status == SessionStatus::Ended
        })
        .await;
        assert_eq!(
            handle.info().ended_reason.as_deref(),
            Some("LeaveTimedOut")
        );
    }

    #[tokio::test]
    async fn test_teardown_fails_pending_speech_requests() {
        let (handle, w) = active_session().await;
        w.model.respond_delay_ms.store(500, Ordering::SeqCst);

        let (_, mut rx) = handle.subscribe().await.unwrap();
        let head = handle
            .submit_question("in flight".to_string(), false)
            .await
            .unwrap();
        let queued = handle
            .submit_question("still queued".to_string(), false)
            .await
            .unwrap();

        handle.force_end("meeting over");

        let mut failed = Vec::new();
        while failed.len() < 2 {
            match rx.recv().await.unwrap() {
                SessionEvent::SpeechUpdate { request }
                    if request.status == SpeechStatus::Failed =>
                {
                    failed.push(request.id);
                }
                _ => continue,
            }
        }
        assert!(failed.contains(&head.id));
        assert!(failed.contains(&queued.id));
    }

    #[tokio::test]
    async fn test_mark_error_is_idempotent() {
        let (handle, _w) = active_session().await;
        handle.mark_error("first failure");
        handle.mark_error("second failure");

        let h = handle.clone();
        wait_until("session errored", move || {
            h.info().status == SessionStatus::Error
        })
        .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            handle.info().ended_reason.as_deref(),
            Some("first failure")
        );
    }

    #[tokio::test]
    async fn test_subscriber_gets_snapshot_then_live_events() {
        let (handle, _w) = active_session().await;
        handle.ingest(utterance(1, "before subscribe", true)).await.unwrap();

        let (snapshot, mut rx) = handle.subscribe().await.unwrap();
        match snapshot {
            SessionEvent::Snapshot {
                info, transcript, ..
            } => {
                assert_eq!(info.status, SessionStatus::Active);
                assert_eq!(transcript.len(), 1);
            }
            other => panic!("expected snapshot, got {other:?}"),
        }

        handle.ingest(utterance(2, "after subscribe", true)).await.unwrap();
        match rx.recv().await.unwrap() {
            SessionEvent::Utterance { utterance } => {
                assert_eq!(utterance.seq, 2);
                assert_eq!(utterance.text, "after subscribe");
            }
            other => panic!("expected utterance, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resume_seeds_checkpointed_transcript() {
        let w = world();
        let mut info = pending_info("m_test");
        info.status = SessionStatus::Active;
        let snapshot = SessionSnapshot {
            info,
            high_water_mark: 12,
            transcript_text: "Alice: we approved the budget".to_string(),
        };
        let handle = SessionMachine::resume(snapshot, w.runtime.clone());

        let summary = handle.status().await.unwrap();
        assert_eq!(summary.info.status, SessionStatus::Active);
        assert_eq!(summary.high_water_mark, 12);
        assert_eq!(summary.utterance_count, 1);

        // The seeded text feeds the summarizer, not the sentinel.
        let briefing = handle.briefing(false).await.unwrap();
        assert_ne!(briefing.summary, "Meeting is starting. No discussion yet.");
        assert_eq!(briefing.high_water_mark, 12);
        assert_eq!(w.model.summarize_calls.load(Ordering::SeqCst), 1);

        // Live ingestion continues past the checkpoint.
        let hwm = handle
            .ingest(utterance(13, "next item", true))
            .await
            .unwrap();
        assert_eq!(hwm, 13);
    }

    #[tokio::test]
    async fn test_checkpoint_written_on_transition() {
        let (handle, w) = active_session().await;
        handle.ingest(utterance(1, "hello", true)).await.unwrap();
        // Hold the session in `ending` so the checkpoint outlives the poll.
        w.platform.hang_leave.store(true, Ordering::SeqCst);
        handle.request_leave().await.unwrap();

        let store = w.store.clone();
        wait_until("checkpoint for ending state", move || {
            store
                .snapshots
                .lock()
                .unwrap()
                .get("m_test")
                .map(|s| s.info.status == SessionStatus::Ending)
                .unwrap_or(false)
        })
        .await;
        let _ = handle;
    }
}
