//! Process-wide map of live sessions.
//!
//! The registry is the only process-wide mutable structure: inserting or
//! removing a session takes the map lock, everything else happens inside
//! the session's own actor. Constructed explicitly and injected; there
//! is no ambient global.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{BriefingConfig, SessionConfig, SpeechConfig};
use crate::providers::{BotPlatform, LanguageModel, RetryPolicy};
use crate::session::machine::{SessionHandle, SessionMachine, SessionRuntime};
use crate::session::{Platform, SessionError, SessionInfo, SessionStatus};
use crate::store::{SessionSnapshot, SessionStore};

pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionHandle>>,
    runtime: SessionRuntime,
    /// Base URL for the transcript callback endpoint handed to the bot
    /// platform.
    callback_base_url: String,
    default_bot_name: String,
}

impl SessionRegistry {
    /// Build the registry and start its background tasks (terminal
    /// cleanup and the idle sweeper).
    pub fn new(
        platform: Arc<dyn BotPlatform>,
        model: Arc<dyn LanguageModel>,
        store: Arc<dyn SessionStore>,
        speech: SpeechConfig,
        briefing: BriefingConfig,
        session: SessionConfig,
        callback_base_url: String,
        default_bot_name: String,
    ) -> Arc<Self> {
        let (terminal_tx, terminal_rx) = mpsc::unbounded_channel();

        let registry = Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            runtime: SessionRuntime {
                platform,
                model,
                store,
                speech,
                briefing,
                session,
                on_terminal: terminal_tx,
            },
            callback_base_url,
            default_bot_name,
        });

        registry.clone().spawn_terminal_listener(terminal_rx);
        registry.clone().spawn_idle_sweeper();
        registry
    }

    /// Create a session: detect the platform, dispatch the bot, spawn
    /// the actor. A dispatch failure creates nothing — the registry has
    /// no entry for the attempted meeting afterwards.
    pub async fn create(
        &self,
        meeting_url: &str,
        user_id: &str,
        bot_name: Option<String>,
    ) -> Result<SessionHandle, SessionError> {
        let platform = Platform::detect(meeting_url)
            .ok_or_else(|| SessionError::InvalidMeetingUrl(meeting_url.to_string()))?;

        let meeting_id = format!("m_{}", &Uuid::new_v4().simple().to_string()[..12]);
        let bot_name = bot_name.unwrap_or_else(|| self.default_bot_name.clone());
        let callback_url = format!(
            "{}/meetings/{}/transcript",
            self.callback_base_url.trim_end_matches('/'),
            meeting_id
        );

        let retry = RetryPolicy::new(
            self.runtime.session.retry_attempts,
            Duration::from_millis(self.runtime.session.retry_base_delay_ms),
            Duration::from_secs(self.runtime.session.platform_timeout_seconds),
        );
        let bot_platform = self.runtime.platform.clone();
        let bot_id = retry
            .run("bot dispatch", || {
                let bot_platform = bot_platform.clone();
                let bot_name = bot_name.clone();
                let callback_url = callback_url.clone();
                async move {
                    bot_platform
                        .dispatch_bot(meeting_url, &callback_url, &bot_name)
                        .await
                }
            })
            .await
            .map_err(SessionError::Dispatch)?;

        let now = Utc::now();
        let session_info = SessionInfo {
            meeting_id: meeting_id.clone(),
            status: SessionStatus::Pending,
            user_id: user_id.to_string(),
            bot_id,
            bot_name,
            platform,
            meeting_url: meeting_url.to_string(),
            created_at: now,
            last_activity: now,
            ended_reason: None,
        };

        let handle = SessionMachine::spawn(session_info.clone(), self.runtime.clone());
        self.sessions
            .lock()
            .await
            .insert(meeting_id.clone(), handle.clone());

        info!(
            "Session {} created for user {} on {}",
            meeting_id,
            user_id,
            platform.as_str()
        );

        // First checkpoint so a restart knows about the pending session.
        let store = self.runtime.store.clone();
        let snapshot = SessionSnapshot {
            info: session_info,
            high_water_mark: 0,
            transcript_text: String::new(),
        };
        tokio::task::spawn_blocking(move || {
            let meeting_id = snapshot.info.meeting_id.clone();
            if let Err(e) = store.put(&meeting_id, &snapshot) {
                warn!("Initial checkpoint failed: {}", e);
            }
        });

        Ok(handle)
    }

    /// Resume checkpointed sessions left behind by a previous process.
    ///
    /// Terminal leftovers (a delete that raced the shutdown) are dropped.
    /// A session caught mid-leave gets its bot leave re-issued instead of
    /// a live actor; there is nothing left to serve for it. Returns the
    /// number of sessions brought back.
    pub async fn recover(&self) -> anyhow::Result<usize> {
        let store = self.runtime.store.clone();
        let snapshots = tokio::task::spawn_blocking(move || store.list())
            .await
            .context("Checkpoint recovery task panicked")??;

        let mut resumed = 0usize;
        for snapshot in snapshots {
            let meeting_id = snapshot.info.meeting_id.clone();
            let status = snapshot.info.status;

            if status.is_terminal() {
                debug!(
                    "Dropping stale checkpoint for {} meeting {}",
                    status.as_str(),
                    meeting_id
                );
                self.drop_checkpoint(&meeting_id);
                continue;
            }

            if status == SessionStatus::Ending {
                info!("Re-issuing interrupted leave for meeting {}", meeting_id);
                let platform = self.runtime.platform.clone();
                let bot_id = snapshot.info.bot_id.clone();
                tokio::spawn(async move {
                    if let Err(e) = platform.request_leave(&bot_id).await {
                        warn!("Leave re-issue failed for bot {}: {}", bot_id, e);
                    }
                });
                self.drop_checkpoint(&meeting_id);
                continue;
            }

            let handle = SessionMachine::resume(snapshot, self.runtime.clone());
            self.sessions
                .lock()
                .await
                .insert(meeting_id.clone(), handle);
            info!(
                "Resumed {} session {} from checkpoint",
                status.as_str(),
                meeting_id
            );
            resumed += 1;
        }
        Ok(resumed)
    }

    fn drop_checkpoint(&self, meeting_id: &str) {
        let store = self.runtime.store.clone();
        let meeting_id = meeting_id.to_string();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = store.delete(&meeting_id) {
                warn!("Failed to drop checkpoint for meeting {}: {}", meeting_id, e);
            }
        });
    }

    /// Live platform-side status code for a session's bot, best effort.
    /// A provider failure degrades to `None` rather than failing the
    /// whole status query.
    pub async fn bot_status(&self, meeting_id: &str) -> Result<Option<String>, SessionError> {
        let handle = self.get(meeting_id).await?;
        let bot_id = handle.info().bot_id;
        match self.runtime.platform.bot_status(&bot_id).await {
            Ok(code) => Ok(code),
            Err(e) => {
                warn!(
                    "Bot status lookup failed for meeting {}: {}",
                    meeting_id, e
                );
                Ok(None)
            }
        }
    }

    pub async fn get(&self, meeting_id: &str) -> Result<SessionHandle, SessionError> {
        self.sessions
            .lock()
            .await
            .get(meeting_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(meeting_id.to_string()))
    }

    pub async fn remove(&self, meeting_id: &str) -> Option<SessionHandle> {
        self.sessions.lock().await.remove(meeting_id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    pub async fn meeting_ids(&self) -> Vec<String> {
        self.sessions.lock().await.keys().cloned().collect()
    }

    fn spawn_terminal_listener(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<String>) {
        let registry = Arc::downgrade(&self);
        drop(self);
        tokio::spawn(async move {
            while let Some(meeting_id) = rx.recv().await {
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                if registry.remove(&meeting_id).await.is_some() {
                    debug!("Session {} removed from registry", meeting_id);
                }
            }
        });
    }

    fn spawn_idle_sweeper(self: Arc<Self>) {
        let sweep_interval = Duration::from_secs(self.runtime.session.idle_sweep_seconds.max(1));
        let idle_timeout = chrono::Duration::seconds(self.runtime.session.idle_timeout_seconds as i64);
        let registry = Arc::downgrade(&self);
        drop(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let handles: Vec<SessionHandle> = registry
                    .sessions
                    .lock()
                    .await
                    .values()
                    .cloned()
                    .collect();
                let now = Utc::now();
                for handle in handles {
                    let session_info = handle.info();
                    if !session_info.status.is_terminal()
                        && now - session_info.last_activity > idle_timeout
                    {
                        info!(
                            "Session {} idle for over {}s; ending",
                            session_info.meeting_id,
                            idle_timeout.num_seconds()
                        );
                        handle.force_end("IdleTimeout");
                    }
                }
            }
        });
    }
}
