//! Transcript ingestion callback and the subscriber event stream.
//!
//! The bot platform posts transcript events to
//! `POST /meetings/:id/transcript`; a `meeting_started` control message
//! on the same endpoint confirms the bot is in the call. Clients watch a
//! session over `GET /meetings/:id/events`, a WebSocket that opens with
//! a snapshot and then relays live events. A subscriber that falls
//! behind the broadcast buffer is resynced with a fresh snapshot rather
//! than disconnected.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::{Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::api::error::ApiResult;
use crate::session::{SessionEvent, SessionRegistry, SessionStatus};
use crate::transcript::Utterance;

pub fn router(registry: Arc<SessionRegistry>) -> Router {
    Router::new()
        .route("/meetings/:id/transcript", post(transcript_callback))
        .route("/meetings/:id/events", get(events_stream))
        .with_state(registry)
}

/// Messages the bot platform posts to the callback endpoint.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
enum CallbackMessage {
    /// Control signal: the bot is in the call.
    MeetingStarted {},
    /// One transcript event.
    Transcript(Utterance),
}

async fn transcript_callback(
    Path(meeting_id): Path<String>,
    State(registry): State<Arc<SessionRegistry>>,
    Json(message): Json<CallbackMessage>,
) -> ApiResult<Json<Value>> {
    let handle = registry.get(&meeting_id).await?;

    match message {
        CallbackMessage::MeetingStarted {} => {
            info!("Meeting {} confirmed started by bot platform", meeting_id);
            handle.confirm_joined()?;
            Ok(Json(json!({ "acknowledged": true })))
        }
        CallbackMessage::Transcript(utterance) => {
            // First transcript event doubles as the joined confirmation
            // when the control message never arrived.
            let status = handle.info().status;
            if status == SessionStatus::Pending || status == SessionStatus::Joining {
                handle.confirm_joined()?;
                handle.wait_until_active().await?;
            }
            let high_water_mark = handle.ingest(utterance).await?;
            Ok(Json(json!({
                "acknowledged": true,
                "high_water_mark": high_water_mark,
            })))
        }
    }
}

async fn events_stream(
    Path(meeting_id): Path<String>,
    State(registry): State<Arc<SessionRegistry>>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let handle = registry.get(&meeting_id).await?;
    Ok(ws.on_upgrade(move |socket| relay_events(socket, meeting_id, handle)))
}

async fn relay_events(
    mut socket: WebSocket,
    meeting_id: String,
    handle: crate::session::SessionHandle,
) {
    let Ok((snapshot, mut rx)) = handle.subscribe().await else {
        debug!("Session {} gone before subscription", meeting_id);
        return;
    };
    if send_event(&mut socket, &snapshot).await.is_err() {
        return;
    }
    info!("Event subscriber connected to meeting {}", meeting_id);

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => {
                    if send_event(&mut socket, &event).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    // Resync a slow subscriber with a fresh snapshot.
                    warn!(
                        "Subscriber to meeting {} lagged by {} events; resyncing",
                        meeting_id, missed
                    );
                    let Ok((snapshot, fresh_rx)) = handle.subscribe().await else {
                        break;
                    };
                    rx = fresh_rx;
                    if send_event(&mut socket, &snapshot).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                // Inbound traffic is ignored; the stream is one-way.
                Some(Ok(_)) => continue,
                _ => break,
            },
        }
    }

    debug!("Event subscriber disconnected from meeting {}", meeting_id);
}

async fn send_event(socket: &mut WebSocket, event: &SessionEvent) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(event).map_err(axum::Error::new)?;
    socket.send(Message::Text(payload)).await
}
