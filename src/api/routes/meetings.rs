//! Meeting session API endpoints.
//!
//! Provides HTTP endpoints for:
//! - Sending the bot into a meeting (POST /meetings/join)
//! - Getting the current briefing (GET /meetings/:id/brief)
//! - Queueing a spoken answer (POST /meetings/:id/ask)
//! - Cancelling a queued answer (DELETE /meetings/:id/ask/:request_id)
//! - Getting session status (GET /meetings/:id/status)
//! - Making the bot leave (POST /meetings/:id/leave)

use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{delete, get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use crate::api::error::{ApiError, ApiResult};
use crate::session::SessionRegistry;

pub fn router(registry: Arc<SessionRegistry>) -> Router {
    Router::new()
        .route("/meetings/join", post(join_meeting))
        .route("/meetings/:id/brief", get(get_brief))
        .route("/meetings/:id/ask", post(ask_question))
        .route("/meetings/:id/ask/:request_id", delete(cancel_question))
        .route("/meetings/:id/status", get(meeting_status))
        .route("/meetings/:id/leave", post(leave_meeting))
        .with_state(registry)
}

#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    pub meeting_url: String,
    pub user_id: String,
    pub bot_name: Option<String>,
}

async fn join_meeting(
    State(registry): State<Arc<SessionRegistry>>,
    Json(request): Json<JoinRequest>,
) -> ApiResult<Json<Value>> {
    if request.user_id.trim().is_empty() {
        return Err(ApiError::bad_request("user_id must not be empty"));
    }

    let handle = registry
        .create(&request.meeting_url, &request.user_id, request.bot_name)
        .await?;
    let info = handle.info();

    info!(
        "Meeting {} joined via API for user {}",
        info.meeting_id, info.user_id
    );

    Ok(Json(json!({
        "meeting_id": info.meeting_id,
        "status": info.status.as_str(),
        "platform": info.platform.as_str(),
        "bot_id": info.bot_id,
        "bot_name": info.bot_name,
        "user_id": info.user_id,
        "joined_at": info.created_at,
    })))
}

#[derive(Debug, Default, Deserialize)]
struct BriefParams {
    #[serde(default)]
    force: bool,
}

async fn get_brief(
    Path(meeting_id): Path<String>,
    Query(params): Query<BriefParams>,
    State(registry): State<Arc<SessionRegistry>>,
) -> ApiResult<Json<Value>> {
    let handle = registry.get(&meeting_id).await?;
    let briefing = handle.briefing(params.force).await?;
    let info = handle.info();

    Ok(Json(json!({
        "meeting_id": meeting_id,
        "brief": briefing.summary,
        "key_points": briefing.key_points,
        "speakers": briefing.speakers,
        "duration_minutes": info.duration_minutes(),
        "stale": briefing.stale,
        "last_updated": briefing.generated_at,
    })))
}

#[derive(Debug, Deserialize)]
pub struct AskRequest {
    pub question: String,
    #[serde(default)]
    pub wait_for_pause: bool,
}

async fn ask_question(
    Path(meeting_id): Path<String>,
    State(registry): State<Arc<SessionRegistry>>,
    Json(request): Json<AskRequest>,
) -> ApiResult<Json<Value>> {
    if request.question.trim().is_empty() {
        return Err(ApiError::bad_request("question must not be empty"));
    }

    let handle = registry.get(&meeting_id).await?;
    let speech = handle
        .submit_question(request.question, request.wait_for_pause)
        .await?;

    Ok(Json(json!({
        "meeting_id": meeting_id,
        "request_id": speech.id,
        "status": speech.status.as_str(),
        "question_text": speech.question,
        "wait_for_pause": speech.wait_for_pause,
        "requested_at": speech.requested_at,
    })))
}

async fn cancel_question(
    Path((meeting_id, request_id)): Path<(String, String)>,
    State(registry): State<Arc<SessionRegistry>>,
) -> ApiResult<Json<Value>> {
    let handle = registry.get(&meeting_id).await?;
    let cancelled = handle.cancel_question(&request_id).await?;

    Ok(Json(json!({
        "meeting_id": meeting_id,
        "request_id": cancelled.id,
        "status": cancelled.status.as_str(),
    })))
}

async fn meeting_status(
    Path(meeting_id): Path<String>,
    State(registry): State<Arc<SessionRegistry>>,
) -> ApiResult<Json<Value>> {
    let handle = registry.get(&meeting_id).await?;
    let summary = handle.status().await?;
    let bot_status = registry.bot_status(&meeting_id).await?;

    Ok(Json(json!({
        "meeting_id": meeting_id,
        "status": summary.info.status.as_str(),
        "platform": summary.info.platform.as_str(),
        "bot_id": summary.info.bot_id,
        "bot_status": bot_status,
        "duration_minutes": summary.info.duration_minutes(),
        "has_transcript": summary.utterance_count > 0,
        "utterance_count": summary.utterance_count,
        "high_water_mark": summary.high_water_mark,
        "speech_queue_depth": summary.queue_depth,
        "active_request": summary.active_request.map(|r| json!({
            "request_id": r.id,
            "status": r.status.as_str(),
        })),
        "ended_reason": summary.info.ended_reason,
    })))
}

async fn leave_meeting(
    Path(meeting_id): Path<String>,
    State(registry): State<Arc<SessionRegistry>>,
) -> ApiResult<Json<Value>> {
    let handle = registry.get(&meeting_id).await?;
    handle.request_leave().await?;

    info!("Leave requested via API for meeting {}", meeting_id);

    Ok(Json(json!({
        "meeting_id": meeting_id,
        "status": handle.info().status.as_str(),
        "message": "Bot is leaving the meeting",
    })))
}
