//! REST API server for Convene.
//!
//! Provides HTTP endpoints for:
//! - Meeting join/leave control
//! - Live briefing retrieval
//! - Spoken answer requests and cancellation
//! - Session status
//! - Transcript callback ingestion
//! - WebSocket event streaming

pub mod error;
pub mod routes;

use crate::config::ServerConfig;
use crate::session::SessionRegistry;
use anyhow::Result;
use axum::{response::Json, routing::get, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceBuilder;
use tracing::info;

pub struct ApiServer {
    host: String,
    port: u16,
    registry: Arc<SessionRegistry>,
}

impl ApiServer {
    pub fn new(config: &ServerConfig, registry: Arc<SessionRegistry>) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            registry,
        }
    }

    pub async fn start(self) -> Result<()> {
        let app = Router::new()
            // Root and version endpoints
            .route("/", get(status))
            .route("/version", get(version))
            // Meeting session endpoints
            .merge(routes::meetings::router(self.registry.clone()))
            // Transcript callback and event stream
            .merge(routes::events::router(self.registry))
            .layer(ServiceBuilder::new());

        let listener =
            tokio::net::TcpListener::bind(&format!("{}:{}", self.host, self.port)).await?;

        info!("API server listening on http://{}:{}", self.host, self.port);
        info!("Endpoints:");
        info!("  GET    /                                  - Service info");
        info!("  GET    /version                           - Version info");
        info!("  POST   /meetings/join                     - Send bot into a meeting");
        info!("  GET    /meetings/:id/brief                - Current briefing");
        info!("  POST   /meetings/:id/ask                  - Queue a spoken answer");
        info!("  DELETE /meetings/:id/ask/:request_id      - Cancel a queued answer");
        info!("  GET    /meetings/:id/status               - Session status");
        info!("  POST   /meetings/:id/leave                - Bot leaves the meeting");
        info!("  POST   /meetings/:id/transcript           - Transcript callback");
        info!("  GET    /meetings/:id/events               - WebSocket event stream");

        axum::serve(listener, app).await?;

        Ok(())
    }
}

async fn status() -> Json<Value> {
    Json(json!({
        "service": "convene",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running"
    }))
}

async fn version() -> Json<Value> {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "name": "convene"
    }))
}
