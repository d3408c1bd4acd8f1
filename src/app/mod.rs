use crate::api::ApiServer;
use crate::config::Config;
use crate::global;
use crate::providers::{OpenAiModel, RecallBot};
use crate::session::SessionRegistry;
use crate::store::SqliteStore;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

pub async fn run_service() -> Result<()> {
    info!("Starting Convene service");

    let config = Config::load()?;

    let recall_key = config
        .recall
        .api_key
        .clone()
        .context("Recall API key not configured (set [recall].api_key or RECALL_API_KEY)")?;
    let openai_key = config
        .openai
        .api_key
        .clone()
        .context("OpenAI API key not configured (set [openai].api_key or OPENAI_API_KEY)")?;

    let platform = Arc::new(RecallBot::new(config.recall.base_url.clone(), recall_key));
    let model = Arc::new(OpenAiModel::new(
        config.openai.base_url.clone(),
        openai_key,
        config.openai.model.clone(),
    ));
    let store = Arc::new(SqliteStore::open(&global::db_file()?)?);

    let registry = SessionRegistry::new(
        platform,
        model,
        store,
        config.speech.clone(),
        config.briefing.clone(),
        config.session.clone(),
        config.server.callback_base_url.clone(),
        config.recall.default_bot_name.clone(),
    );

    let resumed = registry.recover().await?;
    if resumed > 0 {
        info!("Resumed {} session(s) from checkpoints", resumed);
    }

    let api_server = ApiServer::new(&config.server, registry);

    info!("Convene is ready!");
    info!(
        "Join a meeting: curl -X POST http://{}:{}/meetings/join \\",
        config.server.host, config.server.port
    );
    info!("  -H 'Content-Type: application/json' \\");
    info!("  -d '{{\"meeting_url\": \"https://zoom.us/j/...\", \"user_id\": \"me\"}}'");

    api_server.start().await
}
