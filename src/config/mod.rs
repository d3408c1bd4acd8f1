use crate::global;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub recall: RecallConfig,
    pub openai: OpenAiConfig,
    pub briefing: BriefingConfig,
    pub speech: SpeechConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Public base URL the bot platform uses to reach our transcript
    /// callback endpoint, e.g. "https://convene.example.com".
    pub callback_base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecallConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub default_bot_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BriefingConfig {
    /// Timeout for one summarization call, in seconds.
    pub call_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    /// Quiet interval with no new final utterance before the bot speaks.
    pub quiet_interval_ms: u64,
    /// Upper bound on waiting for a pause; the bot speaks anyway after this.
    pub max_pause_wait_ms: u64,
    /// Timeout for one composition call, in seconds.
    pub call_timeout_seconds: u64,
    /// Character budget of transcript context handed to composition.
    pub context_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long to wait for the bot platform to confirm leaving.
    pub leave_timeout_seconds: u64,
    /// Sessions with no activity for this long are force-ended.
    pub idle_timeout_seconds: u64,
    /// Sweep interval for the idle checker.
    pub idle_sweep_seconds: u64,
    /// Retry budget for transient collaborator failures.
    pub retry_attempts: u32,
    /// Base delay for exponential backoff, in milliseconds.
    pub retry_base_delay_ms: u64,
    /// Timeout for bot platform calls (dispatch/speak/leave), in seconds.
    pub platform_timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3990,
            callback_base_url: "http://127.0.0.1:3990".to_string(),
        }
    }
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://us-west-2.recall.ai/api/v1".to_string(),
            default_bot_name: "AI Meeting Assistant".to_string(),
        }
    }
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
        }
    }
}

impl Default for BriefingConfig {
    fn default() -> Self {
        Self {
            call_timeout_seconds: 30,
        }
    }
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            quiet_interval_ms: 2000,
            max_pause_wait_ms: 30_000,
            call_timeout_seconds: 30,
            context_chars: 2000,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            leave_timeout_seconds: 15,
            idle_timeout_seconds: 4 * 3600,
            idle_sweep_seconds: 60,
            retry_attempts: 3,
            retry_base_delay_ms: 500,
            platform_timeout_seconds: 30,
        }
    }
}

impl SpeechConfig {
    pub fn quiet_interval(&self) -> Duration {
        Duration::from_millis(self.quiet_interval_ms)
    }

    pub fn max_pause_wait(&self) -> Duration {
        Duration::from_millis(self.max_pause_wait_ms)
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        if !config_path.exists() {
            info!(
                "Config file not found, creating default at {:?}",
                config_path
            );
            let config = Self::default().with_env_overrides();
            config.save()?;
            return Ok(config);
        }

        let content =
            std::fs::read_to_string(&config_path).context("Failed to read config file")?;

        let config: Self = toml::from_str(&content).context("Failed to parse config file")?;

        info!("Loaded config from {:?}", config_path);
        Ok(config.with_env_overrides())
    }

    /// API keys can come from the environment instead of the config file,
    /// so secrets never have to live on disk.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(key) = std::env::var("RECALL_API_KEY") {
            self.recall.api_key = Some(key);
        }
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            self.openai.api_key = Some(key);
        }
        self
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, content).context("Failed to write config file")?;

        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        global::config_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 3990);
        assert_eq!(config.speech.quiet_interval_ms, 2000);
        assert_eq!(config.speech.max_pause_wait_ms, 30_000);
        assert_eq!(config.session.retry_attempts, 3);
        assert!(config.recall.api_key.is_none());
    }

    #[test]
    fn test_config_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 8080

            [speech]
            quiet_interval_ms = 1500
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.speech.quiet_interval_ms, 1500);
        // Untouched sections keep their defaults
        assert_eq!(config.session.leave_timeout_seconds, 15);
        assert_eq!(config.openai.model, "gpt-4o-mini");
    }

    #[test]
    fn test_speech_durations() {
        let config = SpeechConfig::default();
        assert_eq!(config.quiet_interval(), Duration::from_secs(2));
        assert_eq!(config.max_pause_wait(), Duration::from_secs(30));
    }
}
