//! Environment-driven configuration.

use std::path::PathBuf;

use secrecy::SecretString;

use crate::error::ConfigError;

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o";
const DEFAULT_TRANSCRIBE_MODEL: &str = "whisper-1";
const DEFAULT_TTS_VOICE: &str = "en-US-AriaNeural";

/// Runtime configuration, read from the environment once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub workspace_path: PathBuf,
    pub openai_api_key: SecretString,
    pub openai_base_url: String,
    /// Default model for the conversation loop and council members
    /// without an override.
    pub model: String,
    /// Models offered by the `/model` menu. Empty means only `model`.
    pub models: Vec<String>,
    pub telegram_bot_token: String,
    pub telegram_allowed_users: Vec<String>,
    pub transcribe_base_url: String,
    pub transcribe_model: String,
    pub tts_voice: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let workspace_path = std::env::var("EMISSARY_WORKSPACE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
                PathBuf::from(home).join(".emissary/workspace")
            });

        let openai_api_key = required("OPENAI_API_KEY")?;
        let openai_base_url = std::env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_OPENAI_BASE_URL.to_string());

        let model =
            std::env::var("EMISSARY_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let models = std::env::var("EMISSARY_MODELS")
            .map(|raw| split_csv(&raw))
            .unwrap_or_default();

        let telegram_bot_token = required("TELEGRAM_BOT_TOKEN")?;
        let telegram_allowed_users = split_csv(
            &std::env::var("TELEGRAM_ALLOWED_USERS").unwrap_or_else(|_| "*".to_string()),
        );

        let transcribe_base_url =
            std::env::var("TRANSCRIBE_BASE_URL").unwrap_or_else(|_| openai_base_url.clone());
        let transcribe_model = std::env::var("TRANSCRIBE_MODEL")
            .unwrap_or_else(|_| DEFAULT_TRANSCRIBE_MODEL.to_string());
        let tts_voice =
            std::env::var("EDGE_TTS_VOICE").unwrap_or_else(|_| DEFAULT_TTS_VOICE.to_string());

        Ok(Self {
            workspace_path,
            openai_api_key: SecretString::from(openai_api_key),
            openai_base_url,
            model,
            models,
            telegram_bot_token,
            telegram_allowed_users,
            transcribe_base_url,
            transcribe_model,
            tts_voice,
        })
    }

    /// Location of the council configuration; its absence disables the
    /// council tool.
    pub fn council_config_path(&self) -> PathBuf {
        self.workspace_path.join("council.json")
    }
}

fn required(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
