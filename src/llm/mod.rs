//! LLM integration for emissary.
//!
//! One provider implementation: an OpenAI-compatible chat-completions
//! client. The same client serves the main conversation loop and the
//! deliberation engine; callers pick the model per request.

pub mod openai;
pub mod provider;

pub use openai::OpenAiCompatProvider;
pub use provider::*;

use std::sync::Arc;

use crate::error::LlmError;

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: secrecy::SecretString,
    pub model: String,
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let provider = OpenAiCompatProvider::new(
        "openai",
        config.base_url.clone(),
        config.api_key.clone(),
        config.model.clone(),
    )?;
    tracing::info!(base_url = %config.base_url, model = %config.model, "Using OpenAI-compatible provider");
    Ok(Arc::new(provider))
}
