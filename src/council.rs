//! Council deliberation: a panel of personas answers one question in
//! sequence, each seeing the turns before it, with every turn posted to a
//! shared group chat as it lands.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;

use crate::channels::markdown::truncate_str;
use crate::error::{ChannelError, ConfigError, CouncilError};
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::workspace::Workspace;

/// Overall budget for one deliberation across all members.
const DELIBERATION_TIMEOUT: Duration = Duration::from_secs(240);
const POST_MAX_LENGTH: usize = 4096;

const DELIBERATION_RULES: &str = "DELIBERATION INSTRUCTIONS:\n\
    - Answer in at most 200 words.\n\
    - Be direct and concise. Do not repeat what others have already said.\n\
    - Contribute the unique perspective of your role.";

/// Council section of the configuration, usually loaded from council.json.
#[derive(Debug, Clone, Deserialize)]
pub struct CouncilConfig {
    pub group_chat_id: String,
    pub members: Vec<CouncilMemberConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CouncilMemberConfig {
    pub name: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Personality file stem under `council/` in the workspace.
    pub personality: String,
}

impl CouncilConfig {
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(ConfigError::Io)?;
        serde_json::from_str(&raw).map_err(|e| ConfigError::ParseError {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }
}

/// A council member, immutable once loaded.
#[derive(Debug, Clone)]
pub struct Persona {
    pub name: String,
    pub model: String,
    pub instructions: String,
}

/// One persona's entry in the deliberation transcript.
#[derive(Debug, Clone)]
pub struct DeliberationTurn {
    pub name: String,
    pub response: String,
}

/// Transcript of a deliberation, in speaking order. `timed_out` marks a
/// deliberation cut short by the overall deadline.
#[derive(Debug, Clone, Default)]
pub struct DeliberationOutcome {
    pub turns: Vec<DeliberationTurn>,
    pub timed_out: bool,
}

/// Posts one deliberation turn to the shared chat, falling back to the
/// plain form when the HTML form is rejected.
#[async_trait]
pub trait CouncilPoster: Send + Sync {
    async fn post_turn(&self, chat_id: i64, html: &str, plain: &str) -> Result<(), ChannelError>;
}

pub struct Council {
    members: Vec<Persona>,
    group_chat_id: i64,
    provider: Arc<dyn LlmProvider>,
    poster: Arc<dyn CouncilPoster>,
}

impl Council {
    /// Build the council from config, loading each member's personality
    /// from `council/{personality}.md` in the workspace. Members whose
    /// personality cannot be read are skipped.
    pub async fn new(
        config: CouncilConfig,
        workspace: &Workspace,
        provider: Arc<dyn LlmProvider>,
        poster: Arc<dyn CouncilPoster>,
        default_model: &str,
    ) -> Result<Self, CouncilError> {
        let group_chat_id = config
            .group_chat_id
            .trim()
            .parse::<i64>()
            .map_err(|_| CouncilError::InvalidGroupId(config.group_chat_id.clone()))?;

        let mut members = Vec::with_capacity(config.members.len());
        for member in &config.members {
            let path = format!("council/{}.md", member.personality);
            let instructions = match workspace.read(&path).await {
                Ok(text) => text,
                Err(err) => {
                    tracing::error!("Skipping council member {}: {err}", member.name);
                    continue;
                }
            };
            let model = member
                .model
                .clone()
                .unwrap_or_else(|| default_model.to_string());
            members.push(Persona {
                name: member.name.clone(),
                model,
                instructions,
            });
        }

        if members.is_empty() {
            return Err(CouncilError::Empty);
        }

        tracing::info!("Council initialized with {} members", members.len());
        Ok(Self {
            members,
            group_chat_id,
            provider,
            poster,
        })
    }

    pub fn members(&self) -> &[Persona] {
        &self.members
    }

    /// Run one deliberation: fold over the members in order, feeding each
    /// the question plus all prior turns. A failed member contributes an
    /// error placeholder and the fold continues; hitting the overall
    /// deadline stops the fold and returns the partial transcript.
    pub async fn deliberate(&self, question: &str) -> DeliberationOutcome {
        let run_id = Uuid::new_v4();
        tracing::info!(
            "Council deliberation {run_id} started with {} members",
            self.members.len()
        );

        let deadline = tokio::time::Instant::now() + DELIBERATION_TIMEOUT;
        let mut turns: Vec<DeliberationTurn> = Vec::new();
        let mut timed_out = false;

        for persona in &self.members {
            if tokio::time::Instant::now() >= deadline {
                timed_out = true;
                break;
            }

            let request = self.member_request(persona, question, &turns);
            match tokio::time::timeout_at(deadline, self.provider.complete(request)).await {
                Ok(Ok(response)) => {
                    let content = response.content.trim().to_string();
                    turns.push(DeliberationTurn {
                        name: persona.name.clone(),
                        response: content.clone(),
                    });
                    self.publish_turn(persona, &content).await;
                }
                Ok(Err(err)) => {
                    tracing::error!("Council member {} failed: {err}", persona.name);
                    turns.push(DeliberationTurn {
                        name: persona.name.clone(),
                        response: format!("[Error: {err}]"),
                    });
                }
                Err(_) => {
                    tracing::warn!(
                        "Council deliberation {run_id} hit its deadline during {}",
                        persona.name
                    );
                    timed_out = true;
                    break;
                }
            }
        }

        tracing::info!(
            "Council deliberation {run_id} finished: {} turns, timed_out={timed_out}",
            turns.len()
        );
        DeliberationOutcome { turns, timed_out }
    }

    fn member_request(
        &self,
        persona: &Persona,
        question: &str,
        turns: &[DeliberationTurn],
    ) -> CompletionRequest {
        let system = format!("{}\n\n{DELIBERATION_RULES}", persona.instructions);

        let mut user = format!("QUESTION: {question}");
        if !turns.is_empty() {
            user.push_str("\n\nPREVIOUS RESPONSES:");
            for turn in turns {
                user.push_str(&format!("\n\n**{}**:\n{}", turn.name, turn.response));
            }
        }

        CompletionRequest::new(
            &persona.model,
            vec![ChatMessage::system(system), ChatMessage::user(user)],
        )
    }

    /// Post one turn to the group chat. Failures are logged and do not
    /// interrupt the deliberation.
    async fn publish_turn(&self, persona: &Persona, content: &str) {
        let html = clip_post(format!("<b>{}</b>\n\n{content}", persona.name));
        let plain = clip_post(format!("{}\n\n{content}", persona.name));
        if let Err(err) = self
            .poster
            .post_turn(self.group_chat_id, &html, &plain)
            .await
        {
            tracing::error!("Failed to post council turn for {}: {err}", persona.name);
        }
    }
}

/// Keep a post within Telegram's message limit, marking the cut.
fn clip_post(text: String) -> String {
    if text.len() > POST_MAX_LENGTH {
        format!("{}...", truncate_str(&text, POST_MAX_LENGTH - 3))
    } else {
        text
    }
}
