//! System-prompt and provider-input assembly.
//!
//! The system prompt is a deterministic concatenation, in fixed order:
//! identity block, tool capability summary, bootstrap documents, skills
//! summary, memory summary. Section order is a contract relied on by the
//! bootstrap documents (later sections refine earlier ones), so tests
//! assert on it.

use std::sync::Arc;

use async_trait::async_trait;

use crate::agent::history::sanitize;
use crate::llm::{ChatMessage, ContentPart};
use crate::workspace::Workspace;

/// Separator between prompt sections and appended footers.
pub const SECTION_SEPARATOR: &str = "\n\n---\n\n";

/// Heading of the dynamic tool-capability section.
pub const TOOLS_HEADING: &str = "## Available Tools";

/// Media references with this prefix become image parts of the user
/// message; everything else is left to the caller to expand into text.
const IMAGE_DATA_PREFIX: &str = "data:image/";

/// A collaborator that can summarize itself as prompt text. An empty
/// summary omits the corresponding section entirely.
#[async_trait]
pub trait SummaryProvider: Send + Sync {
    async fn summarize(&self) -> String;
}

/// Skills summary sourced from the workspace skills directory.
pub struct WorkspaceSkills(pub Workspace);

#[async_trait]
impl SummaryProvider for WorkspaceSkills {
    async fn summarize(&self) -> String {
        self.0.skills_summary().await
    }
}

/// Memory summary sourced from the workspace MEMORY.md.
pub struct WorkspaceMemory(pub Workspace);

#[async_trait]
impl SummaryProvider for WorkspaceMemory {
    async fn summarize(&self) -> String {
        self.0.memory_summary().await
    }
}

/// Builds system prompts and full provider message sequences.
pub struct PromptAssembler {
    workspace: Workspace,
    capabilities: Option<Arc<dyn SummaryProvider>>,
    skills: Option<Arc<dyn SummaryProvider>>,
    memory: Option<Arc<dyn SummaryProvider>>,
}

impl PromptAssembler {
    pub fn new(workspace: Workspace) -> Self {
        Self {
            workspace,
            capabilities: None,
            skills: None,
            memory: None,
        }
    }

    /// Attach the tool-capability provider queried at prompt-build time.
    pub fn with_capabilities(mut self, provider: Arc<dyn SummaryProvider>) -> Self {
        self.capabilities = Some(provider);
        self
    }

    pub fn with_skills(mut self, provider: Arc<dyn SummaryProvider>) -> Self {
        self.skills = Some(provider);
        self
    }

    pub fn with_memory(mut self, provider: Arc<dyn SummaryProvider>) -> Self {
        self.memory = Some(provider);
        self
    }

    /// Assemble the system prompt for the given active model.
    pub async fn build_system_prompt(&self, model: &str) -> String {
        let mut sections = vec![self.identity_section(model)];

        if let Some(provider) = &self.capabilities {
            let summary = provider.summarize().await;
            if !summary.is_empty() {
                sections.push(format!(
                    "{}\n\n{}\n\nWhen a request calls for action, use the matching tool. \
                     Never claim something is impossible without checking the tools first.",
                    TOOLS_HEADING, summary
                ));
            }
        }

        for doc in self.workspace.bootstrap_documents().await {
            sections.push(format!("## {}\n\n{}", doc.name, doc.content.trim()));
        }

        if let Some(provider) = &self.skills {
            let summary = provider.summarize().await;
            if !summary.is_empty() {
                sections.push(format!("## Skills\n\n{}", summary));
            }
        }

        if let Some(provider) = &self.memory {
            let summary = provider.summarize().await;
            if !summary.is_empty() {
                sections.push(format!("## Memory\n\n{}", summary));
            }
        }

        sections.join(SECTION_SEPARATOR)
    }

    /// Assemble the full provider input: system message (with session and
    /// summary footers), sanitized history, then the current user message
    /// with any image media attached as multimodal parts.
    #[allow(clippy::too_many_arguments)]
    pub async fn build_messages(
        &self,
        model: &str,
        history: &[ChatMessage],
        summary: Option<&str>,
        current_text: &str,
        media: &[String],
        channel: &str,
        chat_id: &str,
    ) -> Vec<ChatMessage> {
        let mut system = self.build_system_prompt(model).await;
        system.push_str(SECTION_SEPARATOR);
        system.push_str(&format!(
            "## Current Session\nChannel: {}\nChat ID: {}",
            channel, chat_id
        ));
        if let Some(summary) = summary.filter(|s| !s.trim().is_empty()) {
            system.push_str(SECTION_SEPARATOR);
            system.push_str(&format!("## Summary of Previous Conversation\n\n{}", summary));
        }

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(system));
        messages.extend(sanitize(history));
        messages.push(Self::user_message(current_text, media));
        messages
    }

    fn identity_section(&self, model: &str) -> String {
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S %Z");
        format!(
            "# emissary\n\nYou are emissary, a personal assistant reachable through chat. \
             You act on the user's behalf: direct, concise, resourceful.\n\n\
             Current time: {}\nModel: {}\nPlatform: {}\nMemory directory: {}\nSkills directory: {}",
            now,
            model,
            std::env::consts::OS,
            self.workspace.memory_dir().display(),
            self.workspace.skills_dir().display(),
        )
    }

    /// The user message for the current turn. Image data references become
    /// ordered multimodal parts after the text; other media kinds are
    /// dropped here (callers pre-expand them into the text).
    fn user_message(current_text: &str, media: &[String]) -> ChatMessage {
        let images: Vec<&String> = media
            .iter()
            .filter(|m| m.starts_with(IMAGE_DATA_PREFIX))
            .collect();

        if images.is_empty() {
            return ChatMessage::user(current_text);
        }

        let mut parts = vec![ContentPart::text(current_text)];
        parts.extend(images.into_iter().map(|url| ContentPart::image(url.clone())));
        ChatMessage::user_with_parts(current_text, parts)
    }
}
