//! Council tool: exposes the deliberation engine to the model.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::council::Council;
use crate::error::ToolError;
use crate::tools::tool::{Tool, require_str};

/// Wraps a deliberation run as a callable tool. The engine posts each turn
/// to the group chat itself; the transcript comes back to the model for
/// synthesis.
pub struct CouncilTool {
    council: Arc<Council>,
}

impl CouncilTool {
    pub fn new(council: Arc<Council>) -> Self {
        Self { council }
    }
}

#[async_trait]
impl Tool for CouncilTool {
    fn name(&self) -> &str {
        "council"
    }

    fn description(&self) -> &str {
        "Convene the advisory council to deliberate on a question. Members \
         answer in turn in the shared group chat, each seeing the answers \
         before it. Use it when the user asks for the council or wants \
         multiple perspectives on a decision."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "question": {
                    "type": "string",
                    "description": "The question or topic for the council to deliberate on"
                }
            },
            "required": ["question"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, ToolError> {
        let question = require_str(&args, "question", self.name())?;

        let outcome = self.council.deliberate(question).await;

        let mut report = format!("COUNCIL DELIBERATION\n\nQuestion: {question}\n\n");
        for turn in &outcome.turns {
            report.push_str(&format!("== {} ==\n{}\n\n", turn.name, turn.response));
        }
        if outcome.timed_out {
            report.push_str("The deliberation ran out of time; remaining members were skipped.\n\n");
        }
        report.push_str("Synthesize the perspectives above in your reply to the user.");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::council::{CouncilConfig, CouncilMemberConfig, CouncilPoster};
    use crate::error::{ChannelError, LlmError};
    use crate::llm::{CompletionRequest, CompletionResponse, LlmProvider};
    use crate::workspace::Workspace;
    use tempfile::TempDir;

    struct EchoProvider;

    #[async_trait]
    impl LlmProvider for EchoProvider {
        fn name(&self) -> &str {
            "mock"
        }
        fn model_name(&self) -> &str {
            "mock-model"
        }
        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            Ok(CompletionResponse {
                content: format!("answer from {}", request.model),
                tool_calls: Vec::new(),
            })
        }
    }

    struct NullPoster;

    #[async_trait]
    impl CouncilPoster for NullPoster {
        async fn post_turn(
            &self,
            _chat_id: i64,
            _html: &str,
            _plain: &str,
        ) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    async fn council_tool() -> (TempDir, CouncilTool) {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path().to_path_buf());
        ws.write("council/alpha.md", "You question everything.")
            .await
            .unwrap();

        let config = CouncilConfig {
            group_chat_id: "-42".into(),
            members: vec![CouncilMemberConfig {
                name: "Alpha".into(),
                model: None,
                personality: "alpha".into(),
            }],
        };
        let council = Council::new(
            config,
            &ws,
            Arc::new(EchoProvider),
            Arc::new(NullPoster),
            "base-model",
        )
        .await
        .unwrap();
        (dir, CouncilTool::new(Arc::new(council)))
    }

    #[tokio::test]
    async fn report_carries_question_and_turns() {
        let (_dir, tool) = council_tool().await;
        let report = tool
            .execute(json!({"question": "Ship it?"}))
            .await
            .unwrap();

        assert!(report.starts_with("COUNCIL DELIBERATION\n\nQuestion: Ship it?"));
        assert!(report.contains("== Alpha ==\nanswer from base-model"));
        assert!(report.ends_with("Synthesize the perspectives above in your reply to the user."));
        assert!(!report.contains("ran out of time"));
    }

    #[tokio::test]
    async fn missing_question_is_rejected() {
        let (_dir, tool) = council_tool().await;
        let err = tool.execute(json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters { .. }));
    }

    #[tokio::test]
    async fn schema_requires_question() {
        let (_dir, tool) = council_tool().await;
        assert_eq!(tool.name(), "council");
        assert_eq!(tool.parameters()["required"][0], "question");
    }
}
