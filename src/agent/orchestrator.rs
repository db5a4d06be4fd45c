//! Orchestrator: the loop between the channel, the provider, and the tools.
//!
//! Deliberately thin. One inbound message becomes one provider conversation:
//! assembled prompt + sanitized per-sender history + the new user turn. Tool
//! invocations declared by the model are executed and fed back until the
//! model answers in plain text, which goes back out through the channel.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use serde_json::{Value, json};
use tokio::sync::{Mutex, RwLock};

use crate::agent::prompt::PromptAssembler;
use crate::channels::{Channel, IncomingMessage, OutgoingResponse};
use crate::error::Error;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::tools::ToolRegistry;

/// Upper bound on provider/tool round trips for one inbound message. When
/// reached, a final completion without tools forces a plain answer.
const MAX_TOOL_ITERATIONS: usize = 8;

/// Per-sender history cap. Trimming can cut a tool-call block in half;
/// the sanitizer drops the remainder at assembly time.
const MAX_HISTORY_MESSAGES: usize = 40;

pub struct Orchestrator {
    provider: Arc<dyn LlmProvider>,
    assembler: PromptAssembler,
    tools: Arc<ToolRegistry>,
    channel: Arc<dyn Channel>,
    active_model: Arc<RwLock<String>>,
    models: Vec<String>,
    histories: Mutex<HashMap<String, Vec<ChatMessage>>>,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        assembler: PromptAssembler,
        tools: Arc<ToolRegistry>,
        channel: Arc<dyn Channel>,
        active_model: Arc<RwLock<String>>,
        models: Vec<String>,
    ) -> Self {
        Self {
            provider,
            assembler,
            tools,
            channel,
            active_model,
            models,
            histories: Mutex::new(HashMap::new()),
        }
    }

    /// Run until the channel stream ends or Ctrl+C.
    pub async fn run(self) -> Result<(), Error> {
        let mut stream = self.channel.start().await?;
        tracing::info!("{} ready and listening", self.channel.name());

        loop {
            let message = tokio::select! {
                biased;
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Ctrl+C received, shutting down");
                    break;
                }
                msg = stream.next() => {
                    match msg {
                        Some(m) => m,
                        None => {
                            tracing::info!("Channel stream ended, shutting down");
                            break;
                        }
                    }
                }
            };

            match self.handle_message(&message).await {
                Ok(reply) if !reply.is_empty() => {
                    if let Err(e) = self
                        .channel
                        .respond(&message, OutgoingResponse::text(reply))
                        .await
                    {
                        tracing::error!("Failed to respond: {e}");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!("Error handling message: {e}");
                    let _ = self
                        .channel
                        .respond(&message, OutgoingResponse::text(format!("Error: {e}")))
                        .await;
                }
            }
        }

        self.channel.shutdown().await?;
        Ok(())
    }

    /// Process one inbound message to a reply. An empty reply means there
    /// is nothing to send.
    pub async fn handle_message(&self, message: &IncomingMessage) -> Result<String, Error> {
        if let Some(rest) = message.content.trim().strip_prefix("/model") {
            return Ok(self.model_command(rest.trim()).await);
        }

        let model = self.active_model.read().await.clone();
        let chat_id = message.chat_id().unwrap_or(&message.sender_id).to_string();

        let history = {
            let histories = self.histories.lock().await;
            histories.get(&message.sender_id).cloned().unwrap_or_default()
        };

        let mut messages = self
            .assembler
            .build_messages(
                &model,
                &history,
                None,
                &message.content,
                &message.media,
                &message.channel,
                &chat_id,
            )
            .await;

        let specs = self.tools.specs();
        let mut turn: Vec<ChatMessage> = Vec::new();
        let mut reply = String::new();
        let mut exhausted = true;

        for _ in 0..MAX_TOOL_ITERATIONS {
            let request = CompletionRequest::new(&model, messages.clone()).with_tools(specs.clone());
            let response = self.provider.complete(request).await?;

            if response.tool_calls.is_empty() {
                reply = response.content.trim().to_string();
                exhausted = false;
                break;
            }

            let assistant = ChatMessage::assistant_with_tools(
                response.content.clone(),
                response.tool_calls.clone(),
            );
            messages.push(assistant.clone());
            turn.push(assistant);

            for call in &response.tool_calls {
                tracing::info!(tool = %call.name, "Executing tool");
                let result = self.execute_call(&call.name, &call.arguments).await;
                let tool_msg = ChatMessage::tool_result(&call.id, result);
                messages.push(tool_msg.clone());
                turn.push(tool_msg);
            }
        }

        if exhausted {
            // The model was still asking for tools at the limit; take the
            // answer it gives without them.
            tracing::warn!("Tool iteration limit reached, forcing a plain answer");
            let request = CompletionRequest::new(&model, messages);
            let response = self.provider.complete(request).await?;
            reply = response.content.trim().to_string();
        }

        self.remember_turn(&message.sender_id, &message.content, turn, &reply)
            .await;
        Ok(reply)
    }

    /// Execute one declared tool invocation; failures come back as text so
    /// the model can react instead of the whole turn dying.
    async fn execute_call(&self, name: &str, raw_arguments: &str) -> String {
        let parsed = if raw_arguments.trim().is_empty() {
            // Some providers emit an empty string for no-argument calls.
            Ok(json!({}))
        } else {
            serde_json::from_str::<Value>(raw_arguments)
        };

        match parsed {
            Ok(args) => match self.tools.dispatch(name, args).await {
                Ok(output) => output,
                Err(e) => format!("Error: {e}"),
            },
            Err(e) => format!("Error: invalid tool arguments: {e}"),
        }
    }

    async fn model_command(&self, argument: &str) -> String {
        if argument.is_empty() {
            let active = self.active_model.read().await.clone();
            return if self.models.is_empty() {
                format!("Active model: {active}")
            } else {
                format!("Active model: {active}\nAvailable: {}", self.models.join(", "))
            };
        }

        if !self.models.is_empty() && !self.models.iter().any(|m| m == argument) {
            return format!(
                "Unknown model: {argument}\nAvailable: {}",
                self.models.join(", ")
            );
        }

        *self.active_model.write().await = argument.to_string();
        tracing::info!(model = %argument, "Active model switched");
        format!("Model set to: {argument}")
    }

    /// Append the completed turn to the sender's history and trim.
    async fn remember_turn(
        &self,
        sender_id: &str,
        user_content: &str,
        turn: Vec<ChatMessage>,
        reply: &str,
    ) {
        let mut histories = self.histories.lock().await;
        let history = histories.entry(sender_id.to_string()).or_default();
        history.push(ChatMessage::user(user_content));
        history.extend(turn);
        if !reply.is_empty() {
            history.push(ChatMessage::assistant(reply));
        }

        let excess = history.len().saturating_sub(MAX_HISTORY_MESSAGES);
        if excess > 0 {
            history.drain(..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::MessageStream;
    use crate::error::{ChannelError, LlmError, ToolError};
    use crate::llm::{CompletionResponse, Role, ToolCall};
    use crate::tools::Tool;
    use crate::workspace::Workspace;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    struct ScriptedProvider {
        script: Mutex<VecDeque<CompletionResponse>>,
        seen: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedProvider {
        fn new(script: Vec<CompletionResponse>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
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
            self.seen.lock().await.push(request);
            self.script
                .lock()
                .await
                .pop_front()
                .ok_or(LlmError::RequestFailed {
                    provider: "mock".into(),
                    reason: "script exhausted".into(),
                })
        }
    }

    fn text_response(content: &str) -> CompletionResponse {
        CompletionResponse {
            content: content.to_string(),
            tool_calls: Vec::new(),
        }
    }

    fn tool_response(id: &str, name: &str, arguments: &str) -> CompletionResponse {
        CompletionResponse {
            content: String::new(),
            tool_calls: vec![ToolCall {
                id: id.to_string(),
                name: name.to_string(),
                arguments: arguments.to_string(),
            }],
        }
    }

    struct RecordingChannel {
        inbox: Mutex<Option<Vec<IncomingMessage>>>,
        replies: Mutex<Vec<String>>,
        shut_down: AtomicBool,
    }

    impl RecordingChannel {
        fn new(inbox: Vec<IncomingMessage>) -> Self {
            Self {
                inbox: Mutex::new(Some(inbox)),
                replies: Mutex::new(Vec::new()),
                shut_down: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Channel for RecordingChannel {
        fn name(&self) -> &str {
            "test"
        }

        async fn start(&self) -> Result<MessageStream, ChannelError> {
            let inbox = self.inbox.lock().await.take().unwrap_or_default();
            Ok(Box::pin(futures::stream::iter(inbox)))
        }

        async fn respond(
            &self,
            _msg: &IncomingMessage,
            response: OutgoingResponse,
        ) -> Result<(), ChannelError> {
            self.replies.lock().await.push(response.content);
            Ok(())
        }

        async fn health_check(&self) -> Result<(), ChannelError> {
            Ok(())
        }

        async fn shutdown(&self) -> Result<(), ChannelError> {
            self.shut_down.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echo back the input"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }
        async fn execute(&self, args: Value) -> Result<String, ToolError> {
            Ok(format!(
                "echo: {}",
                args.get("text").and_then(Value::as_str).unwrap_or("")
            ))
        }
    }

    struct Fixture {
        orchestrator: Orchestrator,
        provider: Arc<ScriptedProvider>,
        channel: Arc<RecordingChannel>,
        active_model: Arc<RwLock<String>>,
        _dir: TempDir,
    }

    fn fixture(script: Vec<CompletionResponse>, models: Vec<&str>) -> Fixture {
        fixture_with_inbox(script, models, Vec::new())
    }

    fn fixture_with_inbox(
        script: Vec<CompletionResponse>,
        models: Vec<&str>,
        inbox: Vec<IncomingMessage>,
    ) -> Fixture {
        let dir = TempDir::new().unwrap();
        let workspace = Workspace::new(dir.path().to_path_buf());

        let provider = Arc::new(ScriptedProvider::new(script));
        let channel = Arc::new(RecordingChannel::new(inbox));
        let active_model = Arc::new(RwLock::new("m1".to_string()));

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));

        let orchestrator = Orchestrator::new(
            provider.clone(),
            PromptAssembler::new(workspace),
            Arc::new(registry),
            channel.clone(),
            active_model.clone(),
            models.into_iter().map(String::from).collect(),
        );
        Fixture {
            orchestrator,
            provider,
            channel,
            active_model,
            _dir: dir,
        }
    }

    fn incoming(content: &str) -> IncomingMessage {
        IncomingMessage::new("test", "sender-1", content)
            .with_metadata(json!({"chat_id": "42"}))
    }

    #[tokio::test]
    async fn plain_reply_round_trip() {
        let f = fixture(vec![text_response("  hello there  ")], vec![]);
        let reply = f.orchestrator.handle_message(&incoming("hi")).await.unwrap();
        assert_eq!(reply, "hello there");

        // One provider call, carrying system + user.
        let seen = f.provider.seen.lock().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].messages[0].role, Role::System);
        assert_eq!(seen[0].messages.last().unwrap().content, "hi");
        assert_eq!(seen[0].tools.len(), 1);
    }

    #[tokio::test]
    async fn history_carries_between_turns() {
        let f = fixture(
            vec![text_response("first answer"), text_response("second answer")],
            vec![],
        );
        f.orchestrator.handle_message(&incoming("one")).await.unwrap();
        f.orchestrator.handle_message(&incoming("two")).await.unwrap();

        let seen = f.provider.seen.lock().await;
        let second = &seen[1].messages;
        // system, prior user, prior assistant, current user
        assert_eq!(second.len(), 4);
        assert_eq!(second[1].content, "one");
        assert_eq!(second[2].content, "first answer");
        assert_eq!(second[2].role, Role::Assistant);
        assert_eq!(second[3].content, "two");
    }

    #[tokio::test]
    async fn histories_are_per_sender() {
        let f = fixture(
            vec![text_response("a"), text_response("b")],
            vec![],
        );
        f.orchestrator.handle_message(&incoming("from one")).await.unwrap();

        let other = IncomingMessage::new("test", "sender-2", "from two")
            .with_metadata(json!({"chat_id": "43"}));
        f.orchestrator.handle_message(&other).await.unwrap();

        let seen = f.provider.seen.lock().await;
        // The second sender starts fresh: system + their own user turn only.
        assert_eq!(seen[1].messages.len(), 2);
        assert_eq!(seen[1].messages[1].content, "from two");
    }

    #[tokio::test]
    async fn tool_calls_execute_and_feed_back() {
        let f = fixture(
            vec![
                tool_response("call_1", "echo", r#"{"text": "ping"}"#),
                text_response("done"),
            ],
            vec![],
        );
        let reply = f.orchestrator.handle_message(&incoming("run it")).await.unwrap();
        assert_eq!(reply, "done");

        let seen = f.provider.seen.lock().await;
        assert_eq!(seen.len(), 2);
        let followup = &seen[1].messages;
        let tool_msg = followup.iter().find(|m| m.role == Role::Tool).unwrap();
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(tool_msg.content, "echo: ping");
        assert!(followup.iter().any(|m| m.has_tool_calls()));
    }

    #[tokio::test]
    async fn unknown_tool_failure_feeds_back_as_text() {
        let f = fixture(
            vec![
                tool_response("call_1", "ghost", "{}"),
                text_response("recovered"),
            ],
            vec![],
        );
        let reply = f.orchestrator.handle_message(&incoming("go")).await.unwrap();
        assert_eq!(reply, "recovered");

        let seen = f.provider.seen.lock().await;
        let tool_msg = seen[1].messages.iter().find(|m| m.role == Role::Tool).unwrap();
        assert!(tool_msg.content.starts_with("Error:"));
        assert!(tool_msg.content.contains("ghost"));
    }

    #[tokio::test]
    async fn empty_arguments_treated_as_no_arguments() {
        let f = fixture(
            vec![tool_response("call_1", "echo", ""), text_response("ok")],
            vec![],
        );
        f.orchestrator.handle_message(&incoming("go")).await.unwrap();

        let seen = f.provider.seen.lock().await;
        let tool_msg = seen[1].messages.iter().find(|m| m.role == Role::Tool).unwrap();
        assert_eq!(tool_msg.content, "echo: ");
    }

    #[tokio::test]
    async fn iteration_limit_forces_plain_answer() {
        let mut script: Vec<CompletionResponse> = (0..MAX_TOOL_ITERATIONS)
            .map(|i| tool_response(&format!("call_{i}"), "echo", "{}"))
            .collect();
        script.push(text_response("forced answer"));

        let f = fixture(script, vec![]);
        let reply = f.orchestrator.handle_message(&incoming("loop")).await.unwrap();
        assert_eq!(reply, "forced answer");

        let seen = f.provider.seen.lock().await;
        assert_eq!(seen.len(), MAX_TOOL_ITERATIONS + 1);
        // The forcing request withholds the tool declarations.
        assert!(seen.last().unwrap().tools.is_empty());
    }

    #[tokio::test]
    async fn model_switch_updates_shared_state() {
        let f = fixture(vec![], vec!["m1", "m2"]);
        let reply = f.orchestrator.handle_message(&incoming("/model m2")).await.unwrap();
        assert_eq!(reply, "Model set to: m2");
        assert_eq!(*f.active_model.read().await, "m2");
    }

    #[tokio::test]
    async fn unknown_model_is_rejected() {
        let f = fixture(vec![], vec!["m1", "m2"]);
        let reply = f.orchestrator.handle_message(&incoming("/model m9")).await.unwrap();
        assert!(reply.starts_with("Unknown model: m9"));
        assert!(reply.contains("m1, m2"));
        assert_eq!(*f.active_model.read().await, "m1");
    }

    #[tokio::test]
    async fn bare_model_command_lists_models() {
        let f = fixture(vec![], vec!["m1", "m2"]);
        let reply = f.orchestrator.handle_message(&incoming("/model")).await.unwrap();
        assert!(reply.contains("Active model: m1"));
        assert!(reply.contains("m1, m2"));
    }

    #[tokio::test]
    async fn history_is_capped() {
        let script: Vec<CompletionResponse> =
            (0..30).map(|i| text_response(&format!("r{i}"))).collect();
        let f = fixture(script, vec![]);
        for i in 0..30 {
            f.orchestrator
                .handle_message(&incoming(&format!("msg {i}")))
                .await
                .unwrap();
        }

        let histories = f.orchestrator.histories.lock().await;
        assert_eq!(histories.get("sender-1").unwrap().len(), MAX_HISTORY_MESSAGES);
    }

    #[tokio::test]
    async fn run_replies_and_shuts_down_when_stream_ends() {
        let f = fixture_with_inbox(
            vec![text_response("pong")],
            vec![],
            vec![incoming("ping")],
        );
        let channel = f.channel.clone();

        f.orchestrator.run().await.unwrap();

        assert_eq!(*channel.replies.lock().await, vec!["pong".to_string()]);
        assert!(channel.shut_down.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn provider_error_becomes_error_reply() {
        // Empty script: the provider errors with "script exhausted".
        let f = fixture_with_inbox(vec![], vec![], vec![incoming("hi")]);
        let channel = f.channel.clone();

        f.orchestrator.run().await.unwrap();

        let replies = channel.replies.lock().await;
        assert_eq!(replies.len(), 1);
        assert!(replies[0].starts_with("Error:"));
    }
}
