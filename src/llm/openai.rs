//! OpenAI-compatible chat-completions client.
//!
//! Talks to any endpoint exposing `/chat/completions`: OpenAI, OpenRouter,
//! Groq, Ollama, vLLM. The model is taken from each request, so one client
//! serves callers with different model assignments.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, LlmProvider, Role, ToolCall, ToolSpec,
};

/// HTTP timeout for one completion request.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

/// An OpenAI-compatible LLM provider.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: SecretString,
    default_model: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: SecretString,
        default_model: impl Into<String>,
    ) -> Result<Self, LlmError> {
        let name = name.into();
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: name.clone(),
                reason: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            name,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            default_model: default_model.into(),
            client,
        })
    }

    fn to_wire_messages(messages: &[ChatMessage]) -> Vec<WireMessage> {
        messages
            .iter()
            .map(|m| WireMessage {
                role: match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::Tool => "tool",
                }
                .to_string(),
                // Multimodal parts replace the flat string on the wire.
                content: if m.parts.is_empty() {
                    serde_json::Value::String(m.content.clone())
                } else {
                    serde_json::to_value(&m.parts).unwrap_or_default()
                },
                tool_calls: if m.tool_calls.is_empty() {
                    None
                } else {
                    Some(m.tool_calls.iter().map(WireToolCall::from).collect())
                },
                tool_call_id: m.tool_call_id.clone(),
            })
            .collect()
    }

    fn to_wire_tools(tools: &[ToolSpec]) -> Vec<serde_json::Value> {
        tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    },
                })
            })
            .collect()
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model_name(&self) -> &str {
        &self.default_model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_wire_messages(&request.messages),
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_wire_tools(&request.tools));
        }

        debug!(provider = %self.name, model = %request.model, "Sending completion request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key.expose_secret()))
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: self.name.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(std::time::Duration::from_secs);
            return Err(LlmError::RateLimited {
                provider: self.name.clone(),
                retry_after,
            });
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(LlmError::AuthFailed {
                provider: self.name.clone(),
            });
        }
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            warn!(provider = %self.name, status = status.as_u16(), body = %error_body,
                "Provider returned error");
            return Err(LlmError::RequestFailed {
                provider: self.name.clone(),
                reason: format!("HTTP {}: {}", status.as_u16(), error_body),
            });
        }

        let api_response: ApiResponse =
            response
                .json()
                .await
                .map_err(|e| LlmError::InvalidResponse {
                    provider: self.name.clone(),
                    reason: format!("Failed to parse response: {}", e),
                })?;

        let choice =
            api_response
                .choices
                .into_iter()
                .next()
                .ok_or_else(|| LlmError::InvalidResponse {
                    provider: self.name.clone(),
                    reason: "No choices in response".to_string(),
                })?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments: tc.function.arguments,
            })
            .collect();

        Ok(CompletionResponse {
            content: choice.message.content.unwrap_or_default(),
            tool_calls,
        })
    }
}

// ── Wire types ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    r#type: String,
    function: WireFunction,
}

impl From<&ToolCall> for WireToolCall {
    fn from(tc: &ToolCall) -> Self {
        Self {
            id: tc.id.clone(),
            r#type: "function".to_string(),
            function: WireFunction {
                name: tc.name.clone(),
                arguments: tc.arguments.clone(),
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ApiChoiceMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::ContentPart;

    fn provider() -> OpenAiCompatProvider {
        OpenAiCompatProvider::new(
            "test",
            "https://api.example.com/v1/",
            SecretString::from("sk-test"),
            "test-model",
        )
        .unwrap()
    }

    #[test]
    fn base_url_trailing_slash_trimmed() {
        assert_eq!(provider().base_url, "https://api.example.com/v1");
    }

    #[test]
    fn plain_message_serializes_string_content() {
        let wire = OpenAiCompatProvider::to_wire_messages(&[ChatMessage::user("hello")]);
        let json = serde_json::to_value(&wire[0]).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"], "hello");
        assert!(json.get("tool_calls").is_none());
    }

    #[test]
    fn multimodal_message_serializes_part_array() {
        let msg = ChatMessage::user_with_parts(
            "look",
            vec![
                ContentPart::text("look"),
                ContentPart::image("data:image/jpeg;base64,xx"),
            ],
        );
        let wire = OpenAiCompatProvider::to_wire_messages(&[msg]);
        let json = serde_json::to_value(&wire[0]).unwrap();
        assert!(json["content"].is_array());
        assert_eq!(json["content"][0]["type"], "text");
        assert_eq!(json["content"][1]["type"], "image_url");
        assert_eq!(json["content"][1]["image_url"]["url"], "data:image/jpeg;base64,xx");
    }

    #[test]
    fn tool_messages_carry_call_id_on_wire() {
        let wire =
            OpenAiCompatProvider::to_wire_messages(&[ChatMessage::tool_result("call_9", "done")]);
        let json = serde_json::to_value(&wire[0]).unwrap();
        assert_eq!(json["role"], "tool");
        assert_eq!(json["tool_call_id"], "call_9");
    }

    #[test]
    fn assistant_tool_calls_use_function_envelope() {
        let msg = ChatMessage::assistant_with_tools(
            "",
            vec![ToolCall {
                id: "call_1".into(),
                name: "council".into(),
                arguments: r#"{"question":"?"}"#.into(),
            }],
        );
        let wire = OpenAiCompatProvider::to_wire_messages(&[msg]);
        let json = serde_json::to_value(&wire[0]).unwrap();
        assert_eq!(json["tool_calls"][0]["type"], "function");
        assert_eq!(json["tool_calls"][0]["function"]["name"], "council");
    }

    #[test]
    fn parses_response_with_tool_calls() {
        let raw = r#"{
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_a",
                        "type": "function",
                        "function": {"name": "council", "arguments": "{}"}
                    }]
                }
            }]
        }"#;
        let parsed: ApiResponse = serde_json::from_str(raw).unwrap();
        let msg = &parsed.choices[0].message;
        assert!(msg.content.is_none());
        assert_eq!(msg.tool_calls.as_ref().unwrap()[0].function.name, "council");
    }

    #[test]
    fn tool_spec_wire_shape() {
        let tools = OpenAiCompatProvider::to_wire_tools(&[ToolSpec {
            name: "council".into(),
            description: "Ask the council".into(),
            parameters: serde_json::json!({"type": "object"}),
        }]);
        assert_eq!(tools[0]["type"], "function");
        assert_eq!(tools[0]["function"]["name"], "council");
    }
}
