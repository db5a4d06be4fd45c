//! The `Tool` trait: an LLM-callable capability.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ToolError;

/// An LLM-callable capability. Implementations are registered once during
/// startup wiring and shared behind `Arc`.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Name the provider invokes the tool by.
    fn name(&self) -> &str;

    /// One-line description shown to the model.
    fn description(&self) -> &str;

    /// JSON schema of the tool's parameters.
    fn parameters(&self) -> Value;

    /// Run with the provider-supplied arguments, returning the text fed
    /// back to the model as the tool result.
    async fn execute(&self, args: Value) -> Result<String, ToolError>;
}

/// Extract a required non-empty string argument.
pub fn require_str<'a>(args: &'a Value, key: &str, tool: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ToolError::InvalidParameters {
            name: tool.to_string(),
            reason: format!("{key} is required"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn require_str_accepts_nonempty() {
        let args = json!({"question": "  why?  "});
        assert_eq!(require_str(&args, "question", "t").unwrap(), "why?");
    }

    #[test]
    fn require_str_rejects_missing_empty_and_wrong_type() {
        for args in [json!({}), json!({"question": "   "}), json!({"question": 7})] {
            let err = require_str(&args, "question", "council").unwrap_err();
            assert!(matches!(err, ToolError::InvalidParameters { .. }));
        }
    }
}
