//! Workspace file reader tool.

use std::path::{Component, Path};

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::channels::markdown::truncate_str;
use crate::error::ToolError;
use crate::tools::tool::{Tool, require_str};
use crate::workspace::Workspace;

/// Clamp so one read cannot flood the model context.
const MAX_READ_CHARS: usize = 50_000;

/// Reads files from the agent workspace. Paths are relative to the
/// workspace root; absolute paths and parent traversal are rejected.
pub struct ReadFileTool {
    workspace: Workspace,
}

impl ReadFileTool {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file from the agent workspace by relative path, for example \
         MEMORY.md or skills/weather/SKILL.md."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path relative to the workspace root"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, ToolError> {
        let path = require_str(&args, "path", self.name())?;

        let candidate = Path::new(path);
        if candidate.is_absolute()
            || candidate
                .components()
                .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(ToolError::InvalidParameters {
                name: self.name().to_string(),
                reason: format!("path must stay inside the workspace: {path}"),
            });
        }

        let content =
            self.workspace
                .read(path)
                .await
                .map_err(|e| ToolError::ExecutionFailed {
                    name: self.name().to_string(),
                    reason: e.to_string(),
                })?;

        if content.len() > MAX_READ_CHARS {
            Ok(format!(
                "{}\n\n[... truncated, file too long ...]",
                truncate_str(&content, MAX_READ_CHARS)
            ))
        } else {
            Ok(content)
        }
    }
}
