use std::time::Instant;

use async_trait::async_trait;

use opta_core::tools::{Tool, ToolContext, ToolError, ToolResult};

use super::resolve_path;

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file, creating parent directories"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["path", "content"],
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path, absolute or relative to the working directory"
                },
                "content": {
                    "type": "string",
                    "description": "Content to write to the file"
                }
            }
        })
    }

    fn requires_permission(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let start = Instant::now();

        let file_path = args["path"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("path is required".into()))?;
        let content = args["content"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("content is required".into()))?;

        let path = resolve_path(file_path, &ctx.working_directory);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ToolError::ExecutionFailed(format!("failed to create directory: {e}"))
            })?;
        }
        tokio::fs::write(&path, content).await.map_err(|e| {
            ToolError::ExecutionFailed(format!("failed to write {}: {e}", path.display()))
        })?;

        Ok(ToolResult {
            content: format!(
                "Wrote {} bytes ({} lines) to {}",
                content.len(),
                content.lines().count(),
                path.display()
            ),
            is_error: false,
            duration: start.elapsed(),
        })
    }
}
