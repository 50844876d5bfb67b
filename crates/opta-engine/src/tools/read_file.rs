use std::time::Instant;

use async_trait::async_trait;

use opta_core::tools::{Tool, ToolContext, ToolError, ToolResult};

use super::resolve_path;

const MAX_LINE_CHARS: usize = 2000;

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file, optionally a window of lines"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["path"],
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path, absolute or relative to the working directory"
                },
                "offset": {
                    "type": "integer",
                    "description": "Line number to start reading from (1-based)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to read"
                }
            }
        })
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
        let path = resolve_path(file_path, &ctx.working_directory);

        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            ToolError::ExecutionFailed(format!("failed to read {}: {e}", path.display()))
        })?;

        let offset = args["offset"].as_u64().unwrap_or(1).max(1) as usize;
        let limit = args["limit"].as_u64().unwrap_or(2000) as usize;

        let lines: Vec<&str> = content.lines().collect();
        let start_idx = (offset - 1).min(lines.len());
        let end_idx = start_idx.saturating_add(limit).min(lines.len());

        let mut output = String::new();
        for (i, line) in lines[start_idx..end_idx].iter().enumerate() {
            let shown: String = line.chars().take(MAX_LINE_CHARS).collect();
            output.push_str(&format!("{:>6}\t{}\n", start_idx + i + 1, shown));
        }
        if output.is_empty() {
            output = "(empty file)".to_string();
        }

        Ok(ToolResult {
            content: output,
            is_error: false,
            duration: start.elapsed(),
        })
    }
}
