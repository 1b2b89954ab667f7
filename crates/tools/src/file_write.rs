//! File write tool: write or append to files through the path guard.

use crate::path::PathGuard;
use async_trait::async_trait;
use ouroboros_core::error::ToolError;
use ouroboros_core::tool::{DangerLevel, Tool, ToolOutput};
use tokio::io::AsyncWriteExt;

pub struct FileWriteTool {
    guard: PathGuard,
}

impl FileWriteTool {
    /// Create a file write tool with no path restrictions.
    pub fn new() -> Self {
        Self::with_guard(PathGuard::default())
    }

    pub fn with_guard(guard: PathGuard) -> Self {
        Self { guard }
    }
}

impl Default for FileWriteTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for FileWriteTool {
    fn name(&self) -> &str {
        "file_write"
    }

    fn description(&self) -> &str {
        "Write content to a file. Creates the file and parent directories if needed; \
         overwrites by default, or appends with mode=append."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The file path to write to"
                },
                "content": {
                    "type": "string",
                    "description": "The content to write"
                },
                "mode": {
                    "type": "string",
                    "enum": ["overwrite", "append"],
                    "description": "overwrite (default) or append"
                }
            },
            "required": ["path", "content"]
        })
    }

    fn danger_level(&self) -> DangerLevel {
        DangerLevel::Moderate
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let path = arguments["path"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'path' argument".into()))?;
        let content = arguments["content"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'content' argument".into()))?;
        let append = arguments["mode"].as_str() == Some("append");

        let resolved = self
            .guard
            .check(path)
            .map_err(|e| ToolError::PermissionDenied {
                tool_name: "file_write".into(),
                reason: e.to_string(),
            })?;

        if let Some(parent) = resolved.parent()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            return Ok(ToolOutput::failed(format!("Failed to create directory: {e}")));
        }

        let written = if append {
            match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&resolved)
                .await
            {
                Ok(mut file) => match file.write_all(content.as_bytes()).await {
                    Ok(()) => file.flush().await,
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            }
        } else {
            tokio::fs::write(&resolved, content).await
        };

        let verb = if append { "appended" } else { "wrote" };
        match written {
            Ok(()) => {
                let summary = format!("{verb} {} bytes to {}", content.len(), resolved.display());
                Ok(ToolOutput::ok(format!("Successfully {summary}")).with_side_effects(summary))
            }
            Err(e) => Ok(ToolOutput::failed(format!("Failed to write file: {e}"))),
        }
    }
}
