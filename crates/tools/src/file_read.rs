//! File read tool: read file contents through the path guard.

use crate::path::PathGuard;
use async_trait::async_trait;
use ouroboros_core::error::ToolError;
use ouroboros_core::tool::{Tool, ToolOutput};

/// Files larger than this are cut and marked as truncated.
const DEFAULT_MAX_BYTES: usize = 200_000;

pub struct FileReadTool {
    guard: PathGuard,
    max_bytes: usize,
}

impl FileReadTool {
    /// Create a file read tool with no path restrictions.
    pub fn new() -> Self {
        Self::with_guard(PathGuard::default())
    }

    pub fn with_guard(guard: PathGuard) -> Self {
        Self {
            guard,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }
}

impl Default for FileReadTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for FileReadTool {
    fn name(&self) -> &str {
        "file_read"
    }

    fn description(&self) -> &str {
        "Read the contents of a text file at the given path."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The file path to read"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let path = arguments["path"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'path' argument".into()))?;

        let resolved = self
            .guard
            .check(path)
            .map_err(|e| ToolError::PermissionDenied {
                tool_name: "file_read".into(),
                reason: e.to_string(),
            })?;

        match tokio::fs::read(&resolved).await {
            Ok(bytes) => {
                let total = bytes.len();
                let mut content = String::from_utf8_lossy(&bytes).into_owned();
                if total > self.max_bytes {
                    let mut cut = self.max_bytes.min(content.len());
                    while !content.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    content.truncate(cut);
                    content.push_str(&format!("\n... [truncated, {total} bytes total]"));
                }
                Ok(ToolOutput::ok(content).with_data(serde_json::json!({
                    "path": resolved.display().to_string(),
                    "bytes": total,
                })))
            }
            Err(e) => Ok(ToolOutput::failed(format!("Failed to read file: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn tool_definition() {
        let tool = FileReadTool::new();
        assert_eq!(tool.name(), "file_read");
        assert_eq!(tool.danger_level(), ouroboros_core::DangerLevel::Safe);
        let schema = tool.parameters_schema();
        assert_eq!(schema["required"], serde_json::json!(["path"]));
    }

    #[tokio::test]
    async fn read_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("test.txt");
        let mut f = std::fs::File::create(&file_path).unwrap();
        writeln!(f, "Hello, world!").unwrap();

        let result = FileReadTool::new()
            .execute(serde_json::json!({"path": file_path.to_str().unwrap()}))
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.output.contains("Hello, world!"));
        assert_eq!(result.data.unwrap()["bytes"], 14);
    }

    #[tokio::test]
    async fn large_file_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("big.txt");
        std::fs::write(&file_path, "x".repeat(100)).unwrap();

        let result = FileReadTool::new()
            .with_max_bytes(10)
            .execute(serde_json::json!({"path": file_path.to_str().unwrap()}))
            .await
            .unwrap();
        assert!(result.output.starts_with("xxxxxxxxxx\n"));
        assert!(result.output.contains("100 bytes total"));
    }

    #[tokio::test]
    async fn read_nonexistent_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = FileReadTool::new()
            .execute(serde_json::json!({"path": dir.path().join("missing.txt").to_str().unwrap()}))
            .await
            .unwrap();

        assert!(!result.success);
        assert!(result.output.contains("Failed to read file"));
    }

    #[tokio::test]
    async fn guard_refuses_outside_root() {
        let root = tempfile::tempdir().unwrap();
        let guard = PathGuard::new(&[root.path().to_string_lossy().into_owned()], &[]);
        let result = FileReadTool::with_guard(guard)
            .execute(serde_json::json!({"path": "/etc/hostname"}))
            .await;
        assert!(matches!(result, Err(ToolError::PermissionDenied { .. })));
    }
}
