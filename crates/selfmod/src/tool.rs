//! The `self_modify` tool: the agent's handle on its own source tree.

use crate::manager::{SelfModManager, WriteOutcome};
use crate::record::ModificationOutcome;
use async_trait::async_trait;
use ouroboros_core::error::{ModificationError, ToolError};
use ouroboros_core::tool::{DangerLevel, Tool, ToolOutput};
use std::sync::Arc;

const TOOL_NAME: &str = "self_modify";

pub struct SelfModifyTool {
    manager: Arc<SelfModManager>,
}

impl SelfModifyTool {
    pub fn new(manager: Arc<SelfModManager>) -> Self {
        Self { manager }
    }
}

fn tool_error(e: ModificationError) -> ToolError {
    match e {
        ModificationError::InvalidPath { .. } => ToolError::PermissionDenied {
            tool_name: TOOL_NAME.into(),
            reason: e.to_string(),
        },
        other => ToolError::ExecutionFailed {
            tool_name: TOOL_NAME.into(),
            reason: other.to_string(),
        },
    }
}

fn required<'a>(arguments: &'a serde_json::Value, field: &str, action: &str) -> Result<&'a str, ToolError> {
    arguments[field]
        .as_str()
        .ok_or_else(|| ToolError::InvalidArguments(format!("'{action}' requires '{field}'")))
}

#[async_trait]
impl Tool for SelfModifyTool {
    fn name(&self) -> &str {
        TOOL_NAME
    }

    fn description(&self) -> &str {
        "Read or rewrite your own source code. Actions: read_source (path), \
         write_source (path, content) commits the change, list_structure shows \
         the project tree, restart (reason) replaces the running process so \
         committed source changes take effect. A failed restart is rolled back."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["read_source", "write_source", "list_structure", "restart"]
                },
                "path": {
                    "type": "string",
                    "description": "Path relative to the project root"
                },
                "content": {
                    "type": "string",
                    "description": "Full new file content for write_source"
                },
                "reason": {
                    "type": "string",
                    "description": "Why the restart is needed"
                }
            },
            "required": ["action"]
        })
    }

    fn danger_level(&self) -> DangerLevel {
        DangerLevel::SelfModifying
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let action = required(&arguments, "action", "self_modify")?;
        match action {
            "read_source" => {
                let path = required(&arguments, "path", action)?;
                let content = self.manager.read_source(path).await.map_err(tool_error)?;
                Ok(ToolOutput::ok(content))
            }
            "write_source" => {
                let path = required(&arguments, "path", action)?;
                let content = required(&arguments, "content", action)?;
                match self.manager.write_source(path, content).await.map_err(tool_error)? {
                    WriteOutcome::Unchanged { path } => {
                        Ok(ToolOutput::ok(format!("{path} already has this content; nothing committed")))
                    }
                    WriteOutcome::Recorded(record) => {
                        let mut text = format!(
                            "Wrote {} and committed {}.",
                            record.path,
                            record.short_commit()
                        );
                        if record.outcome == ModificationOutcome::RestartPending {
                            text.push_str(" Takes effect after a restart.");
                        }
                        let data = serde_json::to_value(&record).unwrap_or_default();
                        Ok(ToolOutput::ok(text)
                            .with_side_effects(format!(
                                "modified {} (commit {})",
                                record.path,
                                record.short_commit()
                            ))
                            .with_data(data))
                    }
                }
            }
            "list_structure" => {
                let tree = self.manager.list_structure().await.map_err(tool_error)?;
                Ok(ToolOutput::ok(tree))
            }
            "restart" => {
                let reason = arguments["reason"].as_str().unwrap_or("self-modification");
                let request = self.manager.request_restart(reason).await.map_err(tool_error)?;
                Ok(ToolOutput::ok(format!(
                    "Restart scheduled after this turn ({} pending change(s)).",
                    request.record_ids.len()
                ))
                .with_side_effects("requested process restart")
                .with_data(serde_json::json!({"last_good_commit": request.last_good_commit})))
            }
            other => Err(ToolError::InvalidArguments(format!(
                "Unknown action '{other}'. Use read_source, write_source, list_structure or restart"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::tests::manager;
    use crate::state::ModState;
    use serde_json::json;

    async fn tool(dir: &std::path::Path) -> (SelfModifyTool, Arc<SelfModManager>) {
        let (manager, _) = manager(dir).await;
        let manager = Arc::new(manager);
        (SelfModifyTool::new(manager.clone()), manager)
    }

    #[tokio::test]
    async fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let (tool, _) = tool(dir.path()).await;

        let out = tool
            .execute(json!({"action": "write_source", "path": "src/a.rs", "content": "fn a() {}"}))
            .await
            .unwrap();
        assert!(out.success);
        assert!(out.output.contains("after a restart"));
        assert_eq!(out.data.unwrap()["path"], "src/a.rs");

        let out = tool
            .execute(json!({"action": "read_source", "path": "src/a.rs"}))
            .await
            .unwrap();
        assert_eq!(out.output, "fn a() {}");
    }

    #[tokio::test]
    async fn escape_is_permission_denied() {
        let dir = tempfile::tempdir().unwrap();
        let (tool, _) = tool(dir.path()).await;
        let err = tool
            .execute(json!({"action": "read_source", "path": "../secret"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn missing_fields_and_unknown_action() {
        let dir = tempfile::tempdir().unwrap();
        let (tool, _) = tool(dir.path()).await;
        let err = tool
            .execute(json!({"action": "write_source", "path": "src/a.rs"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(ref m) if m.contains("content")));
        assert!(tool.execute(json!({"action": "explode"})).await.is_err());
    }

    #[tokio::test]
    async fn restart_only_requests() {
        let dir = tempfile::tempdir().unwrap();
        let (tool, manager) = tool(dir.path()).await;
        let out = tool
            .execute(json!({"action": "restart", "reason": "apply"}))
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(manager.state().await, ModState::RestartRequested);
        assert!(manager.subscribe_restarts().borrow().is_some());
        assert_eq!(tool.danger_level(), DangerLevel::SelfModifying);
    }
}
