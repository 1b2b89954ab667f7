//! Extension tools described by `*.tool.toml` manifests.
//!
//! Each manifest declares a command-line program; the registry runs it with
//! the JSON arguments on stdin and returns its stdout. Manifests are re-read
//! on every registry reload, so adding, editing or deleting a file takes
//! effect without a restart.
//!
//! ```toml
//! name = "word_count"
//! description = "Count words in the given text"
//! danger = "safe"
//! command = ["python3", "word_count.py"]
//! timeout_secs = 10
//!
//! [parameters]
//! type = "object"
//! required = ["text"]
//! properties.text = { type = "string" }
//! ```

use crate::registry::ToolSource;
use async_trait::async_trait;
use ouroboros_core::error::ToolError;
use ouroboros_core::tool::{DangerLevel, Tool, ToolOutput};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

const MANIFEST_SUFFIX: &str = ".tool.toml";

// Unlabelled extensions run arbitrary programs.
fn default_danger() -> DangerLevel {
    DangerLevel::Dangerous
}

fn default_timeout() -> u64 {
    30
}

fn default_parameters() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// Parsed `*.tool.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtensionManifest {
    pub name: String,
    pub description: String,
    #[serde(default = "default_danger")]
    pub danger: DangerLevel,
    /// Program followed by its fixed arguments
    pub command: Vec<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_parameters")]
    pub parameters: serde_json::Value,
}

impl ExtensionManifest {
    pub fn parse(content: &str) -> Result<Self, String> {
        let manifest: Self = toml::from_str(content).map_err(|e| e.to_string())?;
        if manifest.name.is_empty()
            || !manifest
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(format!("invalid tool name '{}'", manifest.name));
        }
        if manifest.command.is_empty() {
            return Err("command must name a program".into());
        }
        if manifest.timeout_secs == 0 {
            return Err("timeout_secs must be positive".into());
        }
        Ok(manifest)
    }
}

/// A tool backed by an external program.
pub struct CommandTool {
    manifest: ExtensionManifest,
    base_dir: PathBuf,
}

impl CommandTool {
    pub fn new(manifest: ExtensionManifest, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            manifest,
            base_dir: base_dir.into(),
        }
    }

    /// Load from a manifest file; relative programs resolve against its directory.
    pub fn from_manifest_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path).map_err(|e| format!("read failed: {e}"))?;
        let manifest = ExtensionManifest::parse(&content)?;
        let base_dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
        Ok(Self::new(manifest, base_dir))
    }

    fn program(&self) -> PathBuf {
        let program = Path::new(&self.manifest.command[0]);
        if program.components().count() > 1 && program.is_relative() {
            self.base_dir.join(program)
        } else {
            program.to_path_buf()
        }
    }

    fn failure(&self, reason: impl Into<String>) -> ToolError {
        ToolError::ExecutionFailed {
            tool_name: self.manifest.name.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Tool for CommandTool {
    fn name(&self) -> &str {
        &self.manifest.name
    }

    fn description(&self) -> &str {
        &self.manifest.description
    }

    fn parameters_schema(&self) -> serde_json::Value {
        self.manifest.parameters.clone()
    }

    fn danger_level(&self) -> DangerLevel {
        self.manifest.danger
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let input = serde_json::to_vec(&arguments).map_err(|e| self.failure(e.to_string()))?;

        let mut child = Command::new(self.program())
            .args(&self.manifest.command[1..])
            .current_dir(&self.base_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.failure(format!("spawn failed: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&input)
                .await
                .map_err(|e| self.failure(format!("writing arguments failed: {e}")))?;
        }

        let timeout = Duration::from_secs(self.manifest.timeout_secs);
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| self.failure(e.to_string()))?,
            Err(_) => {
                return Err(ToolError::Timeout {
                    tool_name: self.manifest.name.clone(),
                    timeout_secs: self.manifest.timeout_secs,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if output.status.success() {
            Ok(ToolOutput::ok(stdout))
        } else {
            let code = output.status.code().unwrap_or(-1);
            Ok(ToolOutput::failed(format!("[exit code: {code}] {stdout}\n{stderr}").trim().to_string()))
        }
    }
}

/// Scans extension directories for manifests.
pub struct ExtensionDirSource {
    dirs: Vec<PathBuf>,
}

impl ExtensionDirSource {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    fn manifests_in(dir: &Path) -> Result<Vec<PathBuf>, ToolError> {
        let entries = std::fs::read_dir(dir).map_err(|e| ToolError::ExecutionFailed {
            tool_name: "extensions".into(),
            reason: format!("cannot read {}: {e}", dir.display()),
        })?;
        let mut paths: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(MANIFEST_SUFFIX) && !n.starts_with('_'))
            })
            .collect();
        paths.sort();
        Ok(paths)
    }
}

impl ToolSource for ExtensionDirSource {
    fn name(&self) -> &str {
        "extensions"
    }

    fn load(&self) -> Result<Vec<Arc<dyn Tool>>, ToolError> {
        let mut tools: Vec<Arc<dyn Tool>> = Vec::new();
        for dir in &self.dirs {
            if !dir.exists() {
                debug!(dir = %dir.display(), "Extension directory absent, skipping");
                continue;
            }
            for path in Self::manifests_in(dir)? {
                match CommandTool::from_manifest_file(&path) {
                    Ok(tool) => {
                        info!(name = %tool.name(), path = %path.display(), "Loaded extension tool");
                        tools.push(Arc::new(tool));
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping broken tool manifest");
                    }
                }
            }
        }
        Ok(tools)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
name = "upper"
description = "Uppercase the input"
danger = "moderate"
command = ["sh", "-c", "tr a-z A-Z"]
timeout_secs = 5

[parameters]
type = "object"
required = ["text"]
properties.text = { type = "string" }
"#;

    #[test]
    fn parses_manifest() {
        let manifest = ExtensionManifest::parse(MANIFEST).unwrap();
        assert_eq!(manifest.name, "upper");
        assert_eq!(manifest.danger, DangerLevel::Moderate);
        assert_eq!(manifest.parameters["required"][0], "text");
        assert_eq!(manifest.parameters["properties"]["text"]["type"], "string");
    }

    #[test]
    fn rejects_bad_manifests() {
        assert!(ExtensionManifest::parse("name = 'x'").is_err());
        let unlabelled =
            ExtensionManifest::parse("name = 'x'\ndescription='d'\ncommand=['true']").unwrap();
        assert_eq!(unlabelled.danger, DangerLevel::Dangerous);
        assert!(ExtensionManifest::parse("name = 'bad name'\ndescription='d'\ncommand=['x']").is_err());
        assert!(ExtensionManifest::parse("name = 'x'\ndescription='d'\ncommand=[]").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_tool_receives_json_on_stdin() {
        let manifest = ExtensionManifest::parse(MANIFEST).unwrap();
        let tool = CommandTool::new(manifest, std::env::temp_dir());
        let out = tool
            .execute(serde_json::json!({"text": "hi"}))
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(out.output, r#"{"TEXT":"HI"}"#);
    }

    #[test]
    fn source_skips_underscore_and_broken_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("upper.tool.toml"), MANIFEST).unwrap();
        std::fs::write(dir.path().join("_draft.tool.toml"), MANIFEST).unwrap();
        std::fs::write(dir.path().join("broken.tool.toml"), "name = ").unwrap();
        std::fs::write(dir.path().join("notes.toml"), MANIFEST).unwrap();

        let source = ExtensionDirSource::new(vec![
            dir.path().to_path_buf(),
            dir.path().join("does-not-exist"),
        ]);
        let tools = source.load().unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name(), "upper");
    }

    #[test]
    fn unreadable_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain-file");
        std::fs::write(&file, "x").unwrap();
        let source = ExtensionDirSource::new(vec![file]);
        assert!(source.load().is_err());
    }
}
