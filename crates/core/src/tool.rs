//! Tool trait: the abstraction over agent capabilities.
//!
//! Tools are what give the agent the ability to act in the world:
//! execute shell commands, read/write files, fetch pages, rewrite its own
//! source. Concrete behaviors live in other crates; this module only
//! defines the single contract they satisfy.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::ToolError;
use crate::provider::ToolDefinition;

/// How much harm an action can do. Ordered from least to most dangerous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DangerLevel {
    /// Read-only, no side effects
    Safe,
    /// Local, reversible side effects (writing a file)
    Moderate,
    /// Arbitrary side effects (shell commands)
    Dangerous,
    /// Rewrites or restarts the agent itself
    SelfModifying,
}

impl DangerLevel {
    pub const ALL: [DangerLevel; 4] = [
        DangerLevel::Safe,
        DangerLevel::Moderate,
        DangerLevel::Dangerous,
        DangerLevel::SelfModifying,
    ];
}

impl std::fmt::Display for DangerLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Safe => "safe",
            Self::Moderate => "moderate",
            Self::Dangerous => "dangerous",
            Self::SelfModifying => "self_modifying",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for DangerLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "safe" => Ok(Self::Safe),
            "moderate" => Ok(Self::Moderate),
            "dangerous" => Ok(Self::Dangerous),
            "self_modifying" => Ok(Self::SelfModifying),
            other => Err(format!("unknown danger level '{other}'")),
        }
    }
}

/// What a tool returns when it ran to completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolOutput {
    /// Whether the tool considers the run successful
    pub success: bool,

    /// The output content shown to the model
    pub output: String,

    /// Optional structured data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    /// Short description of side effects (files written, processes run)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side_effects: Option<String>,
}

impl ToolOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            ..Self::default()
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            ..Self::default()
        }
    }

    pub fn with_side_effects(mut self, summary: impl Into<String>) -> Self {
        self.side_effects = Some(summary.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// The core Tool trait.
///
/// Each tool (shell, file_read, self_modify, extension commands, ...)
/// implements this trait and is registered with the tool registry.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "shell", "file_read").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the LLM).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Danger level used by the autonomy gate.
    fn danger_level(&self) -> DangerLevel {
        DangerLevel::Safe
    }

    /// Execute the tool with already-validated arguments.
    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the LLM.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
            danger_level: self.danger_level(),
        }
    }
}

/// A registered tool: its metadata plus the executable handle.
///
/// Metadata is captured once at registration so a descriptor never changes
/// while it is visible in a registry snapshot.
#[derive(Clone)]
pub struct ToolDescriptor {
    pub definition: ToolDefinition,
    pub handle: Arc<dyn Tool>,
}

impl ToolDescriptor {
    pub fn new(handle: Arc<dyn Tool>) -> Self {
        Self {
            definition: handle.to_definition(),
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn danger_level(&self) -> DangerLevel {
        self.definition.danger_level
    }
}

impl std::fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.definition.name)
            .field("danger_level", &self.definition.danger_level)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A simple test tool for unit tests.
    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echoes back the input"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string" }
                },
                "required": ["text"]
            })
        }
        async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::ok(arguments["text"].as_str().unwrap_or("")))
        }
    }

    #[test]
    fn danger_levels_are_ordered() {
        assert!(DangerLevel::Safe < DangerLevel::Moderate);
        assert!(DangerLevel::Moderate < DangerLevel::Dangerous);
        assert!(DangerLevel::Dangerous < DangerLevel::SelfModifying);
    }

    #[test]
    fn danger_level_parses() {
        assert_eq!("self-modifying".parse::<DangerLevel>().unwrap(), DangerLevel::SelfModifying);
        assert_eq!("SAFE".parse::<DangerLevel>().unwrap(), DangerLevel::Safe);
        assert!("lethal".parse::<DangerLevel>().is_err());
    }

    #[test]
    fn descriptor_captures_definition() {
        let descriptor = ToolDescriptor::new(Arc::new(EchoTool));
        assert_eq!(descriptor.name(), "echo");
        assert_eq!(descriptor.danger_level(), DangerLevel::Safe);
        assert_eq!(descriptor.definition.parameters["required"][0], "text");
    }

    #[tokio::test]
    async fn execute_through_handle() {
        let descriptor = ToolDescriptor::new(Arc::new(EchoTool));
        let out = descriptor
            .handle
            .execute(serde_json::json!({"text": "hello world"}))
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(out.output, "hello world");
    }
}
