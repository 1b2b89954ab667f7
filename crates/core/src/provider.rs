//! Provider trait: the abstraction over LLM backends.
//!
//! A Provider takes the assembled context turns plus the available tools and
//! returns a [`Decision`]: optional reply text and an ordered list of
//! requested actions. Whether the backend emits structured tool calls or the
//! decision is recovered from free text is the provider's business.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::error::ProviderError;
use crate::message::Turn;
use crate::tool::DangerLevel;

/// Configuration for a provider request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// The model to use (e.g., "gpt-4o", "llama3.1")
    pub model: String,

    /// Context turns, system prompt first
    pub turns: Vec<Turn>,

    /// Temperature (0.0 = deterministic, 1.0 = creative)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Available tools the model can call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    /// Stop sequences
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

impl ProviderRequest {
    pub fn new(model: impl Into<String>, turns: Vec<Turn>) -> Self {
        Self {
            model: model.into(),
            turns,
            temperature: default_temperature(),
            max_tokens: None,
            tools: Vec::new(),
            stop: Vec::new(),
        }
    }
}

fn default_temperature() -> f32 {
    0.7
}

/// A tool definition sent to the LLM so it knows what tools it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,

    #[serde(default = "default_danger")]
    pub danger_level: DangerLevel,
}

fn default_danger() -> DangerLevel {
    DangerLevel::Safe
}

/// Token usage information.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// The model's output for one think step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Decision {
    /// Reply text, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,

    /// Requested actions, in the order they must be dispatched
    #[serde(default)]
    pub actions: Vec<Action>,

    /// Which model actually responded
    #[serde(default)]
    pub model: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,

    /// Non-fatal extraction problems (e.g. an unparseable action block)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl Decision {
    pub fn reply(text: impl Into<String>) -> Self {
        Self {
            reply: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn act(actions: Vec<Action>) -> Self {
        Self {
            actions,
            ..Self::default()
        }
    }

    /// The reply text, ignoring whitespace-only replies.
    pub fn reply_text(&self) -> Option<&str> {
        self.reply.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    /// A decision with no actions and a non-empty reply ends the turn.
    pub fn is_terminal(&self) -> bool {
        self.actions.is_empty() && self.reply_text().is_some()
    }

    /// Neither a reply nor any action.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.reply_text().is_none()
    }
}

/// The core Provider trait.
///
/// Every chat backend implements this trait. The agent loop calls `chat()`
/// without knowing which provider or extraction strategy is in use.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "openai", "ollama").
    fn name(&self) -> &str;

    /// Whether the backend returns structured tool calls.
    fn supports_native_tools(&self) -> bool {
        true
    }

    /// Send the context and tools, get a decision back.
    async fn chat(&self, request: ProviderRequest) -> Result<Decision, ProviderError>;

    /// List available models for this provider.
    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        Ok(Vec::new())
    }

    /// Health check: can we reach the provider?
    async fn health_check(&self) -> Result<bool, ProviderError> {
        Ok(true)
    }
}
