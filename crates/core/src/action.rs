//! Actions requested by the model and the results of executing them.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ToolError;
use crate::tool::DangerLevel;

/// A requested tool invocation.
///
/// Created by a [`Decision`](crate::provider::Decision), consumed exactly once
/// by the agent loop. `danger` is `None` until the loop resolves it from the
/// registry; nothing is dispatched while it is unresolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Unique call ID (matches the provider's tool_call id when native)
    pub id: String,

    /// Name of the tool to invoke
    pub tool: String,

    /// Argument map, validated against the tool schema before dispatch
    pub arguments: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub danger: Option<DangerLevel>,
}

impl Action {
    pub fn new(id: impl Into<String>, tool: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            tool: tool.into(),
            arguments,
            danger: None,
        }
    }

    /// Short human-readable preview of the arguments: at most 5 keys,
    /// each value cut at 120 characters.
    pub fn argument_preview(&self) -> String {
        const MAX_ITEMS: usize = 5;
        const MAX_VALUE_CHARS: usize = 120;

        let Some(map) = self.arguments.as_object() else {
            return truncate(&self.arguments.to_string(), MAX_VALUE_CHARS);
        };

        let mut lines: Vec<String> = map
            .iter()
            .take(MAX_ITEMS)
            .map(|(key, value)| {
                let rendered = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                format!("  {key}: {}", truncate(&rendered, MAX_VALUE_CHARS))
            })
            .collect();
        if map.len() > MAX_ITEMS {
            lines.push(format!("  ... and {} more", map.len() - MAX_ITEMS));
        }
        lines.join("\n")
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let cut: String = s.chars().take(max_chars).collect();
    format!("{cut}...")
}

/// Why an action produced no payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Arguments did not match the declared schema
    Validation,
    /// The tool ran and failed
    Execution,
    NotFound,
    Timeout,
    PermissionDenied,
    /// The user declined the confirmation request
    Rejected,
    /// Discarded by cancellation or a superseding message
    Cancelled,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::Execution => "execution",
            Self::NotFound => "not_found",
            Self::Timeout => "timeout",
            Self::PermissionDenied => "permission_denied",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionOutcome {
    Success {
        payload: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Failure { kind: FailureKind, detail: String },
}

/// Outcome of executing one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub action_id: String,
    pub tool: String,
    pub outcome: ActionOutcome,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side_effects: Option<String>,
}

impl ActionResult {
    pub fn success(action: &Action, payload: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            action_id: action.id.clone(),
            tool: action.tool.clone(),
            outcome: ActionOutcome::Success {
                payload: payload.into(),
                data: None,
            },
            duration_ms: elapsed.as_millis() as u64,
            side_effects: None,
        }
    }

    pub fn failure(
        action: &Action,
        kind: FailureKind,
        detail: impl Into<String>,
        elapsed: Duration,
    ) -> Self {
        Self {
            action_id: action.id.clone(),
            tool: action.tool.clone(),
            outcome: ActionOutcome::Failure {
                kind,
                detail: detail.into(),
            },
            duration_ms: elapsed.as_millis() as u64,
            side_effects: None,
        }
    }

    /// Map a tool error into a model-visible failure.
    pub fn from_tool_error(action: &Action, error: &ToolError, elapsed: Duration) -> Self {
        let kind = match error {
            ToolError::NotFound(_) => FailureKind::NotFound,
            ToolError::Validation { .. } | ToolError::InvalidArguments(_) => {
                FailureKind::Validation
            }
            ToolError::ExecutionFailed { .. } => FailureKind::Execution,
            ToolError::Timeout { .. } => FailureKind::Timeout,
            ToolError::PermissionDenied { .. } => FailureKind::PermissionDenied,
        };
        Self::failure(action, kind, error.to_string(), elapsed)
    }

    pub fn with_data(mut self, data: Option<serde_json::Value>) -> Self {
        if let ActionOutcome::Success { data: slot, .. } = &mut self.outcome {
            *slot = data;
        }
        self
    }

    pub fn with_side_effects(mut self, summary: Option<String>) -> Self {
        self.side_effects = summary;
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ActionOutcome::Success { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match &self.outcome {
            ActionOutcome::Failure { kind, .. } => Some(*kind),
            ActionOutcome::Success { .. } => None,
        }
    }

    /// The text appended to the conversation as an observation turn.
    pub fn observation(&self) -> String {
        match &self.outcome {
            ActionOutcome::Success { payload, .. } => format!("[OK] {payload}"),
            ActionOutcome::Failure { kind, detail } => format!("[ERROR:{kind}] {detail}"),
        }
    }

    /// One-line summary for action notices.
    pub fn summary(&self) -> String {
        let status = match &self.outcome {
            ActionOutcome::Success { .. } => "ok".to_string(),
            ActionOutcome::Failure { kind, .. } => format!("failed ({kind})"),
        };
        match &self.side_effects {
            Some(effects) => format!("{} {status} in {}ms: {effects}", self.tool, self.duration_ms),
            None => format!("{} {status} in {}ms", self.tool, self.duration_ms),
        }
    }
}
