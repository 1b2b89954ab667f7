//! Action journal contract: the append-only record of what the agent did.
//!
//! The journal is the durable, model-visible history of gate decisions,
//! action outcomes and runtime incidents. The context assembler reads it
//! back so the agent perceives its own failures.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::JournalError;
use crate::message::ConversationId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalKind {
    Inbound,
    /// Autonomy gate decision, written before dispatch
    Gate,
    ToolOk,
    ToolFail,
    /// Post-hoc record of an unconfirmed dangerous action
    Audit,
    Suspended,
    Resumed,
    Cancelled,
    ProviderRetry,
    ProviderExhausted,
    ParseWarning,
    Reply,
    DeliveryFail,
    Modification,
    RestartRequested,
    Restart,
    Error,
}

impl JournalKind {
    /// Kinds the agent should be told about on its next think step.
    pub fn is_incident(&self) -> bool {
        matches!(
            self,
            Self::ToolFail
                | Self::ProviderExhausted
                | Self::ParseWarning
                | Self::DeliveryFail
                | Self::Error
        )
    }
}

/// A single journal record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,

    pub kind: JournalKind,

    #[serde(default)]
    pub payload: serde_json::Value,
}

impl JournalEntry {
    pub fn new(conversation_id: Option<&ConversationId>, kind: JournalKind, payload: serde_json::Value) -> Self {
        Self {
            timestamp: Utc::now(),
            conversation_id: conversation_id.cloned(),
            kind,
            payload,
        }
    }

    /// Convenience for entries that belong to a conversation.
    pub fn for_conversation(id: &ConversationId, kind: JournalKind, payload: serde_json::Value) -> Self {
        Self::new(Some(id), kind, payload)
    }

    /// One-line text form used in model-facing notices.
    pub fn summary(&self) -> String {
        let detail = match &self.payload {
            serde_json::Value::Null => String::new(),
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Object(map) => map
                .get("summary")
                .or_else(|| map.get("detail"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| self.payload.to_string()),
            other => other.to_string(),
        };
        let kind = serde_json::to_value(self.kind)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        format!("[{}] {kind}: {detail}", self.timestamp.format("%H:%M:%S"))
    }
}

/// Append-only journal storage.
#[async_trait]
pub trait Journal: Send + Sync {
    /// Append an entry. Must be durable enough that a gate decision written
    /// here survives a crash of the dispatch that follows it.
    async fn append(&self, entry: JournalEntry) -> Result<(), JournalError>;

    /// The most recent entries, oldest first. `None` means all conversations.
    async fn recent(
        &self,
        conversation_id: Option<&ConversationId>,
        limit: usize,
    ) -> Result<Vec<JournalEntry>, JournalError>;

    /// Push buffered writes to durable storage.
    async fn flush(&self) -> Result<(), JournalError> {
        Ok(())
    }
}
