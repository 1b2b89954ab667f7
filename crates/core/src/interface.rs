//! Interface contract: how the runtime talks to the transport layer.
//!
//! The interface layer (terminal, chat bot, webhook) resolves user identity
//! and forwards plain text inbound. The runtime answers through the
//! [`Interface`] callbacks. Transport details stay on the other side.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::autonomy::AutonomyLevel;
use crate::error::DeliveryError;
use crate::message::ConversationId;
use crate::tool::DangerLevel;

/// Where an inbound message came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundSource {
    /// A human through an interface
    Interface { name: String },
    /// A scheduled task waking the conversation up
    Scheduler { task_id: String },
    /// Generated by the runtime itself
    System,
}

/// A structured attachment forwarded by the interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    /// MIME type or coarse kind ("image", "document")
    pub kind: String,

    /// URL or file path
    pub location: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// A message submitted to the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub conversation_id: ConversationId,

    pub text: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,

    pub source: InboundSource,

    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(conversation_id: ConversationId, text: impl Into<String>, source: InboundSource) -> Self {
        Self {
            conversation_id,
            text: text.into(),
            attachments: Vec::new(),
            source,
            received_at: Utc::now(),
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Text handed to the model, with attachments listed after the message.
    pub fn content(&self) -> String {
        if self.attachments.is_empty() {
            return self.text.clone();
        }
        let mut content = self.text.clone();
        for attachment in &self.attachments {
            let name = attachment.filename.as_deref().unwrap_or("unnamed");
            content.push_str(&format!(
                "\n[attachment: {} {} at {}]",
                attachment.kind, name, attachment.location
            ));
        }
        content
    }
}

/// A gated action waiting for a human decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationRequest {
    pub conversation_id: ConversationId,
    pub action: Action,
    pub danger: DangerLevel,
    pub autonomy: AutonomyLevel,
    /// Actions from the same decision queued behind this one
    pub queued: usize,
}

impl ConfirmationRequest {
    /// Text shown to the user.
    pub fn prompt(&self) -> String {
        let mut text = format!(
            "Action requires confirmation (autonomy: {})\nTool: {} [{}]\nArguments:\n{}",
            self.autonomy,
            self.action.tool,
            self.danger,
            self.action.argument_preview()
        );
        if self.queued > 0 {
            text.push_str(&format!("\n{} more action(s) queued behind this one", self.queued));
        }
        text.push_str("\nReply /approve, /always or /deny.");
        text
    }
}

/// A human answer to a [`ConfirmationRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub approved: bool,
    /// Remember the approval for this tool in this conversation
    #[serde(default)]
    pub remember: bool,
}

impl Confirmation {
    pub fn approve() -> Self {
        Self { approved: true, remember: false }
    }

    pub fn always() -> Self {
        Self { approved: true, remember: true }
    }

    pub fn deny() -> Self {
        Self { approved: false, remember: false }
    }
}

/// Outbound callbacks consumed by the interface layer.
#[async_trait]
pub trait Interface: Send + Sync {
    /// Human-readable interface name (e.g., "cli", "telegram").
    fn name(&self) -> &str;

    /// Deliver the final reply of a turn.
    async fn on_reply(&self, conversation_id: &ConversationId, text: &str) -> Result<(), DeliveryError>;

    /// Report an action outcome as it happens.
    async fn on_action_notice(&self, conversation_id: &ConversationId, summary: &str) -> Result<(), DeliveryError>;

    /// Ask the user to confirm a gated action.
    async fn on_confirmation_request(&self, request: &ConfirmationRequest) -> Result<(), DeliveryError> {
        self.on_action_notice(&request.conversation_id, &request.prompt()).await
    }
}

/// An interface that drops everything. Used when nothing is attached.
pub struct NullInterface;

#[async_trait]
impl Interface for NullInterface {
    fn name(&self) -> &str {
        "null"
    }

    async fn on_reply(&self, _conversation_id: &ConversationId, _text: &str) -> Result<(), DeliveryError> {
        Ok(())
    }

    async fn on_action_notice(&self, _conversation_id: &ConversationId, _summary: &str) -> Result<(), DeliveryError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_lists_attachments() {
        let msg = InboundMessage::new(
            ConversationId::from("alice"),
            "look at this",
            InboundSource::Interface { name: "cli".into() },
        )
        .with_attachment(Attachment {
            kind: "image".into(),
            location: "/tmp/cat.png".into(),
            filename: Some("cat.png".into()),
        });
        let content = msg.content();
        assert!(content.starts_with("look at this"));
        assert!(content.contains("[attachment: image cat.png at /tmp/cat.png]"));
    }

    #[test]
    fn confirmation_prompt_mentions_tool_and_danger() {
        let request = ConfirmationRequest {
            conversation_id: ConversationId::from("alice"),
            action: Action::new("c1", "shell", json!({"command": "rm -rf build"})),
            danger: DangerLevel::Dangerous,
            autonomy: AutonomyLevel::Careful,
            queued: 1,
        };
        let prompt = request.prompt();
        assert!(prompt.contains("Tool: shell [dangerous]"));
        assert!(prompt.contains("command: rm -rf build"));
        assert!(prompt.contains("1 more action(s) queued"));
    }

    #[tokio::test]
    async fn null_interface_accepts_everything() {
        let iface = NullInterface;
        let id = ConversationId::from("x");
        assert!(iface.on_reply(&id, "hi").await.is_ok());
        assert!(iface.on_action_notice(&id, "shell ok").await.is_ok());
    }
}
