//! Scheduler collaborator contract.
//!
//! Scheduling lives outside the runtime. The agent loop only consumes
//! wake-ups, which arrive as ordinary inbound messages for a conversation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::interface::{InboundMessage, InboundSource};
use crate::message::ConversationId;

/// What to schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub conversation_id: ConversationId,

    /// Instruction delivered to the agent when the task fires
    pub instruction: String,

    /// First run time
    pub run_at: DateTime<Utc>,

    /// Repeat interval in seconds, if recurring
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub every_secs: Option<u64>,
}

/// A task known to the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub spec: TaskSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
}

/// A fired task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WakeUp {
    pub task_id: String,
    pub conversation_id: ConversationId,
    pub instruction: String,
}

impl From<WakeUp> for InboundMessage {
    fn from(wake: WakeUp) -> Self {
        InboundMessage::new(
            wake.conversation_id,
            format!("[scheduled task {}] {}", wake.task_id, wake.instruction),
            InboundSource::Scheduler { task_id: wake.task_id },
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Scheduler unavailable: {0}")]
    Unavailable(String),
}

/// The external scheduler.
#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn schedule_task(&self, spec: TaskSpec) -> Result<String, SchedulerError>;

    async fn list_tasks(&self) -> Result<Vec<ScheduledTask>, SchedulerError>;

    async fn cancel_task(&self, task_id: &str) -> Result<(), SchedulerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_up_becomes_scheduler_inbound() {
        let wake = WakeUp {
            task_id: "t-7".into(),
            conversation_id: ConversationId::from("alice"),
            instruction: "check the build".into(),
        };
        let inbound: InboundMessage = wake.into();
        assert_eq!(inbound.conversation_id.as_str(), "alice");
        assert_eq!(inbound.source, InboundSource::Scheduler { task_id: "t-7".into() });
        assert!(inbound.text.contains("check the build"));
    }
}
