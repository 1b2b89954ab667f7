//! Test doubles shared by unit and end-to-end tests.

use async_trait::async_trait;
use ouroboros_core::action::Action;
use ouroboros_core::error::{DeliveryError, ProviderError, ToolError};
use ouroboros_core::interface::{ConfirmationRequest, Interface};
use ouroboros_core::message::ConversationId;
use ouroboros_core::provider::{Decision, Provider, ProviderRequest};
use ouroboros_core::tool::{DangerLevel, Tool, ToolOutput};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Returns queued decisions (or errors) in order. When the script runs
/// out it replies "done".
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<Decision, ProviderError>>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Result<Decision, ProviderError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, step: Result<Decision, ProviderError>) {
        self.script.lock().unwrap().push_back(step);
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat(&self, request: ProviderRequest) -> Result<Decision, ProviderError> {
        self.requests.lock().unwrap().push(request);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Decision::reply("done")))
    }
}

/// A decision requesting one action.
pub fn act(id: &str, tool: &str, arguments: serde_json::Value) -> Result<Decision, ProviderError> {
    Ok(Decision::act(vec![Action::new(id, tool, arguments)]))
}

pub fn reply(text: &str) -> Result<Decision, ProviderError> {
    Ok(Decision::reply(text))
}

/// Captures everything the runtime delivers.
#[derive(Default)]
pub struct RecordingInterface {
    pub replies: Mutex<Vec<(ConversationId, String)>>,
    pub notices: Mutex<Vec<(ConversationId, String)>>,
    pub confirmations: Mutex<Vec<ConfirmationRequest>>,
}

impl RecordingInterface {
    pub fn replies(&self) -> Vec<String> {
        self.replies.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
    }

    pub fn notices(&self) -> Vec<String> {
        self.notices.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
    }

    pub fn confirmations(&self) -> Vec<ConfirmationRequest> {
        self.confirmations.lock().unwrap().clone()
    }
}

#[async_trait]
impl Interface for RecordingInterface {
    fn name(&self) -> &str {
        "recording"
    }

    async fn on_reply(&self, conversation_id: &ConversationId, text: &str) -> Result<(), DeliveryError> {
        self.replies
            .lock()
            .unwrap()
            .push((conversation_id.clone(), text.to_string()));
        Ok(())
    }

    async fn on_action_notice(&self, conversation_id: &ConversationId, summary: &str) -> Result<(), DeliveryError> {
        self.notices
            .lock()
            .unwrap()
            .push((conversation_id.clone(), summary.to_string()));
        Ok(())
    }

    async fn on_confirmation_request(&self, request: &ConfirmationRequest) -> Result<(), DeliveryError> {
        self.confirmations.lock().unwrap().push(request.clone());
        Ok(())
    }
}

/// A tool that counts its runs and echoes its arguments.
pub struct CountingTool {
    name: String,
    danger: DangerLevel,
    runs: AtomicUsize,
}

impl CountingTool {
    pub fn new(name: &str, danger: DangerLevel) -> Self {
        Self {
            name: name.to_string(),
            danger,
            runs: AtomicUsize::new(0),
        }
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for CountingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Counts invocations"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }

    fn danger_level(&self) -> DangerLevel {
        self.danger
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(ToolOutput::ok(format!("{} ran with {arguments}", self.name)))
    }
}
