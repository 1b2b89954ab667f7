//! The agent reasoning loop.
//!
//! One call to [`AgentLoop::process`] runs think → act → observe cycles for
//! a conversation until the model replies without actions, the iteration
//! cap is hit, or an action needs confirmation. A suspension is written to
//! durable state before control returns, and [`AgentLoop::resume`] picks
//! the same cycle up again, in this process or in a relaunched one.
//!
//! Actions of one decision are dispatched in order. The first gated action
//! suspends the cycle; the actions behind it stay queued in the pending
//! record and are gated one by one on resume.

use crate::context::{AssemblyInput, ContextAssembler};
use crate::monitor::AgentMonitor;
use crate::state::{PendingCycle, StateStore};
use chrono::Utc;
use ouroboros_core::action::{Action, ActionResult, FailureKind};
use ouroboros_core::autonomy::{self, AutonomyLevel, GateDecision};
use ouroboros_core::error::{Error, StateError};
use ouroboros_core::interface::{Confirmation, ConfirmationRequest, InboundMessage, Interface, NullInterface};
use ouroboros_core::journal::{Journal, JournalEntry, JournalKind};
use ouroboros_core::message::{Conversation, ConversationId, Turn};
use ouroboros_core::provider::{Provider, ProviderRequest, ToolDefinition};
use ouroboros_core::tool::DangerLevel;
use ouroboros_providers::{RetryPolicy, chat_with_retry};
use ouroboros_tools::ToolRegistry;
use ouroboros_tools::registry::invoke_in;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How a turn ended.
#[derive(Debug, Clone)]
pub enum TurnOutcome {
    /// The model's final reply
    Reply(String),
    /// Waiting for the user to confirm a gated action
    Suspended(ConfirmationRequest),
    /// The provider kept failing; the notice is in the conversation history
    Notice(String),
    /// The turn gave up (iteration cap, empty decision, context failure)
    Degraded(String),
    Cancelled,
}

impl TurnOutcome {
    /// Text to deliver to the user, if the turn produced any.
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Reply(text) | Self::Notice(text) | Self::Degraded(text) => Some(text),
            Self::Suspended(_) | Self::Cancelled => None,
        }
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self, Self::Suspended(_))
    }
}

enum Dispatch {
    Completed,
    Suspended(ConfirmationRequest),
    Cancelled,
}

/// The core agent loop that orchestrates model calls and tool execution.
pub struct AgentLoop {
    provider: Arc<dyn Provider>,

    model: String,

    temperature: f32,

    max_tokens: Option<u32>,

    /// Versioned tool mapping; each dispatch pins one snapshot
    tools: Arc<ToolRegistry>,

    assembler: ContextAssembler,

    journal: Arc<dyn Journal>,

    state: Arc<StateStore>,

    interface: Arc<dyn Interface>,

    retry: RetryPolicy,

    /// Think/act/observe cycles per turn
    max_iterations: u32,

    /// Process-wide autonomy; conversations may override it
    autonomy: RwLock<AutonomyLevel>,

    monitor: Arc<AgentMonitor>,
}

impl AgentLoop {
    pub fn new(
        provider: Arc<dyn Provider>,
        model: impl Into<String>,
        tools: Arc<ToolRegistry>,
        assembler: ContextAssembler,
        journal: Arc<dyn Journal>,
        state: Arc<StateStore>,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature: 0.7,
            max_tokens: None,
            tools,
            assembler,
            journal,
            state,
            interface: Arc::new(NullInterface),
            retry: RetryPolicy::default(),
            max_iterations: 25,
            autonomy: RwLock::new(AutonomyLevel::default()),
            monitor: Arc::new(AgentMonitor::new()),
        }
    }

    pub fn with_interface(mut self, interface: Arc<dyn Interface>) -> Self {
        self.interface = interface;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max.max(1);
        self
    }

    pub fn with_autonomy(self, level: AutonomyLevel) -> Self {
        self.set_default_autonomy(level);
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<AgentMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn monitor(&self) -> &Arc<AgentMonitor> {
        &self.monitor
    }

    pub fn interface(&self) -> &Arc<dyn Interface> {
        &self.interface
    }

    pub fn journal(&self) -> &Arc<dyn Journal> {
        &self.journal
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn default_autonomy(&self) -> AutonomyLevel {
        *self.autonomy.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_default_autonomy(&self, level: AutonomyLevel) {
        *self.autonomy.write().unwrap_or_else(|e| e.into_inner()) = level;
    }

    /// The conversation's override, or the process-wide level.
    pub async fn effective_autonomy(&self, id: &ConversationId) -> Result<AutonomyLevel, Error> {
        let meta = self.state.load_meta(id).await?;
        Ok(meta.autonomy_override.unwrap_or_else(|| self.default_autonomy()))
    }

    /// Set or clear a conversation's autonomy override.
    pub async fn set_conversation_autonomy(
        &self,
        id: &ConversationId,
        level: Option<AutonomyLevel>,
    ) -> Result<(), Error> {
        let mut meta = self.state.load_meta(id).await?;
        meta.autonomy_override = level;
        self.state.save_meta(id, &meta).await?;
        info!(conversation = %id, autonomy = ?level, "Conversation autonomy changed");
        Ok(())
    }

    /// The confirmation a suspended conversation is waiting for.
    pub async fn pending_request(&self, id: &ConversationId) -> Result<Option<ConfirmationRequest>, Error> {
        let Some(pending) = self.state.load_pending(id).await? else {
            return Ok(None);
        };
        Ok(pending.gated().map(|action| ConfirmationRequest {
            conversation_id: pending.conversation_id.clone(),
            action: action.clone(),
            danger: action.danger.unwrap_or(DangerLevel::Dangerous),
            autonomy: pending.autonomy,
            queued: pending.actions.len().saturating_sub(1),
        }))
    }

    /// Handle an inbound message. A pending confirmation is superseded:
    /// its actions are discarded unexecuted.
    pub async fn process(
        &self,
        conversation: &mut Conversation,
        inbound: &InboundMessage,
        cancel: &AtomicBool,
    ) -> Result<TurnOutcome, Error> {
        let discarded = self
            .discard_pending(conversation, "superseded by a new message")
            .await?;
        if discarded > 0 {
            info!(conversation = %conversation.id, discarded, "New message superseded pending actions");
        }
        self.monitor.record_message();

        self.note(
            &conversation.id,
            JournalKind::Inbound,
            serde_json::json!({
                "summary": preview(&inbound.text, 120),
                "source": inbound.source,
            }),
        )
        .await;
        self.record(conversation, Turn::user(inbound.content())).await?;

        self.run_cycles(conversation, 0, cancel).await
    }

    /// Continue a suspended cycle with the user's answer.
    pub async fn resume(
        &self,
        conversation: &mut Conversation,
        confirmation: Confirmation,
        cancel: &AtomicBool,
    ) -> Result<TurnOutcome, Error> {
        let id = conversation.id.clone();
        let pending = self
            .state
            .load_pending(&id)
            .await?
            .ok_or_else(|| StateError::NothingPending(id.to_string()))?;
        // Consumed exactly once: cleared before anything runs.
        self.state.clear_pending(&id).await?;

        let mut queue: VecDeque<Action> = pending.actions.into();
        let Some(gated) = queue.pop_front() else {
            return self.run_cycles(conversation, pending.iteration + 1, cancel).await;
        };

        self.note(
            &id,
            JournalKind::Resumed,
            serde_json::json!({
                "summary": format!(
                    "{} {} ({})",
                    if confirmation.approved { "approved" } else { "denied" },
                    gated.tool,
                    gated.id
                ),
                "action_id": gated.id,
                "approved": confirmation.approved,
                "remember": confirmation.remember,
            }),
        )
        .await;

        let mut approved = None;
        if confirmation.approved {
            if confirmation.remember {
                let mut meta = self.state.load_meta(&id).await?;
                meta.standing_approvals.insert(gated.tool.clone());
                self.state.save_meta(&id, &meta).await?;
            }
            approved = Some(gated.id.clone());
            queue.push_front(gated);
        } else {
            let result = ActionResult::failure(
                &gated,
                FailureKind::Rejected,
                "The user declined to run this action.",
                Duration::ZERO,
            );
            self.observe(conversation, &gated, result, false).await?;
        }

        let autonomy = self.effective_autonomy(&id).await?;
        match self
            .dispatch(conversation, queue, pending.iteration, autonomy, approved, cancel)
            .await?
        {
            Dispatch::Completed => self.run_cycles(conversation, pending.iteration + 1, cancel).await,
            Dispatch::Suspended(request) => Ok(TurnOutcome::Suspended(request)),
            Dispatch::Cancelled => Ok(TurnOutcome::Cancelled),
        }
    }

    /// Drop a suspended cycle without running it. Returns how many actions
    /// were discarded.
    pub async fn discard_pending(&self, conversation: &mut Conversation, reason: &str) -> Result<usize, Error> {
        let Some(pending) = self.state.load_pending(&conversation.id).await? else {
            return Ok(0);
        };
        self.state.clear_pending(&conversation.id).await?;
        self.discard(conversation, pending.actions, reason).await
    }

    async fn run_cycles(
        &self,
        conversation: &mut Conversation,
        from: u32,
        cancel: &AtomicBool,
    ) -> Result<TurnOutcome, Error> {
        for iteration in from..self.max_iterations {
            if cancel.load(Ordering::SeqCst) {
                self.note(
                    &conversation.id,
                    JournalKind::Cancelled,
                    serde_json::json!({"summary": format!("turn cancelled before cycle {iteration}")}),
                )
                .await;
                return Ok(TurnOutcome::Cancelled);
            }

            let snapshot = self.tools.snapshot();
            let definitions: Vec<ToolDefinition> = snapshot
                .descriptors()
                .into_iter()
                .map(|d| d.definition.clone())
                .collect();
            let autonomy = self.effective_autonomy(&conversation.id).await?;

            let turns = match self
                .assembler
                .assemble(AssemblyInput {
                    conversation,
                    tools: &definitions,
                    autonomy,
                })
                .await
            {
                Ok(turns) => turns,
                Err(e) => {
                    error!(conversation = %conversation.id, error = %e, "Context assembly failed");
                    self.note(
                        &conversation.id,
                        JournalKind::Error,
                        serde_json::json!({"summary": format!("context assembly failed: {e}")}),
                    )
                    .await;
                    let text = format!(
                        "I could not prepare my context for this turn ({e}). This needs operator attention."
                    );
                    self.record(conversation, Turn::notice(text.clone())).await?;
                    return Ok(TurnOutcome::Degraded(text));
                }
            };

            let mut request = ProviderRequest::new(&self.model, turns);
            request.temperature = self.temperature;
            request.max_tokens = self.max_tokens;
            request.tools = definitions;

            debug!(conversation = %conversation.id, iteration, "Calling provider");
            let decision = match chat_with_retry(self.provider.as_ref(), &request, &self.retry).await {
                Ok((decision, retried)) => {
                    for attempt in &retried {
                        self.note_retry(&conversation.id, attempt.attempt, &attempt.error.to_string())
                            .await;
                    }
                    self.monitor.record_llm_call(decision.usage.as_ref());
                    decision
                }
                Err(exhausted) => {
                    for attempt in &exhausted.retried {
                        self.note_retry(&conversation.id, attempt.attempt, &attempt.error.to_string())
                            .await;
                    }
                    warn!(conversation = %conversation.id, error = %exhausted, "Provider exhausted");
                    self.note(
                        &conversation.id,
                        JournalKind::ProviderExhausted,
                        serde_json::json!({
                            "summary": exhausted.to_string(),
                            "attempts": exhausted.attempts,
                        }),
                    )
                    .await;
                    let text = format!(
                        "The language model could not be reached after {} attempt(s): {}. Please try again later.",
                        exhausted.attempts, exhausted.last_error
                    );
                    self.record(conversation, Turn::notice(text.clone())).await?;
                    return Ok(TurnOutcome::Notice(text));
                }
            };

            for warning in &decision.warnings {
                warn!(conversation = %conversation.id, warning = %warning, "Decision extraction warning");
                self.note(
                    &conversation.id,
                    JournalKind::ParseWarning,
                    serde_json::json!({"summary": warning}),
                )
                .await;
            }

            if decision.is_empty() {
                let text = "I could not come up with a response. Please rephrase or try again.";
                self.note(
                    &conversation.id,
                    JournalKind::Error,
                    serde_json::json!({"summary": "model returned neither a reply nor an action"}),
                )
                .await;
                self.record(conversation, Turn::agent(text)).await?;
                return Ok(TurnOutcome::Degraded(text.into()));
            }

            if decision.actions.is_empty() {
                let text = decision.reply_text().unwrap_or_default().to_string();
                self.record(conversation, Turn::agent(text.clone())).await?;
                self.note(
                    &conversation.id,
                    JournalKind::Reply,
                    serde_json::json!({"summary": preview(&text, 120)}),
                )
                .await;
                info!(conversation = %conversation.id, iteration, "Turn complete");
                return Ok(TurnOutcome::Reply(text));
            }

            let actions = decision.actions;
            self.record(
                conversation,
                Turn::agent_with_actions(decision.reply.unwrap_or_default(), actions.clone()),
            )
            .await?;

            match self
                .dispatch(conversation, actions.into(), iteration, autonomy, None, cancel)
                .await?
            {
                Dispatch::Completed => {}
                Dispatch::Suspended(request) => return Ok(TurnOutcome::Suspended(request)),
                Dispatch::Cancelled => return Ok(TurnOutcome::Cancelled),
            }
        }

        warn!(
            conversation = %conversation.id,
            max_iterations = self.max_iterations,
            "Iteration cap reached"
        );
        self.note(
            &conversation.id,
            JournalKind::Error,
            serde_json::json!({"summary": format!("stopped after {} cycles", self.max_iterations)}),
        )
        .await;
        let text = format!(
            "I could not complete this request within {} steps. Tell me how you would like to proceed.",
            self.max_iterations
        );
        self.record(conversation, Turn::agent(text.clone())).await?;
        Ok(TurnOutcome::Degraded(text))
    }

    /// Gate and run actions in order against one pinned tool snapshot.
    async fn dispatch(
        &self,
        conversation: &mut Conversation,
        mut queue: VecDeque<Action>,
        iteration: u32,
        autonomy: AutonomyLevel,
        approved: Option<String>,
        cancel: &AtomicBool,
    ) -> Result<Dispatch, Error> {
        let snapshot = self.tools.snapshot();
        let meta = self.state.load_meta(&conversation.id).await?;

        while let Some(mut action) = queue.pop_front() {
            if cancel.load(Ordering::SeqCst) {
                queue.push_front(action);
                self.discard(conversation, queue.into(), "the turn was cancelled")
                    .await?;
                return Ok(Dispatch::Cancelled);
            }

            let Some(descriptor) = snapshot.get(&action.tool) else {
                // Never executed, so there is nothing to gate.
                let result = invoke_in(&snapshot, &action).await;
                self.observe(conversation, &action, result, false).await?;
                continue;
            };

            let danger = descriptor.danger_level();
            action.danger = Some(danger);
            let confirmed_now = approved.as_deref() == Some(action.id.as_str());
            let standing = confirmed_now || meta.standing_approvals.contains(&action.tool);
            let gate = autonomy::evaluate(danger, autonomy, standing);

            // Recorded before any side effect; no record, no dispatch.
            self.journal
                .append(JournalEntry::for_conversation(
                    &conversation.id,
                    JournalKind::Gate,
                    serde_json::json!({
                        "summary": format!("{} [{danger}] under {autonomy}: {gate:?}", action.tool),
                        "action_id": action.id,
                        "tool": action.tool,
                        "danger": danger,
                        "autonomy": autonomy,
                        "gate": gate,
                        "confirmed": confirmed_now,
                    }),
                ))
                .await?;

            if gate == GateDecision::RequireConfirmation {
                let queued = queue.len();
                let mut actions = Vec::with_capacity(queued + 1);
                actions.push(action.clone());
                actions.extend(queue);
                self.state
                    .save_pending(&PendingCycle {
                        conversation_id: conversation.id.clone(),
                        actions,
                        iteration,
                        autonomy,
                        suspended_at: Utc::now(),
                    })
                    .await?;
                self.note(
                    &conversation.id,
                    JournalKind::Suspended,
                    serde_json::json!({
                        "summary": format!("awaiting confirmation for {} ({})", action.tool, action.id),
                        "action_id": action.id,
                        "queued": queued,
                    }),
                )
                .await;
                info!(conversation = %conversation.id, tool = %action.tool, %danger, "Suspended for confirmation");
                return Ok(Dispatch::Suspended(ConfirmationRequest {
                    conversation_id: conversation.id.clone(),
                    action,
                    danger,
                    autonomy,
                    queued,
                }));
            }

            debug!(conversation = %conversation.id, tool = %action.tool, "Dispatching action");
            let result = invoke_in(&snapshot, &action).await;
            let audit = matches!(gate, GateDecision::Proceed { audit: true });
            self.observe(conversation, &action, result, audit).await?;
        }

        Ok(Dispatch::Completed)
    }

    /// Journal a result, notify the interface and append the observation.
    async fn observe(
        &self,
        conversation: &mut Conversation,
        action: &Action,
        result: ActionResult,
        audit: bool,
    ) -> Result<(), Error> {
        self.monitor.record_tool_call(&action.tool);
        let kind = if result.is_success() {
            JournalKind::ToolOk
        } else {
            JournalKind::ToolFail
        };
        self.note(
            &conversation.id,
            kind,
            serde_json::json!({
                "summary": result.summary(),
                "action_id": action.id,
                "tool": action.tool,
                "outcome": result.outcome,
                "duration_ms": result.duration_ms,
            }),
        )
        .await;

        if audit {
            self.note(
                &conversation.id,
                JournalKind::Audit,
                serde_json::json!({
                    "summary": format!("{} ran without confirmation under autonomous", action.tool),
                    "action_id": action.id,
                    "danger": action.danger,
                    "arguments": action.arguments,
                    "side_effects": result.side_effects,
                }),
            )
            .await;
        }

        if let Err(e) = self
            .interface
            .on_action_notice(&conversation.id, &result.summary())
            .await
        {
            warn!(conversation = %conversation.id, error = %e, "Action notice not delivered");
            self.note(
                &conversation.id,
                JournalKind::DeliveryFail,
                serde_json::json!({"summary": format!("action notice not delivered: {e}")}),
            )
            .await;
        }

        self.record(conversation, Turn::observation(&action.id, result.observation()))
            .await
    }

    /// Record actions as not executed.
    async fn discard(
        &self,
        conversation: &mut Conversation,
        actions: Vec<Action>,
        reason: &str,
    ) -> Result<usize, Error> {
        let count = actions.len();
        for action in actions {
            let result = ActionResult::failure(
                &action,
                FailureKind::Cancelled,
                format!("Not executed: {reason}."),
                Duration::ZERO,
            );
            self.note(
                &conversation.id,
                JournalKind::Cancelled,
                serde_json::json!({
                    "summary": format!("{} ({}) discarded: {reason}", action.tool, action.id),
                    "action_id": action.id,
                }),
            )
            .await;
            self.record(conversation, Turn::observation(&action.id, result.observation()))
                .await?;
        }
        Ok(count)
    }

    /// Persist then append a turn.
    async fn record(&self, conversation: &mut Conversation, turn: Turn) -> Result<(), Error> {
        self.state.append_turn(&conversation.id, &turn).await?;
        conversation.push(turn);
        Ok(())
    }

    async fn note_retry(&self, id: &ConversationId, attempt: u32, error: &str) {
        self.note(
            id,
            JournalKind::ProviderRetry,
            serde_json::json!({
                "summary": format!("provider attempt {attempt} failed: {error}"),
                "attempt": attempt,
            }),
        )
        .await;
    }

    /// Best-effort journal write for entries nothing is gated on.
    async fn note(&self, id: &ConversationId, kind: JournalKind, payload: serde_json::Value) {
        if kind.is_incident() {
            self.monitor.record_error();
        }
        if let Err(e) = self
            .journal
            .append(JournalEntry::for_conversation(id, kind, payload))
            .await
        {
            warn!(conversation = %id, error = %e, "Journal write failed");
        }
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{cut}...")
}
