//! The concurrent runtime around [`AgentLoop`].
//!
//! Turns of one conversation run strictly one at a time; different
//! conversations run in parallel, bounded by a pool of execution slots.
//! A restart takes the write side of a barrier every turn holds for
//! reading, so replacement waits for in-flight turns and blocks new ones.

use crate::loop_runner::{AgentLoop, TurnOutcome};
use crate::monitor::HealthReport;
use ouroboros_core::autonomy::AutonomyLevel;
use ouroboros_core::error::{Error, ModificationError};
use ouroboros_core::interface::{Confirmation, InboundMessage};
use ouroboros_core::journal::{JournalEntry, JournalKind};
use ouroboros_core::message::{Conversation, ConversationId};
use ouroboros_core::scheduler::WakeUp;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, Semaphore};
use tracing::{error, info, warn};

#[derive(Default)]
struct ConversationSlot {
    /// Loaded lazily on the first turn
    conversation: tokio::sync::Mutex<Option<Conversation>>,
    /// One cancel flag per turn that is queued or running
    turns: Mutex<Vec<Arc<AtomicBool>>>,
}

impl ConversationSlot {
    fn enqueue(self: &Arc<Self>) -> TurnTicket {
        let cancel = Arc::new(AtomicBool::new(false));
        self.turns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(cancel.clone());
        TurnTicket {
            slot: Arc::clone(self),
            cancel,
        }
    }

    /// Flag every queued and running turn; returns how many there were.
    fn cancel_turns(&self) -> usize {
        let turns = self.turns.lock().unwrap_or_else(|e| e.into_inner());
        for cancel in turns.iter() {
            cancel.store(true, Ordering::SeqCst);
        }
        turns.len()
    }
}

/// A turn's membership in its conversation queue, released on drop.
struct TurnTicket {
    slot: Arc<ConversationSlot>,
    cancel: Arc<AtomicBool>,
}

impl Drop for TurnTicket {
    fn drop(&mut self) {
        let mut turns = self.slot.turns.lock().unwrap_or_else(|e| e.into_inner());
        turns.retain(|t| !Arc::ptr_eq(t, &self.cancel));
    }
}

/// Held while a replacement process is being started. Dropping it lets
/// turns run again.
pub struct RestartGuard {
    _barrier: OwnedRwLockWriteGuard<()>,
}

pub struct AgentRuntime {
    agent: Arc<AgentLoop>,
    slots: Mutex<HashMap<ConversationId, Arc<ConversationSlot>>>,
    execution: Arc<Semaphore>,
    barrier: Arc<RwLock<()>>,
    replacing: AtomicBool,
}

impl AgentRuntime {
    pub fn new(agent: AgentLoop, execution_slots: usize) -> Self {
        Self {
            agent: Arc::new(agent),
            slots: Mutex::new(HashMap::new()),
            execution: Arc::new(Semaphore::new(execution_slots.max(1))),
            barrier: Arc::new(RwLock::new(())),
            replacing: AtomicBool::new(false),
        }
    }

    pub fn agent(&self) -> &Arc<AgentLoop> {
        &self.agent
    }

    /// Whether a restart has started draining turns.
    pub fn is_replacing(&self) -> bool {
        self.replacing.load(Ordering::SeqCst)
    }

    /// Health counters plus the number of conversations this process has touched.
    pub fn status(&self) -> HealthReport {
        let active = self.slots.lock().unwrap_or_else(|e| e.into_inner()).len();
        self.agent.monitor().report(active)
    }

    fn slot(&self, id: &ConversationId) -> Arc<ConversationSlot> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(id.clone()).or_default().clone()
    }

    /// Run one inbound message to completion and deliver the outcome.
    pub async fn process(&self, message: InboundMessage) -> Result<TurnOutcome, Error> {
        let id = message.conversation_id.clone();
        self.run_turn(&id, |agent, conversation, cancel| {
            Box::pin(async move { agent.process(conversation, &message, cancel).await })
        })
        .await
    }

    /// Process a message on a background task.
    pub fn submit(self: &Arc<Self>, message: InboundMessage) -> tokio::task::JoinHandle<()> {
        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            let id = message.conversation_id.clone();
            if let Err(e) = runtime.process(message).await {
                error!(conversation = %id, error = %e, "Turn failed");
                runtime.agent.monitor().record_error();
                if let Err(delivery) = runtime
                    .agent
                    .interface()
                    .on_reply(&id, &format!("Something went wrong handling that message: {e}"))
                    .await
                {
                    warn!(conversation = %id, error = %delivery, "Could not report turn failure");
                }
            }
        })
    }

    /// A scheduled task fired; it runs as an ordinary turn.
    pub fn wake(self: &Arc<Self>, wake: WakeUp) -> tokio::task::JoinHandle<()> {
        info!(task = %wake.task_id, conversation = %wake.conversation_id, "Scheduled wake-up");
        self.submit(wake.into())
    }

    /// Deliver the user's answer to a suspended conversation.
    pub async fn confirm(&self, id: &ConversationId, confirmation: Confirmation) -> Result<TurnOutcome, Error> {
        self.run_turn(id, |agent, conversation, cancel| {
            Box::pin(async move { agent.resume(conversation, confirmation, cancel).await })
        })
        .await
    }

    /// Cancel whatever the conversation is doing. Running turns stop at the
    /// next action boundary, queued turns never start, and a suspended cycle
    /// is discarded. Turns submitted afterwards are not affected.
    pub async fn cancel(&self, id: &ConversationId) -> Result<usize, Error> {
        let slot = self.slot(id);
        let flagged = slot.cancel_turns();

        let Ok(mut guard) = slot.conversation.try_lock() else {
            info!(conversation = %id, turns = flagged, "Cancellation requested for queued or running turns");
            return Ok(0);
        };
        let conversation = self.loaded(&mut guard, id).await?;
        let discarded = self
            .agent
            .discard_pending(conversation, "cancelled by the user")
            .await?;
        info!(conversation = %id, discarded, "Conversation cancelled");
        Ok(discarded)
    }

    /// Change autonomy for one conversation, or the process default when
    /// `conversation` is `None`.
    pub async fn set_autonomy(&self, conversation: Option<&ConversationId>, level: AutonomyLevel) -> Result<(), Error> {
        match conversation {
            Some(id) => self.agent.set_conversation_autonomy(id, Some(level)).await,
            None => {
                self.agent.set_default_autonomy(level);
                self.agent
                    .journal()
                    .append(JournalEntry::new(
                        None,
                        JournalKind::Audit,
                        serde_json::json!({"summary": format!("default autonomy set to {level}")}),
                    ))
                    .await?;
                Ok(())
            }
        }
    }

    /// Re-send confirmation requests left pending by a previous process.
    pub async fn recover(&self) -> Result<usize, Error> {
        let pending = self.agent.state().list_pending().await?;
        let mut delivered = 0;
        for cycle in pending {
            let Some(request) = self.agent.pending_request(&cycle.conversation_id).await? else {
                continue;
            };
            match self.agent.interface().on_confirmation_request(&request).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(conversation = %cycle.conversation_id, error = %e, "Could not re-deliver confirmation"),
            }
        }
        if delivered > 0 {
            info!(delivered, "Re-delivered pending confirmations");
        }
        Ok(delivered)
    }

    /// Wait for running turns, block new ones and flush the journal.
    pub async fn prepare_for_restart(&self) -> Result<RestartGuard, Error> {
        if self.replacing.swap(true, Ordering::SeqCst) {
            return Err(ModificationError::RestartInProgress.into());
        }
        info!("Draining turns before restart");
        let barrier = Arc::clone(&self.barrier).write_owned().await;
        if let Err(e) = self.agent.journal().flush().await {
            self.replacing.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        Ok(RestartGuard { _barrier: barrier })
    }

    /// Resume normal operation after a replacement attempt was abandoned.
    pub fn restart_aborted(&self, guard: RestartGuard) {
        drop(guard);
        self.replacing.store(false, Ordering::SeqCst);
        warn!("Restart abandoned, accepting turns again");
    }

    async fn run_turn<F>(&self, id: &ConversationId, turn: F) -> Result<TurnOutcome, Error>
    where
        F: for<'a> FnOnce(
            &'a AgentLoop,
            &'a mut Conversation,
            &'a AtomicBool,
        ) -> futures::future::BoxFuture<'a, Result<TurnOutcome, Error>>,
    {
        let slot = self.slot(id);
        // Registered before any wait so a cancel issued while queued sticks.
        let ticket = slot.enqueue();
        let mut guard = slot.conversation.lock().await;
        let _barrier = self.barrier.read().await;
        let _permit = Arc::clone(&self.execution)
            .acquire_owned()
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        let conversation = self.loaded(&mut guard, id).await?;
        let outcome = turn(self.agent.as_ref(), conversation, &ticket.cancel).await?;
        self.deliver(id, &outcome).await;
        Ok(outcome)
    }

    async fn loaded<'a>(
        &self,
        guard: &'a mut Option<Conversation>,
        id: &ConversationId,
    ) -> Result<&'a mut Conversation, Error> {
        if guard.is_none() {
            *guard = Some(self.agent.state().load_conversation(id).await?);
        }
        guard
            .as_mut()
            .ok_or_else(|| Error::Internal("conversation slot empty".into()))
    }

    async fn deliver(&self, id: &ConversationId, outcome: &TurnOutcome) {
        let interface = self.agent.interface();
        let result = match outcome {
            TurnOutcome::Suspended(request) => interface.on_confirmation_request(request).await,
            TurnOutcome::Cancelled => interface.on_reply(id, "Cancelled.").await,
            other => match other.text() {
                Some(text) => interface.on_reply(id, text).await,
                None => Ok(()),
            },
        };
        if let Err(e) = result {
            warn!(conversation = %id, interface = interface.name(), error = %e, "Delivery failed");
            if let Err(journal_err) = self
                .agent
                .journal()
                .append(JournalEntry::for_conversation(
                    id,
                    JournalKind::DeliveryFail,
                    serde_json::json!({"summary": format!("{} delivery failed: {e}", interface.name())}),
                ))
                .await
            {
                warn!(conversation = %id, error = %journal_err, "Could not journal delivery failure");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextAssembler;
    use crate::journal::FileJournal;
    use crate::state::StateStore;
    use crate::testing::{CountingTool, RecordingInterface, ScriptedProvider, act, reply};
    use async_trait::async_trait;
    use ouroboros_core::error::ToolError;
    use ouroboros_core::interface::InboundSource;
    use ouroboros_core::provider::{Decision, Usage};
    use ouroboros_core::tool::{DangerLevel, Tool, ToolOutput};
    use ouroboros_tools::ToolRegistry;
    use serde_json::json;
    use std::time::Duration;

    fn runtime_with(
        provider: Arc<ScriptedProvider>,
        tools: ToolRegistry,
        dir: &std::path::Path,
        autonomy: AutonomyLevel,
    ) -> (Arc<AgentRuntime>, Arc<RecordingInterface>) {
        let journal = Arc::new(FileJournal::in_memory());
        let interface = Arc::new(RecordingInterface::default());
        let agent = AgentLoop::new(
            provider,
            "m",
            Arc::new(tools),
            ContextAssembler::new(journal.clone()),
            journal,
            Arc::new(StateStore::new(dir)),
        )
        .with_interface(interface.clone())
        .with_autonomy(autonomy);
        (Arc::new(AgentRuntime::new(agent, 4)), interface)
    }

    fn message(conv: &str, text: &str) -> InboundMessage {
        InboundMessage::new(
            ConversationId::from(conv),
            text,
            InboundSource::Interface { name: "test".into() },
        )
    }

    #[tokio::test]
    async fn reply_is_delivered() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![reply("pong")]));
        let (runtime, interface) = runtime_with(provider, ToolRegistry::new(), dir.path(), AutonomyLevel::Careful);

        runtime.process(message("a", "ping")).await.unwrap();
        assert_eq!(interface.replies(), vec!["pong"]);
    }

    #[tokio::test]
    async fn wake_up_runs_a_turn() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![reply("build is green")]));
        let (runtime, interface) =
            runtime_with(provider.clone(), ToolRegistry::new(), dir.path(), AutonomyLevel::Careful);

        runtime
            .wake(WakeUp {
                task_id: "t-1".into(),
                conversation_id: ConversationId::from("a"),
                instruction: "check the build".into(),
            })
            .await
            .unwrap();

        assert_eq!(interface.replies(), vec!["build is green"]);
        let turns = &provider.requests()[0].turns;
        assert!(turns.iter().any(|t| t.content.contains("[scheduled task t-1] check the build")));
    }

    #[tokio::test]
    async fn status_counts_messages_calls_and_tools() {
        let dir = tempfile::tempdir().unwrap();
        let mut usage_reply = Decision::reply("done");
        usage_reply.usage = Some(Usage {
            prompt_tokens: 40,
            completion_tokens: 8,
            total_tokens: 48,
        });
        let provider = Arc::new(ScriptedProvider::new(vec![
            act("c1", "read", json!({})),
            Ok(usage_reply),
            reply("second"),
        ]));
        let tools = ToolRegistry::new();
        tools.register_tool(Arc::new(CountingTool::new("read", DangerLevel::Safe)));
        let (runtime, _interface) = runtime_with(provider, tools, dir.path(), AutonomyLevel::Careful);

        runtime.process(message("a", "read it")).await.unwrap();
        runtime.process(message("b", "hello")).await.unwrap();

        let status = runtime.status();
        assert_eq!(status.messages, 2);
        assert_eq!(status.llm_calls, 3);
        assert_eq!(status.total_tokens, 48);
        assert_eq!(status.prompt_tokens, 40);
        assert_eq!(status.active_conversations, 2);
        assert_eq!(status.top_tools, vec![("read".to_string(), 1)]);
        assert_eq!(status.errors, 0);
    }

    #[tokio::test]
    async fn suspension_is_delivered_and_confirmed() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![
            act("c1", "shell", json!({"command": "ls"})),
            reply("listed"),
        ]));
        let tools = ToolRegistry::new();
        let shell = Arc::new(CountingTool::new("shell", DangerLevel::Dangerous));
        tools.register_tool(shell.clone());
        let (runtime, interface) = runtime_with(provider, tools, dir.path(), AutonomyLevel::Careful);

        let id = ConversationId::from("a");
        runtime.process(message("a", "ls")).await.unwrap();
        assert_eq!(interface.confirmations().len(), 1);
        assert!(interface.replies().is_empty());

        runtime.confirm(&id, Confirmation::approve()).await.unwrap();
        assert_eq!(shell.runs(), 1);
        assert_eq!(interface.replies(), vec!["listed"]);
    }

    #[tokio::test]
    async fn cancel_discards_a_suspended_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![act("c1", "shell", json!({}))]));
        let tools = ToolRegistry::new();
        tools.register_tool(Arc::new(CountingTool::new("shell", DangerLevel::Dangerous)));
        let (runtime, _) = runtime_with(provider, tools, dir.path(), AutonomyLevel::Careful);

        let id = ConversationId::from("a");
        runtime.process(message("a", "go")).await.unwrap();
        assert_eq!(runtime.cancel(&id).await.unwrap(), 1);
        assert!(runtime.agent().pending_request(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_reaches_a_turn_waiting_for_a_slot() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![
            act("b1", "counter", json!({})),
            reply("b done"),
        ]));
        let tools = ToolRegistry::new();
        let counter = Arc::new(CountingTool::new("counter", DangerLevel::Safe));
        tools.register_tool(counter.clone());
        let (runtime, interface) = runtime_with(provider, tools, dir.path(), AutonomyLevel::Balanced);
        let id = ConversationId::from("b");

        // Every execution slot is busy, so the turn queues holding the
        // conversation lock.
        let busy = Arc::clone(&runtime.execution).acquire_many_owned(4).await.unwrap();
        let queued = runtime.submit(message("b", "go"));
        while runtime.slot(&id).conversation.try_lock().is_ok() {
            tokio::task::yield_now().await;
        }

        assert_eq!(runtime.cancel(&id).await.unwrap(), 0);
        drop(busy);
        queued.await.unwrap();

        assert_eq!(counter.runs(), 0);
        assert_eq!(interface.replies(), vec!["Cancelled."]);

        // A message sent after the cancel runs normally.
        runtime.process(message("b", "go again")).await.unwrap();
        assert_eq!(counter.runs(), 1);
        assert_eq!(interface.replies().last().map(String::as_str), Some("b done"));
    }

    #[tokio::test]
    async fn recover_redelivers_pending_confirmations() {
        let dir = tempfile::tempdir().unwrap();
        let tools = || {
            let registry = ToolRegistry::new();
            registry.register_tool(Arc::new(CountingTool::new("shell", DangerLevel::Dangerous)));
            registry
        };
        let provider = Arc::new(ScriptedProvider::new(vec![act("c1", "shell", json!({}))]));
        let (first, _) = runtime_with(provider, tools(), dir.path(), AutonomyLevel::Careful);
        first.process(message("a", "go")).await.unwrap();
        drop(first);

        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let (second, interface) = runtime_with(provider, tools(), dir.path(), AutonomyLevel::Careful);
        assert_eq!(second.recover().await.unwrap(), 1);
        assert_eq!(interface.confirmations()[0].action.id, "c1");
    }

    /// Sleeps, then reports how many copies were running at once.
    struct SlowTool {
        running: std::sync::atomic::AtomicUsize,
        peak: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "Sleeps"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(ToolOutput::ok("slept"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn conversations_run_in_parallel_but_turns_do_not() {
        let dir = tempfile::tempdir().unwrap();
        let slow = Arc::new(SlowTool {
            running: Default::default(),
            peak: Default::default(),
        });
        let tools = ToolRegistry::new();
        tools.register_tool(slow.clone());
        let provider = Arc::new(ScriptedProvider::new(vec![
            act("a1", "slow", json!({})),
            act("b1", "slow", json!({})),
        ]));
        let (runtime, interface) = runtime_with(provider, tools, dir.path(), AutonomyLevel::Balanced);

        let a = runtime.submit(message("a", "sleep"));
        let b = runtime.submit(message("b", "sleep"));
        a.await.unwrap();
        b.await.unwrap();

        assert_eq!(slow.peak.load(Ordering::SeqCst), 2);
        assert_eq!(interface.replies().len(), 2);
    }

    #[tokio::test]
    async fn restart_waits_for_running_turns() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![reply("hi")]));
        let (runtime, interface) = runtime_with(provider, ToolRegistry::new(), dir.path(), AutonomyLevel::Careful);

        let guard = runtime.prepare_for_restart().await.unwrap();
        assert!(runtime.is_replacing());
        assert!(matches!(
            runtime.prepare_for_restart().await,
            Err(Error::Modification(ModificationError::RestartInProgress))
        ));

        let blocked = runtime.submit(message("a", "hello"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(interface.replies().is_empty());

        runtime.restart_aborted(guard);
        blocked.await.unwrap();
        assert_eq!(interface.replies(), vec!["hi"]);
    }
}
