//! The agent side of Ouroboros.
//!
//! The agent follows a **think → act → observe** cycle:
//!
//! 1. **Receive** a message (from an interface or a scheduler wake-up)
//! 2. **Assemble context** (knowledge, environment, unseen incidents, history)
//! 3. **Think**: ask the provider for a decision, retrying transient failures
//! 4. **Act**: pass each requested action through the autonomy gate, then run
//!    it, or suspend the conversation until the user confirms
//! 5. **Observe**: append the result and loop back to step 2
//!
//! The cycle ends when the model replies without actions or the iteration
//! cap is reached. [`AgentRuntime`] runs many conversations at once and
//! drains them before a self-modification restart.

pub mod context;
pub mod journal;
pub mod log_capture;
pub mod loop_runner;
pub mod monitor;
pub mod runtime;
pub mod state;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

use ouroboros_config::AppConfig;
use ouroboros_core::knowledge::MarkdownKnowledge;
use std::sync::Arc;

pub use context::{AssemblyInput, ContextAssembler};
pub use journal::FileJournal;
pub use loop_runner::{AgentLoop, TurnOutcome};
pub use monitor::{AgentMonitor, HealthReport};
pub use runtime::{AgentRuntime, RestartGuard};
pub use state::{ConversationMeta, PendingCycle, StateStore};

/// Context assembler configured from `[agent]` and `[knowledge]`.
pub fn assembler_from_config(config: &AppConfig, journal: Arc<FileJournal>) -> ContextAssembler {
    let knowledge = MarkdownKnowledge::new(&config.knowledge.dir)
        .with_extra_files(config.knowledge.extra_files.clone());
    ContextAssembler::new(journal)
        .with_knowledge(Arc::new(knowledge))
        .with_history_limit(config.agent.history_limit)
        .with_journal_limit(config.agent.journal_context_limit)
}
