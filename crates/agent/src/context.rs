//! Context assembly: what the model sees on each think step.
//!
//! The system turn is built from three layers, in order:
//!
//! 1. **Knowledge**: markdown sections from the configured sources
//! 2. **Environment**: autonomy level, available tools, current time
//! 3. **Incidents**: journal failures the model has not been shown yet
//!
//! followed by the most recent conversation turns. Any knowledge or journal
//! read failure aborts assembly; a turn must not run on partial context.

use chrono::{DateTime, Utc};
use ouroboros_core::autonomy::AutonomyLevel;
use ouroboros_core::error::AssemblyError;
use ouroboros_core::journal::Journal;
use ouroboros_core::knowledge::{KnowledgeSource, render_sections};
use ouroboros_core::message::{Conversation, ConversationId, Role, Turn};
use ouroboros_core::provider::ToolDefinition;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Conversations whose incident cutoff is kept; the stalest are forgotten.
const TRACKED_CONVERSATIONS: usize = 1024;

/// Inputs for one assembly.
pub struct AssemblyInput<'a> {
    pub conversation: &'a Conversation,
    pub tools: &'a [ToolDefinition],
    pub autonomy: AutonomyLevel,
}

pub struct ContextAssembler {
    knowledge: Vec<Arc<dyn KnowledgeSource>>,
    journal: Arc<dyn Journal>,
    history_limit: usize,
    journal_limit: usize,
    /// Newest incident timestamp already shown, per conversation
    seen: Mutex<HashMap<ConversationId, DateTime<Utc>>>,
}

impl ContextAssembler {
    pub fn new(journal: Arc<dyn Journal>) -> Self {
        Self {
            knowledge: Vec::new(),
            journal,
            history_limit: 40,
            journal_limit: 10,
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_knowledge(mut self, source: Arc<dyn KnowledgeSource>) -> Self {
        self.knowledge.push(source);
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    pub fn with_journal_limit(mut self, limit: usize) -> Self {
        self.journal_limit = limit;
        self
    }

    /// Build the turns for a provider request, system prompt first.
    pub async fn assemble(&self, input: AssemblyInput<'_>) -> Result<Vec<Turn>, AssemblyError> {
        let mut prompt = String::with_capacity(4096);

        for source in &self.knowledge {
            let sections = source.load()?;
            prompt.push_str(&render_sections(&sections));
        }

        prompt.push_str(&environment_section(input.tools, input.autonomy));

        let incidents = self.unseen_incidents(&input.conversation.id).await?;
        if !incidents.is_empty() {
            prompt.push_str("<recent_incidents>\n");
            for line in &incidents {
                prompt.push_str(line);
                prompt.push('\n');
            }
            prompt.push_str("</recent_incidents>\n");
        }

        let history = trim_orphans(input.conversation.recent(self.history_limit));
        let mut turns = Vec::with_capacity(history.len() + 1);
        turns.push(Turn::system(prompt));
        turns.extend(history.iter().cloned());

        debug!(
            conversation = %input.conversation.id,
            history = history.len(),
            incidents = incidents.len(),
            "Context assembled"
        );
        Ok(turns)
    }

    async fn unseen_incidents(&self, id: &ConversationId) -> Result<Vec<String>, AssemblyError> {
        if self.journal_limit == 0 {
            return Ok(Vec::new());
        }
        let entries = self
            .journal
            .recent(Some(id), self.journal_limit * 4)
            .await
            .map_err(|e| AssemblyError::Journal(e.to_string()))?;

        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        let cutoff = seen.get(id).copied();
        let incidents: Vec<_> = entries.iter().filter(|e| e.kind.is_incident()).collect();
        let fresh: Vec<_> = incidents
            .iter()
            .filter(|e| cutoff.is_none_or(|c| e.timestamp > c))
            .collect();
        let start = fresh.len().saturating_sub(self.journal_limit);
        let shown = &fresh[start..];
        match shown.last() {
            Some(newest) => remember(&mut seen, id, newest.timestamp, TRACKED_CONVERSATIONS),
            // Every shown incident has left the window; the cutoff filters nothing.
            None if incidents.is_empty() => {
                seen.remove(id);
            }
            None => {}
        }
        Ok(shown.iter().map(|e| e.summary()).collect())
    }
}

fn remember(
    seen: &mut HashMap<ConversationId, DateTime<Utc>>,
    id: &ConversationId,
    at: DateTime<Utc>,
    cap: usize,
) {
    seen.insert(id.clone(), at);
    while seen.len() > cap {
        let Some(stalest) = seen.iter().min_by_key(|(_, at)| **at).map(|(id, _)| id.clone()) else {
            break;
        };
        seen.remove(&stalest);
    }
}

fn environment_section(tools: &[ToolDefinition], autonomy: AutonomyLevel) -> String {
    let mut text = String::from("<environment>\n");
    text.push_str(&format!("time: {}\n", Utc::now().format("%Y-%m-%d %H:%M UTC")));
    text.push_str(&format!("autonomy: {autonomy}\n"));
    if tools.is_empty() {
        text.push_str("tools: none\n");
    } else {
        text.push_str("tools:\n");
        for tool in tools {
            text.push_str(&format!("- {} [{}]\n", tool.name, tool.danger_level));
        }
    }
    text.push_str("</environment>\n");
    text
}

/// Drop leading observations whose requesting agent turn fell outside the
/// window; chat APIs reject a tool result without its call.
fn trim_orphans(turns: &[Turn]) -> &[Turn] {
    let start = turns
        .iter()
        .position(|t| t.role != Role::Tool)
        .unwrap_or(turns.len());
    &turns[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::FileJournal;
    use async_trait::async_trait;
    use ouroboros_core::error::JournalError;
    use ouroboros_core::journal::{JournalEntry, JournalKind};
    use ouroboros_core::knowledge::{KnowledgeSection, StaticKnowledge};
    use ouroboros_core::tool::DangerLevel;
    use serde_json::json;

    fn conversation(n: usize) -> Conversation {
        let mut conv = Conversation::new(ConversationId::from("alice"));
        for i in 0..n {
            conv.push(Turn::user(format!("m{i}")));
        }
        conv
    }

    fn tools() -> Vec<ToolDefinition> {
        vec![ToolDefinition {
            name: "shell".into(),
            description: "Run a command".into(),
            parameters: json!({"type": "object"}),
            danger_level: DangerLevel::Dangerous,
        }]
    }

    #[tokio::test]
    async fn system_turn_comes_first() {
        let journal = Arc::new(FileJournal::in_memory());
        let assembler = ContextAssembler::new(journal)
            .with_knowledge(Arc::new(StaticKnowledge::new("You are Ouroboros.")))
            .with_history_limit(2);
        let conv = conversation(5);
        let tools = tools();

        let turns = assembler
            .assemble(AssemblyInput {
                conversation: &conv,
                tools: &tools,
                autonomy: AutonomyLevel::Balanced,
            })
            .await
            .unwrap();

        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].role, Role::System);
        assert!(turns[0].content.contains("<identity>\nYou are Ouroboros.\n</identity>"));
        assert!(turns[0].content.contains("autonomy: balanced"));
        assert!(turns[0].content.contains("- shell [dangerous]"));
        assert_eq!(turns[1].content, "m3");
    }

    #[tokio::test]
    async fn incidents_are_shown_once() {
        let journal = Arc::new(FileJournal::in_memory());
        let conv = conversation(1);
        journal
            .append(JournalEntry::for_conversation(
                &conv.id,
                JournalKind::ToolFail,
                json!({"summary": "shell failed (timeout)"}),
            ))
            .await
            .unwrap();
        journal
            .append(JournalEntry::for_conversation(&conv.id, JournalKind::ToolOk, json!({})))
            .await
            .unwrap();
        let assembler = ContextAssembler::new(journal);
        let input = || AssemblyInput {
            conversation: &conv,
            tools: &[],
            autonomy: AutonomyLevel::Careful,
        };

        let first = assembler.assemble(input()).await.unwrap();
        assert!(first[0].content.contains("tool_fail: shell failed (timeout)"));
        assert!(!first[0].content.contains("tool_ok"));

        let second = assembler.assemble(input()).await.unwrap();
        assert!(!second[0].content.contains("recent_incidents"));
    }

    #[tokio::test]
    async fn cutoff_is_dropped_once_incidents_leave_the_window() {
        let journal = Arc::new(FileJournal::in_memory());
        let conv = conversation(1);
        journal
            .append(JournalEntry::for_conversation(
                &conv.id,
                JournalKind::Error,
                json!({"summary": "disk full"}),
            ))
            .await
            .unwrap();
        let assembler = ContextAssembler::new(journal.clone()).with_journal_limit(1);
        let input = || AssemblyInput {
            conversation: &conv,
            tools: &[],
            autonomy: AutonomyLevel::Careful,
        };

        assembler.assemble(input()).await.unwrap();
        assert!(assembler.seen.lock().unwrap().contains_key(&conv.id));

        // The window is four entries with a limit of one.
        for _ in 0..4 {
            journal
                .append(JournalEntry::for_conversation(&conv.id, JournalKind::ToolOk, json!({})))
                .await
                .unwrap();
        }
        let turns = assembler.assemble(input()).await.unwrap();
        assert!(!turns[0].content.contains("recent_incidents"));
        assert!(assembler.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn stalest_cutoffs_are_forgotten_first() {
        let mut seen = HashMap::new();
        let now = Utc::now();
        for (i, name) in ["a", "b", "c"].into_iter().enumerate() {
            remember(&mut seen, &ConversationId::from(name), now + chrono::Duration::seconds(i as i64), 2);
        }
        assert_eq!(seen.len(), 2);
        assert!(!seen.contains_key(&ConversationId::from("a")));

        // Refreshing an entry protects it.
        remember(&mut seen, &ConversationId::from("b"), now + chrono::Duration::seconds(10), 2);
        remember(&mut seen, &ConversationId::from("d"), now + chrono::Duration::seconds(11), 2);
        assert!(seen.contains_key(&ConversationId::from("b")));
        assert!(!seen.contains_key(&ConversationId::from("c")));
    }

    #[test]
    fn leading_observations_are_trimmed() {
        let turns = vec![
            Turn::observation("c1", "[OK] x"),
            Turn::user("next"),
            Turn::observation("c2", "[OK] y"),
        ];
        let trimmed = trim_orphans(&turns);
        assert_eq!(trimmed.len(), 2);
        assert_eq!(trimmed[0].content, "next");
    }

    struct BrokenKnowledge;

    impl KnowledgeSource for BrokenKnowledge {
        fn name(&self) -> &str {
            "broken"
        }
        fn load(&self) -> Result<Vec<KnowledgeSection>, AssemblyError> {
            Err(AssemblyError::Knowledge {
                source_name: "AGENT.md".into(),
                reason: "permission denied".into(),
            })
        }
    }

    struct BrokenJournal;

    #[async_trait]
    impl Journal for BrokenJournal {
        async fn append(&self, _entry: JournalEntry) -> Result<(), JournalError> {
            Ok(())
        }
        async fn recent(
            &self,
            _conversation_id: Option<&ConversationId>,
            _limit: usize,
        ) -> Result<Vec<JournalEntry>, JournalError> {
            Err(JournalError::Storage("disk gone".into()))
        }
    }

    #[tokio::test]
    async fn failures_abort_assembly() {
        let conv = conversation(1);
        let input = || AssemblyInput {
            conversation: &conv,
            tools: &[],
            autonomy: AutonomyLevel::Careful,
        };

        let assembler = ContextAssembler::new(Arc::new(FileJournal::in_memory()))
            .with_knowledge(Arc::new(BrokenKnowledge));
        assert!(matches!(
            assembler.assemble(input()).await,
            Err(AssemblyError::Knowledge { .. })
        ));

        let assembler = ContextAssembler::new(Arc::new(BrokenJournal));
        assert!(matches!(
            assembler.assemble(input()).await,
            Err(AssemblyError::Journal(_))
        ));
    }
}
