//! Process health counters, reported by `/status`.

use chrono::{DateTime, Utc};
use ouroboros_core::provider::Usage;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

/// How many tools a report lists.
const TOP_TOOLS: usize = 5;

/// Thread-safe running totals for one process lifetime.
#[derive(Debug)]
pub struct AgentMonitor {
    started_at: DateTime<Utc>,
    totals: RwLock<RunningTotals>,
}

#[derive(Debug, Default)]
struct RunningTotals {
    messages: u64,
    llm_calls: u64,
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
    errors: u64,
    tool_calls: HashMap<String, u64>,
}

/// Point-in-time copy of the monitor's counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub uptime_secs: i64,
    pub messages: u64,
    pub llm_calls: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub errors: u64,
    pub active_conversations: usize,
    /// Most used tools, busiest first
    pub top_tools: Vec<(String, u64)>,
}

impl AgentMonitor {
    pub fn new() -> Self {
        Self::started(Utc::now())
    }

    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            started_at: at,
            totals: RwLock::new(RunningTotals::default()),
        }
    }

    pub fn record_message(&self) {
        self.update(|t| t.messages += 1);
    }

    /// Count a completed provider call; usage is optional on some backends.
    pub fn record_llm_call(&self, usage: Option<&Usage>) {
        self.update(|t| {
            t.llm_calls += 1;
            if let Some(usage) = usage {
                t.prompt_tokens += u64::from(usage.prompt_tokens);
                t.completion_tokens += u64::from(usage.completion_tokens);
                t.total_tokens += u64::from(usage.total_tokens);
            }
        });
    }

    pub fn record_tool_call(&self, tool: &str) {
        self.update(|t| *t.tool_calls.entry(tool.to_string()).or_default() += 1);
    }

    pub fn record_error(&self) {
        self.update(|t| t.errors += 1);
    }

    pub fn report(&self, active_conversations: usize) -> HealthReport {
        self.report_at(Utc::now(), active_conversations)
    }

    pub fn report_at(&self, now: DateTime<Utc>, active_conversations: usize) -> HealthReport {
        let totals = self.totals.read().unwrap_or_else(|e| e.into_inner());
        let mut top_tools: Vec<(String, u64)> = totals
            .tool_calls
            .iter()
            .map(|(name, count)| (name.clone(), *count))
            .collect();
        top_tools.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_tools.truncate(TOP_TOOLS);

        HealthReport {
            uptime_secs: (now - self.started_at).num_seconds().max(0),
            messages: totals.messages,
            llm_calls: totals.llm_calls,
            prompt_tokens: totals.prompt_tokens,
            completion_tokens: totals.completion_tokens,
            total_tokens: totals.total_tokens,
            errors: totals.errors,
            active_conversations,
            top_tools,
        }
    }

    fn update(&self, apply: impl FnOnce(&mut RunningTotals)) {
        let mut totals = self.totals.write().unwrap_or_else(|e| e.into_inner());
        apply(&mut totals);
    }
}

impl Default for AgentMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hours = self.uptime_secs / 3600;
        let minutes = (self.uptime_secs % 3600) / 60;
        let seconds = self.uptime_secs % 60;
        writeln!(f, "Uptime:        {hours}h {minutes:02}m {seconds:02}s")?;
        writeln!(f, "Messages:      {}", self.messages)?;
        writeln!(f, "LLM calls:     {}", self.llm_calls)?;
        writeln!(
            f,
            "Tokens:        {} ({} prompt / {} completion)",
            self.total_tokens, self.prompt_tokens, self.completion_tokens
        )?;
        writeln!(f, "Errors:        {}", self.errors)?;
        write!(f, "Conversations: {}", self.active_conversations)?;
        if !self.top_tools.is_empty() {
            write!(f, "\nTop tools:")?;
            for (name, count) in &self.top_tools {
                write!(f, "\n  {name:<20} {count}")?;
            }
        }
        Ok(())
    }
}
