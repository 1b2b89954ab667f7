//! ReAct fallback for backends without native function calling.
//!
//! The adapter describes the available tools in the system prompt, asks the
//! model to answer in the `Thought / Action / Action Input` convention and
//! recovers at most one action from the free-text reply. Anything it cannot
//! parse degrades to a plain reply with no actions, never to an error.

use async_trait::async_trait;
use ouroboros_core::error::ProviderError;
use ouroboros_core::message::{Role, Turn};
use ouroboros_core::provider::{Decision, Provider, ProviderRequest, ToolDefinition};
use ouroboros_core::Action;
use regex_lite::Regex;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

const REACT_INSTRUCTIONS: &str = "\
You can use tools. To call a tool, answer in EXACTLY this format:

Thought: <your reasoning>
Action: <tool name>
Action Input: <JSON object with the arguments>

Call one tool at a time and wait for the Observation. When no tool is needed \
and you are ready to answer the user:

Thought: <your reasoning>
Final Answer: <your answer to the user>";

/// Wraps a text-only provider and emulates structured tool calling.
pub struct ReactProvider {
    name: String,
    inner: Arc<dyn Provider>,
}

impl ReactProvider {
    pub fn new(inner: Arc<dyn Provider>) -> Self {
        Self {
            name: format!("{}+react", inner.name()),
            inner,
        }
    }

    /// Rewrite the request so a text-only backend can follow it.
    fn prepare(&self, mut request: ProviderRequest) -> ProviderRequest {
        let tools = std::mem::take(&mut request.tools);
        let mut turns: Vec<Turn> = request.turns.into_iter().map(flatten_turn).collect();

        if !tools.is_empty() {
            let suffix = format!(
                "{REACT_INSTRUCTIONS}\n\nAvailable tools:\n{}",
                describe_tools(&tools)
            );
            match turns.first_mut() {
                Some(first) if first.role == Role::System => {
                    first.content = format!("{}\n\n{suffix}", first.content);
                }
                _ => turns.insert(0, Turn::system(suffix)),
            }
            request.stop.push("\nObservation:".into());
        }

        request.turns = turns;
        request
    }
}

#[async_trait]
impl Provider for ReactProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, request: ProviderRequest) -> Result<Decision, ProviderError> {
        let had_tools = !request.tools.is_empty();
        let mut decision = self.inner.chat(self.prepare(request)).await?;

        let Some(text) = decision.reply.take() else {
            return Ok(decision);
        };
        if !had_tools {
            decision.reply = Some(text);
            return Ok(decision);
        }

        match parse_react(&text) {
            ReactParse::Final(answer) => {
                decision.reply = Some(answer);
            }
            ReactParse::Act {
                thought,
                action,
                ignored,
            } => {
                debug!(provider = %self.name, tool = %action.tool, "Parsed ReAct action");
                if ignored > 0 {
                    decision
                        .warnings
                        .push(format!("ignored {ignored} extra action block(s); one action per step"));
                }
                decision.reply = thought;
                decision.actions = vec![action];
            }
            ReactParse::Plain => {
                decision.reply = Some(text.trim().to_string());
            }
            ReactParse::Malformed(reason) => {
                warn!(provider = %self.name, %reason, "Unparseable ReAct action block");
                decision.warnings.push(format!("action block not understood: {reason}"));
                decision.reply = Some(text.trim().to_string());
            }
        }

        Ok(decision)
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        self.inner.list_models().await
    }

    async fn health_check(&self) -> Result<bool, ProviderError> {
        self.inner.health_check().await
    }
}

/// Render native-only turn shapes as ReAct text.
fn flatten_turn(turn: Turn) -> Turn {
    match turn.role {
        Role::Agent if !turn.actions.is_empty() => {
            let mut text = String::new();
            if !turn.content.trim().is_empty() {
                text.push_str(&format!("Thought: {}\n", turn.content.trim()));
            }
            for action in &turn.actions {
                text.push_str(&format!(
                    "Action: {}\nAction Input: {}\n",
                    action.tool, action.arguments
                ));
            }
            let mut flat = Turn::agent(text.trim_end());
            flat.timestamp = turn.timestamp;
            flat
        }
        Role::Tool => {
            let mut flat = Turn::user(format!("Observation: {}", turn.content));
            flat.timestamp = turn.timestamp;
            flat
        }
        _ => turn,
    }
}

/// Describe tools as a bullet list with their parameters.
pub fn describe_tools(tools: &[ToolDefinition]) -> String {
    let mut lines = Vec::new();
    for tool in tools {
        lines.push(format!("- {}: {}", tool.name, tool.description));
        let required: Vec<&str> = tool.parameters["required"]
            .as_array()
            .map(|r| r.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();
        if let Some(props) = tool.parameters["properties"].as_object() {
            for (name, info) in props {
                let ty = info["type"].as_str().unwrap_or("string");
                let req = if required.contains(&name.as_str()) { ", required" } else { "" };
                let desc = info["description"].as_str().unwrap_or("");
                lines.push(format!("    - {name} ({ty}{req}): {desc}"));
            }
        }
    }
    lines.join("\n")
}

/// What a ReAct reply contained.
#[derive(Debug, PartialEq)]
pub enum ReactParse {
    /// `Final Answer:` text
    Final(String),
    /// One well-formed action block
    Act {
        thought: Option<String>,
        action: Action,
        /// Further action blocks that were dropped
        ignored: usize,
    },
    /// No action pattern at all
    Plain,
    /// An action pattern that could not be recovered
    Malformed(String),
}

fn regex(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

/// Parse a ReAct-style reply. Tolerates prose before and after the block.
pub fn parse_react(text: &str) -> ReactParse {
    static FINAL: OnceLock<Option<Regex>> = OnceLock::new();
    static ACTION: OnceLock<Option<Regex>> = OnceLock::new();
    static THOUGHT: OnceLock<Option<Regex>> = OnceLock::new();

    let (Some(final_re), Some(action_re), Some(thought_re)) = (
        regex(&FINAL, r"(?s)Final Answer:\s*(.+)"),
        regex(&ACTION, r"(?m)^[ \t>*_]*Action:[ \t]*`?([A-Za-z_][A-Za-z0-9_.\-]*)`?[ \t]*$"),
        regex(&THOUGHT, r"(?s)Thought:\s*(.*)"),
    ) else {
        return ReactParse::Plain;
    };

    if let Some(caps) = final_re.captures(text) {
        let answer = caps[1].trim().to_string();
        if !answer.is_empty() {
            return ReactParse::Final(answer);
        }
    }

    let mut matches = action_re.captures_iter(text);
    let Some(first) = matches.next() else {
        if text.contains("Action:") || text.contains("Action Input:") {
            return ReactParse::Malformed("'Action:' without a valid tool name".into());
        }
        return ReactParse::Plain;
    };
    let ignored = matches.count();

    let (Some(whole), Some(name)) = (first.get(0), first.get(1)) else {
        return ReactParse::Plain;
    };
    let tool = name.as_str().to_string();
    let after = &text[whole.end()..];

    let Some(input_pos) = after.find("Action Input:") else {
        return ReactParse::Malformed(format!("no 'Action Input:' for tool '{tool}'"));
    };
    let raw_input = strip_fence(&after[input_pos + "Action Input:".len()..]);

    let Some(json_text) = extract_json_object(raw_input) else {
        return ReactParse::Malformed(format!("no JSON object after 'Action Input:' for '{tool}'"));
    };
    let arguments: serde_json::Value = match serde_json::from_str(json_text) {
        Ok(value @ serde_json::Value::Object(_)) => value,
        Ok(_) => return ReactParse::Malformed("Action Input is not a JSON object".into()),
        Err(e) => return ReactParse::Malformed(format!("invalid Action Input JSON: {e}")),
    };

    let before = &text[..whole.start()];
    let thought = thought_re
        .captures(before)
        .map(|c| c[1].trim().to_string())
        .unwrap_or_else(|| before.trim().to_string());

    let id = format!("react_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);

    ReactParse::Act {
        thought: (!thought.is_empty()).then_some(thought),
        action: Action::new(id, tool, arguments),
        ignored,
    }
}

/// Skip leading whitespace and an optional markdown code fence.
fn strip_fence(s: &str) -> &str {
    let s = s.trim_start();
    match s.strip_prefix("```") {
        Some(rest) => {
            let rest = rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric());
            rest.trim_start()
        }
        None => s,
    }
}

/// Return the balanced `{...}` at the start of `s`, respecting JSON strings.
fn extract_json_object(s: &str) -> Option<&str> {
    if !s.starts_with('{') {
        return None;
    }
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}
