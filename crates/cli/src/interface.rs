//! Terminal interface: prints what the runtime delivers and parses what
//! the user types.

use async_trait::async_trait;
use ouroboros_core::autonomy::AutonomyLevel;
use ouroboros_core::error::DeliveryError;
use ouroboros_core::interface::{Confirmation, ConfirmationRequest, Interface};
use ouroboros_core::message::ConversationId;
use std::io::Write;

pub struct CliInterface;

impl CliInterface {
    fn print(&self, text: &str) -> Result<(), DeliveryError> {
        let mut out = std::io::stdout().lock();
        writeln!(out, "{text}")
            .and_then(|_| out.flush())
            .map_err(|e| DeliveryError::Failed {
                interface: "cli".into(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl Interface for CliInterface {
    fn name(&self) -> &str {
        "cli"
    }

    async fn on_reply(&self, _conversation_id: &ConversationId, text: &str) -> Result<(), DeliveryError> {
        let mut rendered = String::from("\n");
        for line in text.lines() {
            rendered.push_str("  Ouroboros > ");
            rendered.push_str(line);
            rendered.push('\n');
        }
        self.print(&rendered)
    }

    async fn on_action_notice(&self, _conversation_id: &ConversationId, summary: &str) -> Result<(), DeliveryError> {
        self.print(&format!("  · {summary}"))
    }

    async fn on_confirmation_request(&self, request: &ConfirmationRequest) -> Result<(), DeliveryError> {
        let mut rendered = String::from("\n");
        for line in request.prompt().lines() {
            rendered.push_str("  ! ");
            rendered.push_str(line);
            rendered.push('\n');
        }
        self.print(&rendered)
    }
}

/// One line of user input.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Message(String),
    Confirm(Confirmation),
    Cancel,
    /// `None` shows the current level
    Autonomy(Option<AutonomyLevel>),
    Reload,
    Tools,
    Status,
    Help,
    Quit,
    Empty,
    Invalid(String),
}

pub fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    if !line.starts_with('/') {
        return match line {
            "exit" | "quit" => Input::Quit,
            _ => Input::Message(line.to_string()),
        };
    }

    let mut parts = line.split_whitespace();
    let command = parts.next().unwrap_or_default();
    let argument = parts.next();
    match command {
        "/approve" | "/yes" => Input::Confirm(Confirmation::approve()),
        "/always" => Input::Confirm(Confirmation::always()),
        "/deny" | "/no" => Input::Confirm(Confirmation::deny()),
        "/cancel" => Input::Cancel,
        "/autonomy" => match argument {
            None => Input::Autonomy(None),
            Some(level) => match level.parse() {
                Ok(level) => Input::Autonomy(Some(level)),
                Err(e) => Input::Invalid(e),
            },
        },
        "/reload" => Input::Reload,
        "/tools" => Input::Tools,
        "/status" => Input::Status,
        "/help" => Input::Help,
        "/quit" | "/exit" => Input::Quit,
        other => Input::Invalid(format!("Unknown command {other}. Type /help.")),
    }
}

pub const HELP: &str = "\
  /approve   run the pending action once
  /always    run it and stop asking for this tool here
  /deny      refuse the pending action
  /cancel    stop the current turn and drop pending actions
  /autonomy [paranoid|careful|balanced|autonomous]
  /reload    rescan tool sources
  /tools     list tools
  /status    uptime, usage counters and busiest tools
  /quit      leave";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_a_message() {
        assert_eq!(parse_input("  read notes.md "), Input::Message("read notes.md".into()));
        assert_eq!(parse_input(""), Input::Empty);
        assert_eq!(parse_input("exit"), Input::Quit);
    }

    #[test]
    fn confirmation_commands() {
        assert_eq!(parse_input("/approve"), Input::Confirm(Confirmation::approve()));
        assert_eq!(parse_input("/always"), Input::Confirm(Confirmation::always()));
        assert_eq!(parse_input("/deny"), Input::Confirm(Confirmation::deny()));
    }

    #[test]
    fn autonomy_command() {
        assert_eq!(parse_input("/autonomy"), Input::Autonomy(None));
        assert_eq!(
            parse_input("/autonomy balanced"),
            Input::Autonomy(Some(AutonomyLevel::Balanced))
        );
        assert!(matches!(parse_input("/autonomy reckless"), Input::Invalid(_)));
    }

    #[test]
    fn status_command() {
        assert_eq!(parse_input("/status"), Input::Status);
        assert!(HELP.contains("/status"));
    }

    #[test]
    fn unknown_command_is_invalid() {
        assert!(matches!(parse_input("/teleport"), Input::Invalid(_)));
    }
}
