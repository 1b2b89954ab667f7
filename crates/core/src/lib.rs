//! # Ouroboros Core
//!
//! Domain types, traits, and error definitions for the Ouroboros agent
//! runtime. This crate has **no runtime framework dependencies**: it defines
//! the domain model that every other crate implements against.
//!
//! ## Design Philosophy
//!
//! Every subsystem boundary is a trait here. Implementations live in their
//! respective crates. This enables:
//! - Swapping implementations via configuration
//! - Testing with scripted providers and fake interfaces
//! - A clean dependency graph (all crates depend inward on core)
//!
//! The autonomy gate is the one piece of policy that lives here, as a pure
//! function, so that every caller evaluates it identically.

pub mod action;
pub mod autonomy;
pub mod error;
pub mod interface;
pub mod journal;
pub mod knowledge;
pub mod message;
pub mod provider;
pub mod scheduler;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use action::{Action, ActionOutcome, ActionResult, FailureKind};
pub use autonomy::{AutonomyLevel, GateDecision};
pub use error::{Error, Result};
pub use interface::{Confirmation, ConfirmationRequest, InboundMessage, InboundSource, Interface};
pub use journal::{Journal, JournalEntry, JournalKind};
pub use knowledge::{KnowledgeSection, KnowledgeSource};
pub use message::{Conversation, ConversationId, Role, Turn};
pub use provider::{Decision, Provider, ProviderRequest, ToolDefinition};
pub use scheduler::{Scheduler, WakeUp};
pub use tool::{DangerLevel, Tool, ToolDescriptor, ToolOutput};
