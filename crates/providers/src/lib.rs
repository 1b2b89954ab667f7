//! LLM provider implementations for Ouroboros.
//!
//! All providers implement the `ouroboros_core::Provider` trait.
//! The registry selects the correct provider based on configuration and adds
//! the ReAct layer for backends without native tool calling.

pub mod openai_compat;
pub mod react;
pub mod retry;
pub mod router;

pub use openai_compat::OpenAiCompatProvider;
pub use react::ReactProvider;
pub use retry::{RetryAttempt, RetryExhausted, RetryPolicy, chat_with_retry};
pub use router::{ProviderRegistry, build_from_config};
