//! Error types for the Ouroboros domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant. Everything below
//! [`ModificationError::FatalStartup`] is recoverable inside a cycle and is
//! turned into model-visible context by the agent loop.

use thiserror::Error;

/// The top-level error type for all Ouroboros operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Self-modification errors ---
    #[error("Modification error: {0}")]
    Modification(#[from] ModificationError),

    // --- Journal errors ---
    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    // --- Durable state errors ---
    #[error("State error: {0}")]
    State(#[from] StateError),

    // --- Context assembly errors ---
    #[error("Context assembly failed: {0}")]
    Assembly(#[from] AssemblyError),

    // --- Interface errors ---
    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

impl ProviderError {
    /// Whether a retry with backoff may succeed.
    ///
    /// Network failures, timeouts, rate limiting and server-side (5xx) API
    /// errors are transient. Authentication, configuration and client errors
    /// are not and surface immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) | Self::RateLimited { .. } => true,
            Self::ApiError { status_code, .. } => *status_code >= 500,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Invalid arguments for {tool_name}: {reason}")]
    Validation { tool_name: String, reason: String },

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("Permission denied: {tool_name}: {reason}")]
    PermissionDenied { tool_name: String, reason: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),
}

#[derive(Debug, Error)]
pub enum ModificationError {
    #[error("Path '{path}' is outside the project root")]
    InvalidPath { path: String },

    #[error("I/O error on '{path}': {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to commit change to '{path}': {reason}")]
    Commit { path: String, reason: String },

    #[error("Version control error: {0}")]
    VersionControl(String),

    #[error("Restarted process failed health check: {0}")]
    HealthCheckFailed(String),

    #[error("Rebuilding the agent failed: {0}")]
    BuildFailed(String),

    #[error("Startup failed after {attempts} rollback attempts, operator intervention required")]
    FatalStartup { attempts: u32 },

    #[error("Invalid self-modification transition: {from} cannot handle {event}")]
    InvalidTransition { from: String, event: String },

    #[error("A restart is already in progress")]
    RestartInProgress,
}

impl ModificationError {
    /// Only an exhausted rollback cap is fatal to the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalStartup { .. })
    }
}

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("Journal storage error: {0}")]
    Storage(String),

    #[error("Journal entry could not be encoded: {0}")]
    Encoding(String),
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("State storage error at '{path}': {reason}")]
    Storage { path: String, reason: String },

    #[error("Corrupt state record at '{path}': {reason}")]
    Corrupt { path: String, reason: String },

    #[error("No pending confirmation for conversation {0}")]
    NothingPending(String),
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Delivery via {interface} failed: {reason}")]
    Failed { interface: String, reason: String },

    #[error("Interface closed: {0}")]
    Closed(String),
}

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("Knowledge source '{source_name}' failed: {reason}")]
    Knowledge { source_name: String, reason: String },

    #[error("Journal read failed: {0}")]
    Journal(String),
}
