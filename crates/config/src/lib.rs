//! Configuration loading, validation, and management for Ouroboros.
//!
//! Loads configuration from `~/.ouroboros/config.toml`, substitutes
//! `${VAR}` references from the environment, then applies environment
//! variable overrides. Validates all settings at startup.

use ouroboros_core::AutonomyLevel;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// The root configuration structure.
///
/// Maps directly to `~/.ouroboros/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key (can be overridden per-provider)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Default LLM provider
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Default model
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Default max tokens per LLM response
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    /// Agent loop settings
    #[serde(default)]
    pub agent: AgentSettings,

    /// Provider retry policy
    #[serde(default)]
    pub retry: RetrySettings,

    /// Provider-specific configurations
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    /// Tool registry and builtin tool settings
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Knowledge files
    #[serde(default)]
    pub knowledge: KnowledgeConfig,

    /// Self-modification and restart settings
    #[serde(default)]
    pub self_modify: SelfModifyConfig,

    /// Durable state location
    #[serde(default)]
    pub state: StateConfig,
}

fn default_provider() -> String {
    "openai".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("default_provider", &self.default_provider)
            .field("default_model", &self.default_model)
            .field("default_temperature", &self.default_temperature)
            .field("default_max_tokens", &self.default_max_tokens)
            .field("agent", &self.agent)
            .field("retry", &self.retry)
            .field("providers", &self.providers)
            .field("tools", &self.tools)
            .field("knowledge", &self.knowledge)
            .field("self_modify", &self.self_modify)
            .field("state", &self.state)
            .finish()
    }
}

/// Agent loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Think/act/observe cycles per turn before giving up
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Process-wide autonomy level (overridable per conversation)
    #[serde(default)]
    pub autonomy: AutonomyLevel,

    /// Turns of history sent to the model
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Journal incidents surfaced to the model per think step
    #[serde(default = "default_journal_context_limit")]
    pub journal_context_limit: usize,

    /// Conversations allowed to run cycles at the same time
    #[serde(default = "default_execution_slots")]
    pub execution_slots: usize,
}

fn default_max_iterations() -> u32 {
    25
}
fn default_history_limit() -> usize {
    40
}
fn default_journal_context_limit() -> usize {
    10
}
fn default_execution_slots() -> usize {
    8
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            autonomy: AutonomyLevel::default(),
            history_limit: default_history_limit(),
            journal_context_limit: default_journal_context_limit(),
            execution_slots: default_execution_slots(),
        }
    }
}

/// Bounded exponential backoff for transient provider failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    8_000
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// One configured chat backend.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider implementation (`openai_compat`)
    #[serde(default = "default_provider_kind")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,

    /// `false` wraps the provider in the ReAct text protocol
    #[serde(default = "default_true")]
    pub native_tools: bool,
}

fn default_provider_kind() -> String {
    "openai_compat".into()
}
fn default_true() -> bool {
    true
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("kind", &self.kind)
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("default_model", &self.default_model)
            .field("native_tools", &self.native_tools)
            .finish()
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: default_provider_kind(),
            api_key: None,
            api_url: None,
            default_model: None,
            native_tools: true,
        }
    }
}

/// Tool registry and builtin tool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Directories scanned for `*.tool.toml` manifests on startup and reload
    #[serde(default = "default_extension_dirs")]
    pub extension_dirs: Vec<PathBuf>,

    /// File tools may only touch these roots (empty = anywhere)
    #[serde(default)]
    pub allowed_roots: Vec<String>,

    #[serde(default = "default_forbidden_paths")]
    pub forbidden_paths: Vec<String>,

    /// Shell command allowlist (empty = all)
    #[serde(default)]
    pub allowed_commands: Vec<String>,

    #[serde(default = "default_shell_timeout")]
    pub shell_timeout_secs: u64,

    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    #[serde(default = "default_fetch_max_bytes")]
    pub fetch_max_bytes: usize,
}

fn default_extension_dirs() -> Vec<PathBuf> {
    vec![AppConfig::config_dir().join("extensions")]
}
fn default_forbidden_paths() -> Vec<String> {
    vec![
        "/etc".into(),
        "/root/.ssh".into(),
        "~/.ssh".into(),
        "~/.gnupg".into(),
        "~/.aws".into(),
    ]
}
fn default_shell_timeout() -> u64 {
    60
}
fn default_fetch_timeout() -> u64 {
    30
}
fn default_fetch_max_bytes() -> usize {
    100_000
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            extension_dirs: default_extension_dirs(),
            allowed_roots: Vec::new(),
            forbidden_paths: default_forbidden_paths(),
            allowed_commands: Vec::new(),
            shell_timeout_secs: default_shell_timeout(),
            fetch_timeout_secs: default_fetch_timeout(),
            fetch_max_bytes: default_fetch_max_bytes(),
        }
    }
}

/// Knowledge files feeding the system prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeConfig {
    #[serde(default = "default_knowledge_dir")]
    pub dir: PathBuf,

    #[serde(default)]
    pub extra_files: Vec<PathBuf>,
}

fn default_knowledge_dir() -> PathBuf {
    AppConfig::config_dir().join("knowledge")
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            dir: default_knowledge_dir(),
            extra_files: Vec::new(),
        }
    }
}

/// Self-modification and restart settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfModifyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Repository holding the agent's own source (default: working directory)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_root: Option<PathBuf>,

    /// How long a relaunched process has to report healthy
    #[serde(default = "default_startup_window")]
    pub startup_window_secs: u64,

    /// Rollbacks attempted before giving up with a fatal startup error
    #[serde(default = "default_max_rollbacks")]
    pub max_rollbacks: u32,

    /// Characters returned by `read_source`
    #[serde(default = "default_source_read_limit")]
    pub source_read_limit: usize,

    /// Run in `project_root` before every relaunch so the successor runs the
    /// committed source (empty = no build)
    #[serde(default = "default_build_command")]
    pub build_command: Vec<String>,

    /// Time allowed for `build_command`, separate from the startup window
    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,

    /// Successor program, relative paths resolved against `project_root`
    /// (empty = current executable)
    #[serde(default = "default_restart_command")]
    pub restart_command: Vec<String>,
}

fn default_startup_window() -> u64 {
    30
}
fn default_build_command() -> Vec<String> {
    ["cargo", "build", "--release", "--bin", "ouroboros"]
        .map(String::from)
        .to_vec()
}
fn default_build_timeout() -> u64 {
    900
}
fn default_restart_command() -> Vec<String> {
    vec!["target/release/ouroboros".into()]
}
fn default_max_rollbacks() -> u32 {
    2
}
fn default_source_read_limit() -> usize {
    50_000
}

impl Default for SelfModifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            project_root: None,
            startup_window_secs: default_startup_window(),
            max_rollbacks: default_max_rollbacks(),
            source_read_limit: default_source_read_limit(),
            build_command: default_build_command(),
            build_timeout_secs: default_build_timeout(),
            restart_command: default_restart_command(),
        }
    }
}

impl SelfModifyConfig {
    pub fn project_root(&self) -> PathBuf {
        self.project_root
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Where durable runtime state lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
}

fn default_state_dir() -> PathBuf {
    AppConfig::config_dir().join("state")
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
        }
    }
}

impl StateConfig {
    pub fn journal_path(&self) -> PathBuf {
        self.dir.join("journal.jsonl")
    }

    pub fn modifications_path(&self) -> PathBuf {
        self.dir.join("modifications.jsonl")
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.dir.join("restart.json")
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.ouroboros/config.toml).
    ///
    /// Environment overrides (highest priority):
    /// - `OUROBOROS_API_KEY`, then `OPENAI_API_KEY`
    /// - `OUROBOROS_PROVIDER`, `OUROBOROS_MODEL`
    /// - `OUROBOROS_AUTONOMY`, `OUROBOROS_STATE_DIR`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        Self::load_with_env(&config_path)
    }

    /// Load from `path`, then apply environment overrides.
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let content = substitute_env(&raw, |key| std::env::var(key).ok());

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if self.api_key.is_none() {
            self.api_key = lookup("OUROBOROS_API_KEY").or_else(|| lookup("OPENAI_API_KEY"));
        }
        if let Some(provider) = lookup("OUROBOROS_PROVIDER") {
            self.default_provider = provider;
        }
        if let Some(model) = lookup("OUROBOROS_MODEL") {
            self.default_model = model;
        }
        if let Some(level) = lookup("OUROBOROS_AUTONOMY") {
            self.agent.autonomy = level.parse().map_err(ConfigError::ValidationError)?;
        }
        if let Some(dir) = lookup("OUROBOROS_STATE_DIR") {
            self.state.dir = PathBuf::from(dir);
        }
        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".ouroboros")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_temperature < 0.0 || self.default_temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "default_temperature must be between 0.0 and 2.0".into(),
            ));
        }
        if self.agent.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_iterations must be at least 1".into(),
            ));
        }
        if self.agent.execution_slots == 0 {
            return Err(ConfigError::ValidationError(
                "agent.execution_slots must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.self_modify.startup_window_secs == 0 {
            return Err(ConfigError::ValidationError(
                "self_modify.startup_window_secs must be at least 1".into(),
            ));
        }
        if !self.self_modify.build_command.is_empty() && self.self_modify.build_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "self_modify.build_timeout_secs must be at least 1 when a build command is set".into(),
            ));
        }
        for (name, provider) in &self.providers {
            if provider.kind != "openai_compat" {
                return Err(ConfigError::ValidationError(format!(
                    "provider '{name}' has unknown kind '{}'",
                    provider.kind
                )));
            }
        }
        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some() || self.providers.values().any(|p| p.api_key.is_some())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            default_provider: default_provider(),
            default_model: default_model(),
            default_temperature: default_temperature(),
            default_max_tokens: default_max_tokens(),
            agent: AgentSettings::default(),
            retry: RetrySettings::default(),
            providers: HashMap::new(),
            tools: ToolsConfig::default(),
            knowledge: KnowledgeConfig::default(),
            self_modify: SelfModifyConfig::default(),
            state: StateConfig::default(),
        }
    }
}

/// Replace `${VAR}` references with values from `lookup`.
///
/// Unset variables become empty strings and are logged.
pub fn substitute_env(content: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    static PATTERN: OnceLock<Option<regex_lite::Regex>> = OnceLock::new();
    let Some(pattern) = PATTERN
        .get_or_init(|| regex_lite::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").ok())
        .as_ref()
    else {
        return content.to_string();
    };

    pattern
        .replace_all(content, |caps: &regex_lite::Captures<'_>| {
            let key = &caps[1];
            lookup(key).unwrap_or_else(|| {
                tracing::warn!(variable = key, "Config references unset environment variable");
                String::new()
            })
        })
        .into_owned()
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.agent.max_iterations, 25);
        assert_eq!(config.agent.autonomy, AutonomyLevel::Careful);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.default_provider, config.default_provider);
        assert_eq!(parsed.self_modify.max_rollbacks, config.self_modify.max_rollbacks);
    }

    #[test]
    fn invalid_temperature_rejected() {
        let config = AppConfig {
            default_temperature: 5.0,
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_limits_rejected() {
        let mut config = AppConfig::default();
        config.agent.max_iterations = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_autonomy_level_fails_to_parse() {
        let result: Result<AppConfig, _> = toml::from_str("[agent]\nautonomy = \"yolo\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.default_provider, "openai");
    }

    #[test]
    fn load_from_file_with_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
default_provider = "local"

[agent]
autonomy = "balanced"
max_iterations = 10

[providers.local]
api_url = "http://localhost:11434/v1"
native_tools = false

[self_modify]
max_rollbacks = 1
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.agent.autonomy, AutonomyLevel::Balanced);
        assert_eq!(config.agent.max_iterations, 10);
        assert!(!config.providers["local"].native_tools);
        assert_eq!(config.providers["local"].kind, "openai_compat");
        assert_eq!(config.self_modify.max_rollbacks, 1);
        assert_eq!(config.retry.base_delay_ms, 500);
    }

    #[test]
    fn unknown_provider_kind_rejected() {
        let result: AppConfig = toml::from_str("[providers.x]\nkind = \"carrier_pigeon\"\n").unwrap();
        assert!(result.validate().is_err());
    }

    #[test]
    fn env_substitution() {
        let text = substitute_env(
            "api_key = \"${MY_KEY}\"\nurl = \"${MISSING}\"",
            env(&[("MY_KEY", "sk-123")]),
        );
        assert_eq!(text, "api_key = \"sk-123\"\nurl = \"\"");
    }

    #[test]
    fn overrides_apply() {
        let mut config = AppConfig::default();
        config
            .apply_overrides(env(&[
                ("OPENAI_API_KEY", "sk-openai"),
                ("OUROBOROS_MODEL", "llama3.1"),
                ("OUROBOROS_AUTONOMY", "paranoid"),
                ("OUROBOROS_STATE_DIR", "/var/lib/ouroboros"),
            ]))
            .unwrap();
        assert_eq!(config.api_key.as_deref(), Some("sk-openai"));
        assert_eq!(config.default_model, "llama3.1");
        assert_eq!(config.agent.autonomy, AutonomyLevel::Paranoid);
        assert_eq!(config.state.journal_path(), PathBuf::from("/var/lib/ouroboros/journal.jsonl"));
    }

    #[test]
    fn bad_autonomy_override_is_an_error() {
        let mut config = AppConfig::default();
        let result = config.apply_overrides(env(&[("OUROBOROS_AUTONOMY", "reckless")]));
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn debug_redacts_keys() {
        let config = AppConfig {
            api_key: Some("sk-secret".into()),
            ..AppConfig::default()
        };
        let text = format!("{config:?}");
        assert!(!text.contains("sk-secret"));
        assert!(text.contains("[REDACTED]"));
    }

    #[test]
    fn relaunch_rebuilds_by_default() {
        let config = AppConfig::default();
        assert_eq!(config.self_modify.build_command[..2], ["cargo", "build"]);
        assert_eq!(config.self_modify.restart_command, ["target/release/ouroboros"]);

        let parsed: AppConfig = toml::from_str("[self_modify]\nbuild_command = []\nrestart_command = []\n").unwrap();
        assert!(parsed.self_modify.build_command.is_empty());
        assert!(parsed.self_modify.restart_command.is_empty());

        let mut config = AppConfig::default();
        config.self_modify.build_timeout_secs = 0;
        assert!(config.validate().is_err());
        config.self_modify.build_command.clear();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("gpt-4o-mini"));
        assert!(toml_str.contains("max_iterations"));
    }
}
