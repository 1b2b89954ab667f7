//! Provider registry: name-keyed lookup of configured LLM backends.
//!
//! Backends that cannot emit structured tool calls are wrapped in the
//! [`ReactProvider`] on registration, so the agent loop always sees a
//! provider that yields structured decisions.

use crate::openai_compat::OpenAiCompatProvider;
use crate::react::ReactProvider;
use ouroboros_config::{AppConfig, ProviderConfig};
use ouroboros_core::provider::Provider;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Constructs a provider from its config entry.
type ProviderFactory = fn(name: &str, config: &ProviderConfig, api_key: &str) -> Arc<dyn Provider>;

/// Maps provider names to provider instances.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
    default_provider: String,
}

impl ProviderRegistry {
    /// Create a new registry with a default provider name.
    pub fn new(default_provider: impl Into<String>) -> Self {
        Self {
            providers: HashMap::new(),
            default_provider: default_provider.into(),
        }
    }

    /// Register a provider, adding the ReAct layer when it lacks native tools.
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn Provider>) {
        let name = name.into();
        let provider: Arc<dyn Provider> = if provider.supports_native_tools() {
            provider
        } else {
            debug!(provider = %name, "Wrapping provider with ReAct fallback");
            Arc::new(ReactProvider::new(provider))
        };
        self.providers.insert(name, provider);
    }

    /// Get the default provider.
    pub fn default(&self) -> Option<Arc<dyn Provider>> {
        self.providers.get(&self.default_provider).cloned()
    }

    pub fn default_name(&self) -> &str {
        &self.default_provider
    }

    /// Get a specific provider by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    /// List all registered provider names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

fn factory_for(kind: &str) -> Option<ProviderFactory> {
    match kind {
        "openai_compat" => Some(openai_compat as ProviderFactory),
        _ => None,
    }
}

fn openai_compat(name: &str, config: &ProviderConfig, api_key: &str) -> Arc<dyn Provider> {
    let base_url = config
        .api_url
        .clone()
        .unwrap_or_else(|| default_base_url(name));
    Arc::new(OpenAiCompatProvider::new(name, base_url, api_key).with_native_tools(config.native_tools))
}

/// Build providers from configuration.
pub fn build_from_config(config: &AppConfig) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new(&config.default_provider);

    let mut entries: Vec<(&String, &ProviderConfig)> = config.providers.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));

    for (name, provider_config) in entries {
        let Some(factory) = factory_for(&provider_config.kind) else {
            warn!(provider = %name, kind = %provider_config.kind, "Unknown provider kind, skipping");
            continue;
        };
        let api_key = provider_config
            .api_key
            .clone()
            .or_else(|| config.api_key.clone())
            .unwrap_or_default();
        registry.register(name.clone(), factory(name, provider_config, &api_key));
    }

    // Ensure the default provider exists (even if not explicitly configured)
    if registry.get(&config.default_provider).is_none() {
        let implicit = ProviderConfig::default();
        let api_key = config.api_key.clone().unwrap_or_default();
        if let Some(factory) = factory_for(&implicit.kind) {
            registry.register(
                config.default_provider.clone(),
                factory(&config.default_provider, &implicit, &api_key),
            );
        }
    }

    registry
}

/// Get the default base URL for well-known providers.
fn default_base_url(provider_name: &str) -> String {
    match provider_name {
        "openrouter" => "https://openrouter.ai/api/v1".into(),
        "openai" => "https://api.openai.com/v1".into(),
        "ollama" => "http://localhost:11434/v1".into(),
        "deepseek" => "https://api.deepseek.com/v1".into(),
        "groq" => "https://api.groq.com/openai/v1".into(),
        "together" => "https://api.together.xyz/v1".into(),
        "vllm" => "http://localhost:8000/v1".into(),
        "llamacpp" | "llama.cpp" => "http://localhost:8080/v1".into(),
        _ => "http://localhost:8080/v1".into(),
    }
}
