//! `ouroboros config`: configuration management.

use ouroboros_config::AppConfig;
use ouroboros_core::knowledge::AGENT_FILE;
use std::path::Path;

const AGENT_TEMPLATE: &str = "\
You are Ouroboros, a conversational agent that can act on the machine it runs on
and read and rewrite its own source code.

Use tools when they help. Report failures honestly. Before changing your own
source, read it first and keep changes small.
";

pub fn show(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load_with_env(path).map_err(|e| format!("Failed to load config: {e}"))?;
    redact(&mut config);
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

pub fn path(path: &Path) {
    println!("{}", path.display());
}

pub fn validate(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Validating {}...", path.display());
    let config = match AppConfig::load_with_env(path) {
        Ok(config) => config,
        Err(e) => {
            println!("  Config error: {e}");
            return Err(e.into());
        }
    };

    println!("  Config parsed and validated");
    if !config.has_api_key() {
        println!("  Warning: no API key set (OUROBOROS_API_KEY or OPENAI_API_KEY)");
    }
    if !config.knowledge.dir.is_dir() {
        println!(
            "  Warning: knowledge dir {} does not exist",
            config.knowledge.dir.display()
        );
    }
    println!();
    println!("  Provider:  {}", config.default_provider);
    println!("  Model:     {}", config.default_model);
    println!("  Autonomy:  {}", config.agent.autonomy);
    println!("  State:     {}", config.state.dir.display());
    println!(
        "  Self-mod:  {}",
        if config.self_modify.enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

/// Write a default config and an identity file, leaving existing files
/// alone. Knowledge and state live next to the config file.
pub fn init(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    if path.exists() {
        println!("Config exists: {}", path.display());
    } else {
        let mut config = AppConfig::default();
        config.knowledge.dir = dir.join("knowledge");
        config.state.dir = dir.join("state");
        std::fs::write(path, toml::to_string_pretty(&config)?)?;
        println!("Created {}", path.display());
    }

    let config = AppConfig::load_from(path)?;
    std::fs::create_dir_all(&config.knowledge.dir)?;
    let agent_file = config.knowledge.dir.join(AGENT_FILE);
    if !agent_file.exists() {
        std::fs::write(&agent_file, AGENT_TEMPLATE)?;
        println!("Created {}", agent_file.display());
    }
    std::fs::create_dir_all(&config.state.dir)?;
    Ok(())
}

fn redact(config: &mut AppConfig) {
    if config.api_key.is_some() {
        config.api_key = Some("***".into());
    }
    for provider in config.providers.values_mut() {
        if provider.api_key.is_some() {
            provider.api_key = Some("***".into());
        }
    }
}
