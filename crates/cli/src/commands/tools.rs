//! `ouroboros tools`: list the registered tools.

use ouroboros_config::AppConfig;
use ouroboros_tools::{ToolSnapshot, default_registry};

pub async fn run(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let registry = default_registry(&config.tools);
    let snapshot = registry.snapshot();

    println!("Tools (registry v{})", snapshot.version());
    println!();
    print!("{}", render(&snapshot));
    if config.self_modify.enabled {
        println!("  {:<16} {:<15} {:<10} Read and rewrite the agent's own source", "self_modify", "self_modifying", "pinned");
    }
    if !config.tools.extension_dirs.is_empty() {
        println!();
        for dir in &config.tools.extension_dirs {
            println!("  Extension dir: {}", dir.display());
        }
    }
    Ok(())
}

pub fn render(snapshot: &ToolSnapshot) -> String {
    let mut out = String::new();
    for descriptor in snapshot.descriptors() {
        let origin = snapshot.origin(descriptor.name()).unwrap_or("?");
        let description = descriptor
            .definition
            .description
            .lines()
            .next()
            .unwrap_or_default();
        out.push_str(&format!(
            "  {:<16} {:<15} {:<10} {}\n",
            descriptor.name(),
            descriptor.danger_level().to_string(),
            origin,
            description
        ));
    }
    out
}
