//! `ouroboros pending`: conversations waiting for a confirmation.

use ouroboros_agent::StateStore;
use ouroboros_config::AppConfig;

pub async fn run(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = StateStore::new(&config.state.dir);
    let pending = store.list_pending().await?;

    if pending.is_empty() {
        println!("No conversations are waiting for confirmation.");
        return Ok(());
    }

    for cycle in &pending {
        let Some(action) = cycle.gated() else {
            continue;
        };
        println!(
            "{}  {}  {} [{}]  suspended {}",
            cycle.conversation_id,
            action.id,
            action.tool,
            action
                .danger
                .map(|d| d.to_string())
                .unwrap_or_else(|| "unknown".into()),
            cycle.suspended_at.format("%Y-%m-%d %H:%M:%S UTC"),
        );
        if cycle.actions.len() > 1 {
            println!("    {} more action(s) queued", cycle.actions.len() - 1);
        }
    }
    Ok(())
}
