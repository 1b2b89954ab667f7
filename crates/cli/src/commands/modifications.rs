//! `ouroboros modifications`: the self-modification log.

use ouroboros_config::AppConfig;
use ouroboros_selfmod::{ModificationLog, ModificationRecord};

pub async fn run(config: &AppConfig, only_pending: bool) -> Result<(), Box<dyn std::error::Error>> {
    let log = ModificationLog::open(config.state.modifications_path());
    let records = if only_pending {
        log.pending().await
    } else {
        log.all().await
    };

    if records.is_empty() {
        println!("No modifications recorded.");
        return Ok(());
    }
    for record in &records {
        println!("{}", render(record));
    }
    Ok(())
}

fn render(record: &ModificationRecord) -> String {
    format!(
        "{}  {:<16} {}  {}  {}",
        record.created_at.format("%Y-%m-%d %H:%M:%S"),
        record.outcome.to_string(),
        record.short_commit(),
        record.path,
        &record.id[..record.id.len().min(8)],
    )
}
