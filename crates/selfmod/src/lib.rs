//! Self-modification for Ouroboros.
//!
//! The agent reads and rewrites its own source through [`SelfModManager`];
//! every write is a version-control commit with a durable
//! [`ModificationRecord`]. Source changes go live through a spawn & die
//! restart ([`RestartManager`]), which rolls back to the last good commit
//! when the successor does not come up healthy.

pub mod git;
pub mod manager;
pub mod record;
pub mod restart;
pub mod state;
pub mod tool;

use ouroboros_config::AppConfig;
use ouroboros_core::error::ModificationError;
use ouroboros_core::journal::Journal;
use std::sync::Arc;
use std::time::Duration;

pub use git::{GitRepo, VersionControl};
pub use manager::{RestartRequest, SelfModManager, WriteOutcome, requires_restart};
pub use record::{ModificationLog, ModificationOutcome, ModificationRecord};
pub use restart::{
    CHECKPOINT_ENV, CheckpointStatus, CommandLauncher, LaunchedProcess, ProcessLauncher,
    RESTARTED_ENV, RestartCheckpoint, RestartManager, RestartOutcome, RestartSettings,
    confirm_startup, is_restarted_instance,
};
pub use state::{ModEvent, ModState};
pub use tool::SelfModifyTool;

/// Git-backed manager with its log under the state directory.
pub async fn manager_from_config(config: &AppConfig, journal: Option<Arc<dyn Journal>>) -> SelfModManager {
    let root = config.self_modify.project_root();
    let log = Arc::new(ModificationLog::open(config.state.modifications_path()));
    let manager = SelfModManager::new(&root, Arc::new(GitRepo::new(&root)), log)
        .await
        .with_read_limit(config.self_modify.source_read_limit);
    match journal {
        Some(journal) => manager.with_journal(journal),
        None => manager,
    }
}

pub fn restart_settings(config: &AppConfig) -> RestartSettings {
    RestartSettings {
        startup_window: Duration::from_secs(config.self_modify.startup_window_secs),
        max_rollbacks: config.self_modify.max_rollbacks,
        checkpoint_path: config.state.checkpoint_path(),
    }
}

/// The configured successor: rebuild the project, then run the binary with
/// `successor_args`.
pub fn launcher_from_config(
    config: &AppConfig,
    successor_args: Vec<String>,
) -> Result<CommandLauncher, ModificationError> {
    let settings = &config.self_modify;
    Ok(
        CommandLauncher::new(&settings.restart_command, successor_args, settings.project_root())?
            .with_build(&settings.build_command, Duration::from_secs(settings.build_timeout_secs)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_launcher_rebuilds_the_project() {
        let mut config = AppConfig::default();
        config.self_modify.project_root = Some("/srv/ouroboros".into());

        let launcher = launcher_from_config(&config, vec!["run".into()]).unwrap();
        assert_eq!(launcher.program(), std::path::Path::new("/srv/ouroboros/target/release/ouroboros"));
        assert_eq!(launcher.args(), ["run"]);
        assert_eq!(
            launcher.build_command().unwrap(),
            ["cargo", "build", "--release", "--bin", "ouroboros"]
        );
    }
}
