//! Spawn & die: launch a successor, wait for it to report healthy, and roll
//! back on failure.
//!
//! The old process writes a checkpoint file, launches the successor with
//! `OUROBOROS_RESTARTED=1` and the checkpoint path in its environment, and
//! polls the checkpoint. The successor marks it healthy once its runtime is
//! up ([`confirm_startup`]). If that does not happen within the startup
//! window, the successor is killed, the pending commits are reverted and a
//! new successor is launched, up to `max_rollbacks` times.

use crate::git::VersionControl;
use crate::manager::{RestartRequest, SelfModManager};
use crate::record::ModificationOutcome;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ouroboros_core::error::ModificationError;
use ouroboros_core::journal::{Journal, JournalEntry, JournalKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub const RESTARTED_ENV: &str = "OUROBOROS_RESTARTED";
pub const CHECKPOINT_ENV: &str = "OUROBOROS_CHECKPOINT";

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Starting,
    Healthy,
}

/// Durable hand-off record between the old and the new process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartCheckpoint {
    /// 0 for the first launch, n for the n-th rollback
    pub attempt: u32,
    pub target_commit: String,
    pub last_good_commit: String,
    pub record_ids: Vec<String>,
    pub status: CheckpointStatus,
    pub updated_at: DateTime<Utc>,
}

impl RestartCheckpoint {
    pub fn load(path: &Path) -> Result<Option<Self>, ModificationError> {
        match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).map(Some).map_err(|e| ModificationError::Io {
                path: path.display().to_string(),
                reason: format!("corrupt checkpoint: {e}"),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ModificationError::Io {
                path: path.display().to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Write via a temp file and rename so readers never see half a file.
    pub fn store(&self, path: &Path) -> Result<(), ModificationError> {
        let io_error = |e: std::io::Error| ModificationError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }
        let json = serde_json::to_vec_pretty(self).map_err(|e| ModificationError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(io_error)?;
        std::fs::rename(&tmp, path).map_err(io_error)
    }
}

/// Called in the successor once it is up. Returns the checkpoint it confirmed.
pub fn confirm_startup(path: &Path) -> Result<Option<RestartCheckpoint>, ModificationError> {
    let Some(mut checkpoint) = RestartCheckpoint::load(path)? else {
        warn!(path = %path.display(), "Restarted without a checkpoint");
        return Ok(None);
    };
    if checkpoint.status == CheckpointStatus::Starting {
        checkpoint.status = CheckpointStatus::Healthy;
        checkpoint.updated_at = Utc::now();
        checkpoint.store(path)?;
        info!(attempt = checkpoint.attempt, commit = %checkpoint.target_commit, "Startup confirmed healthy");
    }
    Ok(Some(checkpoint))
}

/// Whether this process was launched as a successor.
pub fn is_restarted_instance() -> bool {
    std::env::var(RESTARTED_ENV).is_ok_and(|v| v == "1")
}

/// A launched successor process.
#[async_trait]
pub trait LaunchedProcess: Send {
    fn id(&self) -> Option<u32>;

    /// `Some(description)` once the process has exited.
    fn exit_status(&mut self) -> Option<String>;

    async fn kill(&mut self) -> Result<(), ModificationError>;
}

/// Starts successor processes.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, env: Vec<(String, String)>) -> Result<Box<dyn LaunchedProcess>, ModificationError>;
}

/// Rebuilds the agent from its project root, then launches the result.
///
/// The successor must run the just-committed source, so the default
/// configuration compiles the project and starts the fresh binary. A build
/// that fails or overruns its timeout is reported as
/// [`ModificationError::BuildFailed`] and counts as an unhealthy launch.
pub struct CommandLauncher {
    build: Option<BuildStep>,
    program: PathBuf,
    args: Vec<String>,
    working_dir: PathBuf,
}

struct BuildStep {
    command: Vec<String>,
    timeout: Duration,
}

impl CommandLauncher {
    /// `command` empty means the current executable. A relative program with
    /// a directory part (`target/release/ouroboros`) resolves against
    /// `working_dir`. `args` follow the command's own arguments.
    pub fn new(
        command: &[String],
        args: Vec<String>,
        working_dir: impl Into<PathBuf>,
    ) -> Result<Self, ModificationError> {
        let working_dir = working_dir.into();
        let (program, mut full_args) = match command.split_first() {
            Some((program, fixed)) => {
                let program = PathBuf::from(program);
                let program = if program.is_relative() && program.components().count() > 1 {
                    working_dir.join(program)
                } else {
                    program
                };
                (program, fixed.to_vec())
            }
            None => (
                std::env::current_exe().map_err(|e| ModificationError::Io {
                    path: "current_exe".into(),
                    reason: e.to_string(),
                })?,
                Vec::new(),
            ),
        };
        full_args.extend(args);
        Ok(Self {
            build: None,
            program,
            args: full_args,
            working_dir,
        })
    }

    /// Run `command` in the working directory before every launch. Empty
    /// disables the build.
    pub fn with_build(mut self, command: &[String], timeout: Duration) -> Self {
        self.build = (!command.is_empty()).then(|| BuildStep {
            command: command.to_vec(),
            timeout,
        });
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn build_command(&self) -> Option<&[String]> {
        self.build.as_ref().map(|b| b.command.as_slice())
    }

    async fn rebuild(&self, step: &BuildStep) -> Result<(), ModificationError> {
        let Some((program, args)) = step.command.split_first() else {
            return Ok(());
        };
        info!(command = %step.command.join(" "), "Rebuilding before relaunch");
        let mut command = tokio::process::Command::new(program);
        command.args(args).current_dir(&self.working_dir).kill_on_drop(true);
        let output = tokio::time::timeout(step.timeout, command.output())
            .await
            .map_err(|_| ModificationError::BuildFailed(format!("timed out after {}s", step.timeout.as_secs())))?
            .map_err(|e| ModificationError::BuildFailed(format!("could not run {program}: {e}")))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: Vec<&str> = stderr.lines().rev().take(20).collect();
        let tail: Vec<&str> = tail.into_iter().rev().collect();
        Err(ModificationError::BuildFailed(format!(
            "{}: {}",
            output.status,
            tail.join("\n")
        )))
    }
}

struct ChildProcess(tokio::process::Child);

#[async_trait]
impl LaunchedProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.0.id()
    }

    fn exit_status(&mut self) -> Option<String> {
        match self.0.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(format!("unknown ({e})")),
        }
    }

    async fn kill(&mut self) -> Result<(), ModificationError> {
        self.0
            .kill()
            .await
            .map_err(|e| ModificationError::HealthCheckFailed(format!("kill failed: {e}")))
    }
}

#[async_trait]
impl ProcessLauncher for CommandLauncher {
    async fn launch(&self, env: Vec<(String, String)>) -> Result<Box<dyn LaunchedProcess>, ModificationError> {
        if let Some(step) = &self.build {
            self.rebuild(step).await?;
        }
        let child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .current_dir(&self.working_dir)
            .envs(env)
            .spawn()
            .map_err(|e| ModificationError::HealthCheckFailed(format!(
                "failed to launch {}: {e}",
                self.program.display()
            )))?;
        info!(pid = ?child.id(), program = %self.program.display(), "Launched successor");
        Ok(Box::new(ChildProcess(child)))
    }
}

/// How a restart ended when it did not fail fatally.
#[derive(Debug, Clone, PartialEq)]
pub enum RestartOutcome {
    /// A successor is healthy; this process must exit now
    Replaced {
        attempt: u32,
        commit: String,
        rolled_back: bool,
    },
}

#[derive(Debug, Clone)]
pub struct RestartSettings {
    pub startup_window: Duration,
    pub max_rollbacks: u32,
    pub checkpoint_path: PathBuf,
}

pub struct RestartManager {
    manager: Arc<SelfModManager>,
    launcher: Arc<dyn ProcessLauncher>,
    settings: RestartSettings,
    journal: Option<Arc<dyn Journal>>,
}

impl RestartManager {
    pub fn new(
        manager: Arc<SelfModManager>,
        launcher: Arc<dyn ProcessLauncher>,
        settings: RestartSettings,
    ) -> Self {
        Self {
            manager,
            launcher,
            settings,
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: Arc<dyn Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Replace the process. The caller must have flushed its state and must
    /// exit on `Ok`. `FatalStartup` means the rollback cap was exceeded.
    pub async fn execute(&self, request: &RestartRequest) -> Result<RestartOutcome, ModificationError> {
        let vcs: &Arc<dyn VersionControl> = self.manager.version_control();
        let log = self.manager.log();
        let mut rolled_back = false;

        for attempt in 0..=self.settings.max_rollbacks {
            let target_commit = vcs.head().await?;
            let checkpoint = RestartCheckpoint {
                attempt,
                target_commit: target_commit.clone(),
                last_good_commit: request.last_good_commit.clone(),
                record_ids: request.record_ids.clone(),
                status: CheckpointStatus::Starting,
                updated_at: Utc::now(),
            };
            checkpoint.store(&self.settings.checkpoint_path)?;

            let env = vec![
                (RESTARTED_ENV.to_string(), "1".to_string()),
                (
                    CHECKPOINT_ENV.to_string(),
                    self.settings.checkpoint_path.display().to_string(),
                ),
            ];

            let failure = match self.launcher.launch(env).await {
                Ok(mut child) => match self.wait_healthy(child.as_mut(), attempt).await {
                    Ok(()) => {
                        if !rolled_back {
                            log.set_outcome(&request.record_ids, ModificationOutcome::Applied)
                                .await?;
                        }
                        self.manager.mark_replaced().await?;
                        self.journal(serde_json::json!({
                            "summary": format!("successor healthy on {target_commit} (attempt {attempt})"),
                            "attempt": attempt,
                            "rolled_back": rolled_back,
                        }))
                        .await;
                        return Ok(RestartOutcome::Replaced {
                            attempt,
                            commit: target_commit,
                            rolled_back,
                        });
                    }
                    Err(reason) => {
                        if let Err(e) = child.kill().await {
                            warn!(error = %e, "Could not kill unhealthy successor");
                        }
                        reason
                    }
                },
                // A broken build is the new code failing, not the launcher.
                Err(ModificationError::BuildFailed(reason)) => format!("build failed: {reason}"),
                Err(e) if attempt == 0 => {
                    // Nothing was replaced: keep running this process.
                    self.manager.abort_restart(&e.to_string()).await?;
                    return Err(e);
                }
                Err(e) => e.to_string(),
            };

            warn!(attempt, reason = %failure, "Successor failed health check");
            self.journal(serde_json::json!({
                "summary": format!("successor unhealthy (attempt {attempt}): {failure}"),
                "attempt": attempt,
            }))
            .await;

            if attempt == self.settings.max_rollbacks {
                break;
            }

            vcs.revert_to(&request.last_good_commit).await?;
            if !rolled_back {
                log.set_outcome(&request.record_ids, ModificationOutcome::Reverted)
                    .await?;
                rolled_back = true;
            }
            info!(good = %request.last_good_commit, "Rolled back, relaunching");
        }

        let attempts = self.settings.max_rollbacks + 1;
        error!(attempts, "Startup failed after all rollbacks");
        self.journal(serde_json::json!({
            "summary": format!("fatal startup failure after {attempts} launches"),
        }))
        .await;
        Err(ModificationError::FatalStartup { attempts })
    }

    /// Poll the checkpoint until the successor confirms or the window ends.
    async fn wait_healthy(&self, child: &mut dyn LaunchedProcess, attempt: u32) -> Result<(), String> {
        let deadline = tokio::time::Instant::now() + self.settings.startup_window;
        loop {
            match RestartCheckpoint::load(&self.settings.checkpoint_path) {
                Ok(Some(cp)) if cp.attempt == attempt && cp.status == CheckpointStatus::Healthy => {
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Unreadable checkpoint while waiting"),
            }
            if let Some(status) = child.exit_status() {
                return Err(format!("successor exited before becoming healthy: {status}"));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(format!(
                    "not healthy within {}s",
                    self.settings.startup_window.as_secs()
                ));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn journal(&self, payload: serde_json::Value) {
        if let Some(journal) = &self.journal
            && let Err(e) = journal.append(JournalEntry::new(None, JournalKind::Restart, payload)).await
        {
            warn!(error = %e, "Failed to journal restart event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::tests::manager;
    use crate::state::ModState;
    use std::sync::Mutex;

    #[derive(Clone, Copy)]
    enum Launch {
        Healthy,
        Exits,
        BuildFails,
    }
    use Launch::*;

    /// Each launch pops the next behaviour; an empty script exits.
    struct ScriptedLauncher {
        script: Mutex<Vec<Launch>>,
        launches: Mutex<Vec<Vec<(String, String)>>>,
    }

    impl ScriptedLauncher {
        fn new(mut script: Vec<Launch>) -> Arc<Self> {
            script.reverse();
            Arc::new(Self {
                script: Mutex::new(script),
                launches: Mutex::new(Vec::new()),
            })
        }
    }

    struct FakeChild {
        exited: bool,
    }

    #[async_trait]
    impl LaunchedProcess for FakeChild {
        fn id(&self) -> Option<u32> {
            Some(42)
        }
        fn exit_status(&mut self) -> Option<String> {
            self.exited.then(|| "exit status: 101".to_string())
        }
        async fn kill(&mut self) -> Result<(), ModificationError> {
            self.exited = true;
            Ok(())
        }
    }

    #[async_trait]
    impl ProcessLauncher for ScriptedLauncher {
        async fn launch(&self, env: Vec<(String, String)>) -> Result<Box<dyn LaunchedProcess>, ModificationError> {
            let behaviour = self.script.lock().unwrap().pop().unwrap_or(Exits);
            let checkpoint = env
                .iter()
                .find(|(k, _)| k == CHECKPOINT_ENV)
                .map(|(_, v)| PathBuf::from(v))
                .unwrap();
            self.launches.lock().unwrap().push(env);
            match behaviour {
                Healthy => {
                    confirm_startup(&checkpoint).unwrap();
                    Ok(Box::new(FakeChild { exited: false }))
                }
                Exits => Ok(Box::new(FakeChild { exited: true })),
                BuildFails => Err(ModificationError::BuildFailed("error[E0308]: mismatched types".into())),
            }
        }
    }

    async fn setup(
        dir: &Path,
        script: Vec<Launch>,
        max_rollbacks: u32,
    ) -> (Arc<SelfModManager>, RestartManager, Arc<ScriptedLauncher>, RestartRequest) {
        let (manager, _vcs) = manager(dir).await;
        let manager = Arc::new(manager);
        manager.write_source("src/lib.rs", "changed").await.unwrap();
        let request = manager.request_restart("test").await.unwrap();
        let launcher = ScriptedLauncher::new(script);
        let restart = RestartManager::new(
            manager.clone(),
            launcher.clone(),
            RestartSettings {
                startup_window: Duration::from_secs(2),
                max_rollbacks,
                checkpoint_path: dir.join("state/restart.json"),
            },
        );
        (manager, restart, launcher, request)
    }

    #[tokio::test]
    async fn healthy_successor_applies_records() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, restart, launcher, request) = setup(dir.path(), vec![Healthy], 2).await;

        let outcome = restart.execute(&request).await.unwrap();
        assert_eq!(
            outcome,
            RestartOutcome::Replaced {
                attempt: 0,
                commit: "c1".into(),
                rolled_back: false
            }
        );
        assert_eq!(manager.state().await, ModState::ProcessReplaced);
        let record = manager.log().get(&request.record_ids[0]).await.unwrap();
        assert_eq!(record.outcome, ModificationOutcome::Applied);

        let launches = launcher.launches.lock().unwrap();
        assert!(launches[0].contains(&(RESTARTED_ENV.to_string(), "1".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_successor_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, restart, launcher, request) = setup(dir.path(), vec![Exits, Healthy], 2).await;

        let outcome = restart.execute(&request).await.unwrap();
        assert!(matches!(
            outcome,
            RestartOutcome::Replaced { attempt: 1, rolled_back: true, .. }
        ));
        let record = manager.log().get(&request.record_ids[0]).await.unwrap();
        assert_eq!(record.outcome, ModificationOutcome::Reverted);
        assert_eq!(launcher.launches.lock().unwrap().len(), 2);

        let checkpoint = RestartCheckpoint::load(&dir.path().join("state/restart.json"))
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint.attempt, 1);
        assert_eq!(checkpoint.last_good_commit, "c0");
        assert_eq!(checkpoint.status, CheckpointStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn rollback_cap_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (_manager, restart, launcher, request) =
            setup(dir.path(), vec![Exits, Exits, Exits, Healthy], 2).await;

        let err = restart.execute(&request).await.unwrap_err();
        assert!(matches!(err, ModificationError::FatalStartup { attempts: 3 }));
        assert!(err.is_fatal());
        assert_eq!(launcher.launches.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_build_rolls_back_instead_of_aborting() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, restart, launcher, request) = setup(dir.path(), vec![BuildFails, Healthy], 2).await;

        let outcome = restart.execute(&request).await.unwrap();
        assert!(matches!(
            outcome,
            RestartOutcome::Replaced { attempt: 1, rolled_back: true, .. }
        ));
        assert_eq!(launcher.launches.lock().unwrap().len(), 2);
        let record = manager.log().get(&request.record_ids[0]).await.unwrap();
        assert_eq!(record.outcome, ModificationOutcome::Reverted);
    }

    #[test]
    fn launcher_runs_the_binary_built_in_the_project() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = CommandLauncher::new(
            &["target/release/ouroboros".to_string()],
            vec!["run".into(), "--resume-only".into()],
            dir.path(),
        )
        .unwrap()
        .with_build(&["cargo".into(), "build".into(), "--release".into()], Duration::from_secs(600));

        assert_eq!(launcher.program(), dir.path().join("target/release/ouroboros"));
        assert_eq!(launcher.args(), ["run", "--resume-only"]);
        assert_eq!(launcher.build_command().unwrap()[0], "cargo");
    }

    #[test]
    fn bare_program_names_are_left_to_path_lookup() {
        let launcher = CommandLauncher::new(&["ouroboros".into(), "run".into()], vec!["-v".into()], "/srv/agent").unwrap();
        assert_eq!(launcher.program(), Path::new("ouroboros"));
        assert_eq!(launcher.args(), ["run", "-v"]);
        assert!(launcher.build_command().is_none());
    }

    #[test]
    fn empty_command_relaunches_the_current_executable() {
        let launcher = CommandLauncher::new(&[], vec!["run".into()], ".").unwrap();
        assert_eq!(launcher.program(), std::env::current_exe().unwrap());
        assert_eq!(launcher.args(), ["run"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn build_failure_is_reported_before_launch() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = CommandLauncher::new(&["sh".into(), "-c".into(), "exit 0".into()], vec![], dir.path())
            .unwrap()
            .with_build(
                &["sh".into(), "-c".into(), "echo 'error: expected one of' >&2; exit 101".into()],
                Duration::from_secs(30),
            );

        let reason = match launcher.launch(vec![]).await.err().unwrap() {
            ModificationError::BuildFailed(reason) => reason,
            other => panic!("expected a build failure, got {other:?}"),
        };
        assert!(reason.contains("expected one of"), "{reason}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_build_launches_the_program() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = CommandLauncher::new(&["sh".into(), "-c".into(), "exit 0".into()], vec![], dir.path())
            .unwrap()
            .with_build(&["true".into()], Duration::from_secs(30));

        let mut child = launcher.launch(vec![]).await.unwrap();
        let mut status = None;
        for _ in 0..100 {
            status = child.exit_status();
            if status.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(status.unwrap().contains('0'));
    }

    #[test]
    fn confirm_without_checkpoint_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        assert!(confirm_startup(&dir.path().join("none.json")).unwrap().is_none());
    }
}
