//! `ouroboros run`: the agent with a terminal interface.
//!
//! Boot order matters for restarts: the successor builds its whole runtime
//! first and only then confirms the restart checkpoint, so "healthy" means
//! the new code got as far as being able to take turns.

use crate::interface::{CliInterface, HELP, Input, parse_input};
use ouroboros_agent::log_capture::{self, CapturedLogs};
use ouroboros_agent::{AgentLoop, AgentRuntime, FileJournal, StateStore, assembler_from_config};
use ouroboros_config::AppConfig;
use ouroboros_core::error::ModificationError;
use ouroboros_core::interface::{InboundMessage, InboundSource};
use ouroboros_core::journal::Journal;
use ouroboros_core::message::ConversationId;
use ouroboros_providers::{RetryPolicy, build_from_config};
use ouroboros_selfmod::{
    CHECKPOINT_ENV, ModState, ModificationOutcome, RestartManager, RestartOutcome, SelfModManager, SelfModifyTool,
    confirm_startup, is_restarted_instance, launcher_from_config, manager_from_config, restart_settings,
};
use ouroboros_tools::{ToolRegistry, default_registry};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

/// Exit code when every rollback failed and an operator must step in.
const FATAL_STARTUP_EXIT: i32 = 3;

pub struct RunOptions {
    /// A single message to send; `None` means interactive
    pub message: Option<String>,
    pub conversation: String,
    /// Successor of a one-shot run: confirm the restart, resume, exit
    pub resume_only: bool,
    /// Command line for the process that replaces this one
    pub successor_args: Vec<String>,
}

struct Services {
    runtime: Arc<AgentRuntime>,
    tools: Arc<ToolRegistry>,
    journal: Arc<FileJournal>,
    selfmod: Option<Arc<SelfModManager>>,
}

async fn build(config: &AppConfig) -> Result<Services, Box<dyn std::error::Error>> {
    if !config.has_api_key() {
        warn!("No API key configured; set OUROBOROS_API_KEY or OPENAI_API_KEY unless the provider needs none");
    }

    let journal = Arc::new(FileJournal::open(config.state.journal_path()));
    let providers = build_from_config(config);
    let provider = providers
        .default()
        .ok_or_else(|| format!("Provider '{}' is not configured", providers.default_name()))?;

    let tools = Arc::new(default_registry(&config.tools));
    let selfmod = if config.self_modify.enabled {
        let manager = Arc::new(manager_from_config(config, Some(journal.clone() as Arc<dyn Journal>)).await);
        tools.register_tool(Arc::new(SelfModifyTool::new(manager.clone())));
        Some(manager)
    } else {
        None
    };

    let agent = AgentLoop::new(
        provider,
        &config.default_model,
        tools.clone(),
        assembler_from_config(config, journal.clone()),
        journal.clone(),
        Arc::new(StateStore::new(&config.state.dir)),
    )
    .with_interface(Arc::new(CliInterface))
    .with_temperature(config.default_temperature)
    .with_max_tokens(config.default_max_tokens)
    .with_retry(RetryPolicy::from(&config.retry))
    .with_max_iterations(config.agent.max_iterations)
    .with_autonomy(config.agent.autonomy);

    Ok(Services {
        runtime: Arc::new(AgentRuntime::new(agent, config.agent.execution_slots)),
        tools,
        journal,
        selfmod,
    })
}

/// Mark the restart checkpoint healthy when this process is a successor.
async fn confirm_if_restarted(config: &AppConfig, selfmod: Option<&Arc<SelfModManager>>) -> Result<(), ModificationError> {
    if !is_restarted_instance() {
        return Ok(());
    }
    let path = std::env::var(CHECKPOINT_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| config.state.checkpoint_path());
    let Some(checkpoint) = confirm_startup(&path)? else {
        return Ok(());
    };
    // The predecessor records the same outcome, but this process loaded the
    // log before it did.
    if checkpoint.attempt == 0
        && let Some(manager) = selfmod
    {
        manager
            .log()
            .set_outcome(&checkpoint.record_ids, ModificationOutcome::Applied)
            .await?;
    }
    info!(attempt = checkpoint.attempt, commit = %checkpoint.target_commit, "Running as restarted instance");
    Ok(())
}

/// Replace the process whenever a restart is requested.
fn spawn_restart_watcher(
    config: &AppConfig,
    services: &Services,
    successor_args: Vec<String>,
) -> Result<(), ModificationError> {
    let Some(manager) = services.selfmod.clone() else {
        return Ok(());
    };
    let launcher = launcher_from_config(config, successor_args)?;
    let restarts = RestartManager::new(manager.clone(), Arc::new(launcher), restart_settings(config))
        .with_journal(services.journal.clone());
    let runtime = services.runtime.clone();
    let mut requests = manager.subscribe_restarts();

    tokio::spawn(async move {
        while requests.changed().await.is_ok() {
            let Some(request) = requests.borrow_and_update().clone() else {
                continue;
            };
            info!(reason = %request.reason, "Preparing to replace process");
            let guard = match runtime.prepare_for_restart().await {
                Ok(guard) => guard,
                Err(e) => {
                    error!(error = %e, "Could not drain turns for restart");
                    if let Err(abort) = manager.abort_restart(&e.to_string()).await {
                        warn!(error = %abort, "Could not record the aborted restart");
                    }
                    continue;
                }
            };
            match restarts.execute(&request).await {
                Ok(RestartOutcome::Replaced {
                    attempt,
                    commit,
                    rolled_back,
                }) => {
                    info!(attempt, %commit, rolled_back, "Successor is healthy, exiting");
                    std::process::exit(0);
                }
                Err(ModificationError::FatalStartup { attempts }) => {
                    error!(attempts, "No healthy successor after every rollback; operator intervention required");
                    std::process::exit(FATAL_STARTUP_EXIT);
                }
                Err(e) => {
                    warn!(error = %e, "Restart did not happen, continuing");
                    runtime.restart_aborted(guard);
                }
            }
        }
    });
    Ok(())
}

pub async fn run(config: AppConfig, options: RunOptions, logs: CapturedLogs) -> Result<(), Box<dyn std::error::Error>> {
    let services = build(&config).await?;
    log_capture::forward(logs, services.journal.clone());
    spawn_restart_watcher(&config, &services, options.successor_args)?;
    confirm_if_restarted(&config, services.selfmod.as_ref()).await?;
    let resumed = services.runtime.recover().await?;

    if options.resume_only {
        info!(resumed, "Resumed suspended work, exiting");
        services.journal.flush().await?;
        return Ok(());
    }

    let id = ConversationId::from(options.conversation.as_str());
    match options.message {
        Some(text) => {
            services
                .runtime
                .process(InboundMessage::new(id, text, cli_source()))
                .await?;
            // A restart requested during the turn still has to happen; the
            // watcher exits the process once a successor is healthy.
            if let Some(manager) = &services.selfmod {
                while manager.state().await == ModState::RestartRequested {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            }
            services.journal.flush().await?;
            Ok(())
        }
        None => interactive(&config, &services, id).await,
    }
}

fn indent(text: &str) -> String {
    text.lines().map(|line| format!("  {line}")).collect::<Vec<_>>().join("\n")
}

fn cli_source() -> InboundSource {
    InboundSource::Interface { name: "cli".into() }
}

async fn interactive(config: &AppConfig, services: &Services, id: ConversationId) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = &services.runtime;
    println!();
    println!("  Ouroboros, interactive mode");
    println!("  Provider:      {}", config.default_provider);
    println!("  Model:         {}", config.default_model);
    println!("  Autonomy:      {}", runtime.agent().effective_autonomy(&id).await?);
    println!("  Tools:         {}", services.tools.names().join(", "));
    println!("  Conversation:  {id}");
    println!();
    println!("  Type a message and press Enter. /help lists commands.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_input(&line) {
            Input::Empty => {}
            Input::Quit => break,
            Input::Help => println!("{HELP}"),
            Input::Invalid(reason) => println!("  {reason}"),
            Input::Message(text) => {
                runtime.submit(InboundMessage::new(id.clone(), text, cli_source()));
            }
            Input::Confirm(confirmation) => {
                let runtime = runtime.clone();
                let id = id.clone();
                tokio::spawn(async move {
                    if let Err(e) = runtime.confirm(&id, confirmation).await {
                        println!("  {e}");
                    }
                });
            }
            Input::Cancel => match runtime.cancel(&id).await {
                Ok(0) => println!("  Cancelling."),
                Ok(n) => println!("  Dropped {n} pending action(s)."),
                Err(e) => println!("  {e}"),
            },
            Input::Autonomy(None) => {
                println!("  Autonomy: {}", runtime.agent().effective_autonomy(&id).await?);
            }
            Input::Autonomy(Some(level)) => {
                runtime.set_autonomy(Some(&id), level).await?;
                println!("  Autonomy for {id} is now {level}.");
            }
            Input::Reload => println!("  {}", services.tools.reload()),
            Input::Tools => print!("{}", super::tools::render(&services.tools.snapshot())),
            Input::Status => println!("{}", indent(&runtime.status().to_string())),
        }
    }

    services.journal.flush().await?;
    println!();
    println!("  Goodbye.");
    Ok(())
}
