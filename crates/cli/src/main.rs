//! Ouroboros CLI, the main entry point.
//!
//! Commands:
//! - `run`            Talk to the agent in the terminal (or send one message)
//! - `tools`          List the registered tools and their danger levels
//! - `modifications`  Show the self-modification log
//! - `pending`        Show conversations waiting for a confirmation
//! - `config`         Show, validate or initialise configuration

use clap::{Parser, Subcommand, ValueEnum};
use ouroboros_agent::log_capture::{self, CapturedLogs};
use ouroboros_config::AppConfig;
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;
mod interface;

#[derive(Parser)]
#[command(
    name = "ouroboros",
    about = "Ouroboros: a conversational agent that can rewrite itself",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ~/.ouroboros/config.toml)
    #[arg(short, long, global = true, env = "OUROBOROS_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    fn as_arg(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the agent
    Run {
        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,

        /// Conversation to talk in
        #[arg(long, default_value = "cli")]
        conversation: String,

        /// Confirm a restart, finish suspended work, then exit
        #[arg(long, hide = true, conflicts_with = "message")]
        resume_only: bool,
    },

    /// List registered tools
    Tools,

    /// Show the self-modification log
    Modifications {
        /// Only records waiting for a restart
        #[arg(long)]
        pending: bool,
    },

    /// Show suspended conversations
    Pending,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the config file path
    Path,
    /// Check the configuration for errors
    Validate,
    /// Write a default config file and knowledge directory
    Init,
}

/// Install the subscriber. Warnings and errors are also captured for the
/// journal, which `run` opens later.
fn init_tracing(verbose: bool, format: LogFormat) -> CapturedLogs {
    let filter = if verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    let (journal_layer, captured) = log_capture::journal_layer();
    let fmt = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(env_filter).with(journal_layer);
    match format {
        LogFormat::Text => registry.with(fmt).init(),
        LogFormat::Json => registry.with(fmt.json()).init(),
    }
    captured
}

/// Arguments for the process that replaces this one after a self-modification.
///
/// Built from the parsed command line: a one-shot `--message` must not be
/// sent a second time, so its successor only resumes.
fn successor_args(
    config: &Path,
    verbose: bool,
    format: LogFormat,
    conversation: &str,
    interactive: bool,
) -> Vec<String> {
    let mut args = vec![
        "--config".to_string(),
        config.display().to_string(),
        "--log-format".to_string(),
        format.as_arg().to_string(),
    ];
    if verbose {
        args.push("--verbose".into());
    }
    args.extend(["run".to_string(), "--conversation".to_string(), conversation.to_string()]);
    if !interactive {
        args.push("--resume-only".into());
    }
    args
}

fn config_path(cli_path: Option<PathBuf>) -> PathBuf {
    cli_path.unwrap_or_else(|| AppConfig::config_dir().join("config.toml"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let captured = init_tracing(cli.verbose, cli.log_format);
    let path = config_path(cli.config);

    match cli.command {
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_cmd::show(&path)?,
            ConfigAction::Path => commands::config_cmd::path(&path),
            ConfigAction::Validate => commands::config_cmd::validate(&path)?,
            ConfigAction::Init => commands::config_cmd::init(&path)?,
        },
        command => {
            let config =
                AppConfig::load_with_env(&path).map_err(|e| format!("Failed to load config: {e}"))?;
            match command {
                Commands::Run {
                    message,
                    conversation,
                    resume_only,
                } => {
                    let interactive = message.is_none() && !resume_only;
                    let options = commands::run::RunOptions {
                        successor_args: successor_args(&path, cli.verbose, cli.log_format, &conversation, interactive),
                        message,
                        conversation,
                        resume_only,
                    };
                    commands::run::run(config, options, captured).await?
                }
                Commands::Tools => commands::tools::run(&config).await?,
                Commands::Modifications { pending } => {
                    commands::modifications::run(&config, pending).await?
                }
                Commands::Pending => commands::pending::run(&config).await?,
                Commands::Config { .. } => {}
            }
        }
    }

    Ok(())
}
