//! AgentQ CLI - Main entry point

mod cli;
mod options;

use agentq_foundation::QueueConfig;
use agentq_queue::{CommandId, ProcessExecutor, QueueController};
use clap::{Parser, Subcommand};
use options::{ExecOptions, TaskArgs};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// AgentQ - queue long-running agent tasks and run them one at a time
#[derive(Parser, Debug)]
#[command(name = "agentq")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Queue file to use instead of the configured one
    #[arg(long, global = true)]
    queue_file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a task now, or queue it with --queue
    Run {
        #[command(flatten)]
        task: TaskArgs,

        /// Add to the queue instead of running immediately
        #[arg(long)]
        queue: bool,

        #[command(flatten)]
        options: ExecOptions,
    },
    /// Add a task to the queue
    AddQueue {
        #[command(flatten)]
        task: TaskArgs,

        #[command(flatten)]
        options: ExecOptions,
    },
    /// Show queue counts and recent commands
    QueueStatus {
        /// Number of recent commands to list
        #[arg(short, long)]
        limit: Option<usize>,

        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },
    /// Show every detail of one command
    ShowCommand {
        /// Command id
        id: CommandId,
    },
    /// Cancel a pending command
    CancelCommand {
        /// Command id
        id: CommandId,
    },
    /// Cancel all pending commands and remove finished ones
    ClearAll,
    /// Remove completed, failed and cancelled commands
    ClearCompleted,
    /// Start processing the queue
    #[command(alias = "start")]
    ProcessQueue,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; stdout is reserved for command output
    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    // Load configuration
    let mut config = QueueConfig::load()?;
    if let Some(path) = args.queue_file {
        config = config.with_queue_file(path);
    }
    tracing::debug!("Using queue file {}", config.queue_file()?.display());

    let executor = Arc::new(ProcessExecutor::new(config.agent_command())?);
    let mut controller = QueueController::from_config(&config, executor)?;

    match args.command {
        Command::Run {
            task,
            queue: true,
            options,
        }
        | Command::AddQueue { task, options } => cli::add_queue(&controller, task, &options).await,
        Command::Run { task, options, .. } => cli::run_direct(&controller, task, &options).await,
        Command::QueueStatus { limit, json } => {
            if let Some(limit) = limit {
                controller = controller.with_recent_limit(limit);
            }
            cli::queue_status(&controller, json)
        }
        Command::ShowCommand { id } => cli::show_command(&controller, id),
        Command::CancelCommand { id } => cli::cancel_command(&controller, id),
        Command::ClearAll => cli::clear_all(&controller),
        Command::ClearCompleted => cli::clear_completed(&controller),
        Command::ProcessQueue => cli::process_queue(&controller).await,
    }
}
