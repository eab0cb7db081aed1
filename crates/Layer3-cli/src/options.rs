//! Execution options shared by `run` and `add-queue`
//!
//! Everything here is captured into the record's option bag verbatim and
//! handed to the agent at execution time.

use agentq_queue::{CommandOptions, EnqueueRequest};
use clap::Args;
use std::path::PathBuf;

/// Task input: inline text or a file, never both
#[derive(Args, Debug, Clone, Default)]
pub struct TaskArgs {
    /// Task description
    #[arg(conflicts_with = "file")]
    pub task: Option<String>,

    /// Path to a file containing the task description
    #[arg(short, long)]
    pub file: Option<PathBuf>,
}

/// Agent execution parameters
#[derive(Args, Debug, Clone, Default)]
pub struct ExecOptions {
    /// LLM provider to use
    #[arg(short, long)]
    pub provider: Option<String>,

    /// Specific model to use
    #[arg(short, long)]
    pub model: Option<String>,

    /// Base URL for the model API
    #[arg(long)]
    pub model_base_url: Option<String>,

    /// API key (stored in the queue file as given)
    #[arg(short = 'k', long)]
    pub api_key: Option<String>,

    /// Maximum number of execution steps
    #[arg(long)]
    pub max_steps: Option<u32>,

    /// Working directory for the agent (defaults to the current directory)
    #[arg(short, long)]
    pub working_dir: Option<PathBuf>,

    /// Require the agent to produce a patch
    #[arg(long)]
    pub must_patch: bool,

    /// Agent configuration file
    #[arg(long)]
    pub config_file: Option<String>,

    /// Path to save the trajectory file
    #[arg(short, long)]
    pub trajectory_file: Option<String>,

    /// Path to the patch file
    #[arg(long)]
    pub patch_path: Option<String>,

    /// Console output style
    #[arg(long)]
    pub console_type: Option<String>,

    /// Agent variant
    #[arg(long)]
    pub agent_type: Option<String>,
}

impl ExecOptions {
    /// Option bag for the record; unset values are left out
    pub fn to_command_options(&self) -> CommandOptions {
        let mut options = CommandOptions::new();

        let text = [
            ("provider", &self.provider),
            ("model", &self.model),
            ("model_base_url", &self.model_base_url),
            ("api_key", &self.api_key),
            ("config_file", &self.config_file),
            ("trajectory_file", &self.trajectory_file),
            ("patch_path", &self.patch_path),
            ("console_type", &self.console_type),
            ("agent_type", &self.agent_type),
        ];
        for (key, value) in text {
            if let Some(value) = value {
                options.insert(key, value.as_str());
            }
        }

        if let Some(steps) = self.max_steps {
            options.insert("max_steps", steps);
        }
        if self.must_patch {
            options.insert("must_patch", true);
        }
        options
    }
}

/// Combine task input and options into an enqueue request
pub fn enqueue_request(task: TaskArgs, options: &ExecOptions) -> EnqueueRequest {
    EnqueueRequest {
        task_text: task.task,
        task_file: task.file,
        working_directory: options.working_dir.clone(),
        options: options.to_command_options(),
    }
}
