//! Executor trait

use crate::command::{CommandId, CommandOptions, CommandRecord, ResultRefs, TaskSource};
use agentq_foundation::Result;
use async_trait::async_trait;
use std::path::PathBuf;

/// Everything an executor needs to run one task
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Queue id, absent for direct runs that bypass the queue
    pub id: Option<CommandId>,
    pub task: TaskSource,
    pub working_directory: PathBuf,
    pub options: CommandOptions,
}

impl ExecutionRequest {
    pub fn direct(task: TaskSource, working_directory: PathBuf, options: CommandOptions) -> Self {
        Self {
            id: None,
            task,
            working_directory,
            options,
        }
    }
}

impl From<&CommandRecord> for ExecutionRequest {
    fn from(record: &CommandRecord) -> Self {
        Self {
            id: Some(record.id),
            task: record.task.clone(),
            working_directory: record.working_directory.clone(),
            options: record.options.clone(),
        }
    }
}

/// Result of a successful execution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionOutcome {
    pub result_refs: ResultRefs,
}

impl ExecutionOutcome {
    pub fn with_ref(mut self, name: impl Into<String>, location: impl Into<String>) -> Self {
        self.result_refs.insert(name.into(), location.into());
        self
    }
}

/// Executor trait - implement to add new execution backends
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run a task to completion. An `Err` marks the record failed.
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome>;

    /// Get executor name
    fn name(&self) -> &'static str;
}
