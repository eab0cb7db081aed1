//! Queue Controller - the entry point used by the CLI
//!
//! Wraps the store and the processor behind request-level operations:
//! enqueue, status, cancel, bulk clear and processor start.

use crate::command::{CommandId, CommandOptions, CommandRecord, CommandSummary, NewCommand, TaskSource};
use crate::executor::{ExecutionOutcome, ExecutionRequest, Executor};
use crate::processor::{ProcessSummary, ProcessorHandle, QueueProcessor, StartOutcome};
use crate::store::{QueueStore, StatusCounts};
use agentq_foundation::{Error, QueueConfig, Result, DEFAULT_RECENT_LIMIT};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

// ============================================================================
// Requests and reports
// ============================================================================

/// Raw enqueue input, validated by [`QueueController::enqueue`]
#[derive(Debug, Clone, Default)]
pub struct EnqueueRequest {
    pub task_text: Option<String>,
    pub task_file: Option<PathBuf>,

    /// Defaults to the current directory; relative paths resolve against it
    pub working_directory: Option<PathBuf>,

    pub options: CommandOptions,
}

impl EnqueueRequest {
    pub fn text(task: impl Into<String>) -> Self {
        Self {
            task_text: Some(task.into()),
            ..Default::default()
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            task_file: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn in_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_options(mut self, options: CommandOptions) -> Self {
        self.options = options;
        self
    }

    /// Validate and normalize into a record payload. Touches nothing.
    pub fn prepare(self) -> Result<NewCommand> {
        let task = TaskSource::from_parts(self.task_text, self.task_file)?;

        let cwd = std::env::current_dir()
            .map_err(|e| Error::InvalidRequest(format!("cannot determine current directory: {}", e)))?;

        let working_directory = match self.working_directory {
            Some(dir) => absolutize(&cwd, dir),
            None => cwd.clone(),
        };
        if !working_directory.is_absolute() {
            return Err(Error::InvalidRequest(format!(
                "working directory {} is not absolute",
                working_directory.display()
            )));
        }
        if !working_directory.is_dir() {
            return Err(Error::InvalidRequest(format!(
                "working directory {} does not exist",
                working_directory.display()
            )));
        }

        let task = match task {
            TaskSource::File(path) => {
                let path = absolutize(&cwd, path);
                if !path.is_file() {
                    return Err(Error::InvalidRequest(format!(
                        "task file {} does not exist",
                        path.display()
                    )));
                }
                TaskSource::File(path)
            }
            text => text,
        };

        Ok(NewCommand {
            task,
            working_directory,
            options: self.options,
        })
    }
}

fn absolutize(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Aggregate view for `queue-status`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub counts: StatusCounts,
    pub processor_running: bool,
    pub current_executing_id: Option<CommandId>,

    /// Most recently created records, oldest first
    pub recent: Vec<CommandSummary>,
}

/// Outcome of a manual or automatic start request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartReport {
    Started,
    AlreadyRunning { current: Option<CommandId> },
}

/// What `clear_all` removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClearReport {
    pub cancelled: usize,
    pub purged: usize,
}

// ============================================================================
// QueueController
// ============================================================================

/// Request-level facade over the queue
pub struct QueueController {
    store: Arc<QueueStore>,
    processor: Arc<QueueProcessor>,
    recent_limit: usize,
    auto_start: bool,

    /// Processor started by this controller, if any
    handle: Mutex<Option<ProcessorHandle>>,
}

impl QueueController {
    pub fn new(processor: QueueProcessor) -> Self {
        Self {
            store: Arc::clone(processor.store()),
            processor: Arc::new(processor),
            recent_limit: DEFAULT_RECENT_LIMIT,
            auto_start: true,
            handle: Mutex::new(None),
        }
    }

    /// Open the configured queue and wire up a processor around `executor`
    pub fn from_config(config: &QueueConfig, executor: Arc<dyn Executor>) -> Result<Self> {
        let path = config.queue_file()?;
        let store = QueueStore::open(&path)?.with_max_pending(config.max_pending());
        let processor =
            QueueProcessor::new(Arc::new(store), executor).with_max_attempts(config.max_attempts());

        Ok(Self::new(processor).with_recent_limit(config.recent_limit()))
    }

    pub fn with_recent_limit(mut self, limit: usize) -> Self {
        self.recent_limit = limit;
        self
    }

    /// Whether `enqueue` starts the processor when it is idle
    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub fn store(&self) -> &Arc<QueueStore> {
        &self.store
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Append a pending record and start the processor if it is idle
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<CommandId> {
        let command = request.prepare()?;
        let record = self.store.append(command)?;

        if self.auto_start {
            self.start_processor().await?;
        }
        Ok(record.id)
    }

    /// Counts, processor state and the most recent records
    pub fn status(&self) -> Result<QueueStatus> {
        let snapshot = self.store.snapshot()?;

        let mut recent: Vec<&CommandRecord> = snapshot.commands.iter().collect();
        recent.sort_by_key(|c| (c.created_at, c.id));
        let skip = recent.len().saturating_sub(self.recent_limit);

        Ok(QueueStatus {
            counts: snapshot.counts(),
            processor_running: snapshot.processor_running,
            current_executing_id: snapshot.current_executing_id,
            recent: recent.into_iter().skip(skip).map(CommandRecord::summary).collect(),
        })
    }

    pub fn get(&self, id: CommandId) -> Result<CommandRecord> {
        self.store
            .get(id)?
            .ok_or_else(|| Error::NotFound(format!("command {}", id)))
    }

    /// Cancel one pending record
    pub fn cancel(&self, id: CommandId) -> Result<CommandRecord> {
        self.store.cancel(id)
    }

    /// Cancel everything pending, then purge every finished record
    pub fn clear_all(&self) -> Result<ClearReport> {
        let cancelled = self.store.cancel_all_pending()?;
        let purged = self.store.purge_terminal()?;
        Ok(ClearReport { cancelled, purged })
    }

    /// Purge completed, failed and cancelled records
    pub fn clear_completed(&self) -> Result<usize> {
        self.store.purge_terminal()
    }

    /// Start the processor unless one is alive. Idempotent.
    pub async fn start_processor(&self) -> Result<StartReport> {
        let busy = self
            .handle
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished());
        if busy {
            let current = self.store.snapshot()?.current_executing_id;
            return Ok(StartReport::AlreadyRunning { current });
        }

        match self.processor.start().await? {
            StartOutcome::Started(handle) => {
                debug!("Processor started by controller");
                *self.handle.lock() = Some(handle);
                Ok(StartReport::Started)
            }
            StartOutcome::AlreadyRunning { current } => {
                Ok(StartReport::AlreadyRunning { current })
            }
        }
    }

    /// Wait for a processor started by this controller to go idle.
    ///
    /// Returns `None` when this controller did not start one.
    pub async fn wait_idle(&self) -> Result<Option<ProcessSummary>> {
        let handle = self.handle.lock().take();
        match handle {
            Some(handle) => handle.wait().await.map(Some),
            None => Ok(None),
        }
    }

    /// Execute a task right away, bypassing the queue
    pub async fn execute_now(&self, request: EnqueueRequest) -> Result<ExecutionOutcome> {
        let command = request.prepare()?;
        let request =
            ExecutionRequest::direct(command.task, command.working_directory, command.options);

        info!("Running task directly: {}", request.task.summary());
        self.processor.executor().execute(&request).await
    }
}
