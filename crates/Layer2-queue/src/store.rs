//! Queue Store - durable, multi-process-safe command storage
//!
//! The whole queue lives in a single JSON document. Every mutation is a
//! read-modify-write cycle run under an exclusive advisory lock on
//! `<queue file>.lock`, and the new document replaces the old one through
//! a temp-file rename, so concurrent readers never see a partial write.
//!
//! A second lock, `<queue file>.worker.lock`, is held by the live processor.
//! Whoever can take it knows no processor is running anywhere, which is what
//! makes crash recovery safe to apply.

use crate::command::{CommandId, CommandRecord, NewCommand, ResultRefs};
use crate::state::CommandStatus;
use agentq_foundation::{write_atomic, Error, FileLock, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Document format version
pub const STORE_VERSION: u32 = 1;

fn default_version() -> u32 {
    STORE_VERSION
}

fn first_id() -> u64 {
    1
}

// ============================================================================
// QueueDocument - persisted layout
// ============================================================================

/// On-disk layout of the queue file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDocument {
    #[serde(default = "default_version")]
    pub version: u32,

    /// Next id to hand out
    #[serde(default = "first_id")]
    pub next_id: u64,

    /// Whether a processor is currently draining the queue
    #[serde(default)]
    pub processor_running: bool,

    /// Record the processor is executing right now
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_executing_id: Option<CommandId>,

    /// All records, in creation order
    #[serde(default)]
    pub commands: Vec<CommandRecord>,
}

impl Default for QueueDocument {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            next_id: first_id(),
            processor_running: false,
            current_executing_id: None,
            commands: Vec::new(),
        }
    }
}

impl QueueDocument {
    fn find_mut(&mut self, id: CommandId) -> Option<&mut CommandRecord> {
        self.commands.iter_mut().find(|c| c.id == id)
    }

    fn allocate_id(&mut self) -> CommandId {
        let id = CommandId(self.next_id);
        self.next_id += 1;
        id
    }

    fn count(&self, status: CommandStatus) -> usize {
        self.commands.iter().filter(|c| c.status == status).count()
    }

    /// Oldest pending record by `createdAt`, ties broken by id
    fn oldest_pending(&self) -> Option<CommandId> {
        self.commands
            .iter()
            .filter(|c| c.status.is_pending())
            .min_by_key(|c| (c.created_at, c.id))
            .map(|c| c.id)
    }

    /// Reset every `running` record to `pending` and clear processor state.
    fn recover(&mut self) -> Vec<CommandId> {
        let recovered: Vec<CommandId> = self
            .commands
            .iter_mut()
            .filter_map(|c| c.recover().then_some(c.id))
            .collect();
        self.processor_running = false;
        self.current_executing_id = None;
        recovered
    }

    /// Structural checks beyond what serde enforces
    fn validate(&mut self, path: &Path) -> Result<()> {
        let mut seen = HashSet::new();
        for command in &self.commands {
            if !seen.insert(command.id) {
                return Err(Error::store_corrupt(
                    path,
                    format!("duplicate command id {}", command.id),
                ));
            }
        }

        // Never hand out an id that is already on disk
        if let Some(max) = self.commands.iter().map(|c| c.id.0).max() {
            if self.next_id <= max {
                warn!("nextId {} behind existing id {}, bumping", self.next_id, max);
                self.next_id = max + 1;
            }
        }
        Ok(())
    }
}

// ============================================================================
// Snapshot types
// ============================================================================

/// Number of records per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.running + self.completed + self.failed + self.cancelled
    }

    pub fn get(&self, status: CommandStatus) -> usize {
        match status {
            CommandStatus::Pending => self.pending,
            CommandStatus::Running => self.running,
            CommandStatus::Completed => self.completed,
            CommandStatus::Failed => self.failed,
            CommandStatus::Cancelled => self.cancelled,
        }
    }
}

/// Read-only copy of the queue
#[derive(Debug, Clone, Default)]
pub struct QueueSnapshot {
    pub commands: Vec<CommandRecord>,
    pub processor_running: bool,
    pub current_executing_id: Option<CommandId>,
}

impl QueueSnapshot {
    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for command in &self.commands {
            match command.status {
                CommandStatus::Pending => counts.pending += 1,
                CommandStatus::Running => counts.running += 1,
                CommandStatus::Completed => counts.completed += 1,
                CommandStatus::Failed => counts.failed += 1,
                CommandStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    pub fn get(&self, id: CommandId) -> Option<&CommandRecord> {
        self.commands.iter().find(|c| c.id == id)
    }

    pub fn has_pending(&self) -> bool {
        self.commands.iter().any(|c| c.status.is_pending())
    }
}

impl From<&QueueDocument> for QueueSnapshot {
    fn from(doc: &QueueDocument) -> Self {
        Self {
            commands: doc.commands.clone(),
            processor_running: doc.processor_running,
            current_executing_id: doc.current_executing_id,
        }
    }
}

/// Status change applied by [`QueueStore::update_status`]
#[derive(Debug, Clone)]
pub enum StatusUpdate {
    Running,
    Completed { result_refs: ResultRefs },
    Failed { error: String },
    Cancelled,
}

impl StatusUpdate {
    pub fn target(&self) -> CommandStatus {
        match self {
            StatusUpdate::Running => CommandStatus::Running,
            StatusUpdate::Completed { .. } => CommandStatus::Completed,
            StatusUpdate::Failed { .. } => CommandStatus::Failed,
            StatusUpdate::Cancelled => CommandStatus::Cancelled,
        }
    }
}

/// Proof that the caller is the only live processor for a store
#[derive(Debug)]
pub struct WorkerLease {
    _lock: FileLock,
}

// ============================================================================
// QueueStore
// ============================================================================

/// Durable queue backed by one JSON file
pub struct QueueStore {
    /// Queue document
    path: PathBuf,

    /// Guards read-modify-write cycles across processes
    lock_path: PathBuf,

    /// Held by the live processor
    worker_lock_path: PathBuf,

    /// Cap on pending records, unlimited when `None`
    max_pending: Option<usize>,

    /// Serializes mutation cycles inside this process
    write_guard: Mutex<()>,
}

impl QueueStore {
    /// Open the store at `path`, creating nothing until the first write.
    ///
    /// Applies crash recovery when no processor is alive.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self::unloaded(path.into());
        store.load()?;
        Ok(store)
    }

    fn unloaded(path: PathBuf) -> Self {
        let lock_path = sibling(&path, "lock");
        let worker_lock_path = sibling(&path, "worker.lock");
        Self {
            path,
            lock_path,
            worker_lock_path,
            max_pending: None,
            write_guard: Mutex::new(()),
        }
    }

    /// Limit how many records may be pending at once
    pub fn with_max_pending(mut self, max_pending: Option<usize>) -> Self {
        self.max_pending = max_pending;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ========================================================================
    // Load / persist
    // ========================================================================

    /// Re-read the backing file.
    ///
    /// If no processor holds the worker lease, every `running` record is an
    /// orphan of a crashed process: it goes back to `pending` and
    /// `processorRunning` is reset. Returns the recovered ids.
    pub fn load(&self) -> Result<Vec<CommandId>> {
        let _guard = self.write_guard.lock();
        let _lock = FileLock::exclusive(&self.lock_path)?;

        let mut doc = self.read_document()?;
        let mut recovered = Vec::new();

        if let Some(_lease) = FileLock::try_exclusive(&self.worker_lock_path)? {
            let stale_flag = doc.processor_running || doc.current_executing_id.is_some();
            recovered = doc.recover();
            for id in &recovered {
                warn!(command = %id, "Recovered command left running by a previous process");
            }
            if !recovered.is_empty() || stale_flag {
                self.persist(&doc)?;
            }
        } else {
            debug!("Processor alive for {}, skipping recovery", self.path.display());
        }

        info!(
            "Loaded queue {} ({} commands)",
            self.path.display(),
            doc.commands.len()
        );
        Ok(recovered)
    }

    fn read_document(&self) -> Result<QueueDocument> {
        if !self.path.exists() {
            return Ok(QueueDocument::default());
        }

        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| Error::store_corrupt(&self.path, format!("unreadable: {}", e)))?;
        if content.trim().is_empty() {
            return Ok(QueueDocument::default());
        }

        let mut doc: QueueDocument = serde_json::from_str(&content)
            .map_err(|e| Error::store_corrupt(&self.path, e.to_string()))?;
        doc.validate(&self.path)?;
        Ok(doc)
    }

    fn persist(&self, doc: &QueueDocument) -> Result<()> {
        let content = serde_json::to_string_pretty(doc)
            .map_err(|e| Error::Persistence(format!("Failed to serialize queue: {}", e)))?;
        write_atomic(&self.path, content.as_bytes())?;
        debug!("Saved queue with {} commands", doc.commands.len());
        Ok(())
    }

    /// Run one read-modify-write cycle. Nothing is written when `f` fails.
    fn mutate<R>(&self, f: impl FnOnce(&mut QueueDocument) -> Result<R>) -> Result<R> {
        let _guard = self.write_guard.lock();
        let _lock = FileLock::exclusive(&self.lock_path)?;

        let mut doc = self.read_document()?;
        let result = f(&mut doc)?;
        self.persist(&doc)?;
        Ok(result)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Current queue as stored on disk.
    ///
    /// Reads without taking the mutation lock; the rename-based writes
    /// guarantee a complete document.
    pub fn snapshot(&self) -> Result<QueueSnapshot> {
        Ok(QueueSnapshot::from(&self.read_document()?))
    }

    pub fn get(&self, id: CommandId) -> Result<Option<CommandRecord>> {
        Ok(self.snapshot()?.get(id).cloned())
    }

    pub fn has_pending(&self) -> Result<bool> {
        Ok(self.snapshot()?.has_pending())
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Add a new `pending` record after all existing ones
    pub fn append(&self, command: NewCommand) -> Result<CommandRecord> {
        let max_pending = self.max_pending;
        let record = self.mutate(|doc| {
            if let Some(max) = max_pending {
                let pending = doc.count(CommandStatus::Pending);
                if pending >= max {
                    return Err(Error::InvalidRequest(format!(
                        "queue is full ({} pending, limit {})",
                        pending, max
                    )));
                }
            }

            // keep createdAt order consistent with id order under clock skew
            let mut created_at = Utc::now();
            if let Some(last) = doc.commands.iter().map(|c| c.created_at).max() {
                created_at = created_at.max(last);
            }

            let id = doc.allocate_id();
            let record = CommandRecord::new(id, command, created_at);
            doc.commands.push(record.clone());
            Ok(record)
        })?;

        info!(command = %record.id, "Queued command: {}", record.task.summary());
        Ok(record)
    }

    /// Apply a state-machine transition to one record
    pub fn update_status(&self, id: CommandId, update: StatusUpdate) -> Result<CommandRecord> {
        self.mutate(|doc| {
            if matches!(update, StatusUpdate::Running) {
                if let Some(running) = doc.commands.iter().find(|c| c.status.is_running()) {
                    if running.id != id {
                        return Err(Error::invalid_transition(
                            id,
                            CommandStatus::Pending,
                            format!("running (command {} is already running)", running.id),
                        ));
                    }
                }
            }

            let record = doc
                .find_mut(id)
                .ok_or_else(|| Error::NotFound(format!("command {}", id)))?;

            match update {
                StatusUpdate::Running => record.start()?,
                StatusUpdate::Completed { result_refs } => record.complete(result_refs)?,
                StatusUpdate::Failed { error } => record.fail(error)?,
                StatusUpdate::Cancelled => record.cancel()?,
            }
            let record = record.clone();

            match record.status {
                CommandStatus::Running => doc.current_executing_id = Some(id),
                _ if doc.current_executing_id == Some(id) => doc.current_executing_id = None,
                _ => {}
            }
            Ok(record)
        })
    }

    /// Claim the oldest pending record for execution.
    ///
    /// Returns `None` and clears `processorRunning` when nothing is pending.
    pub fn claim_next(&self) -> Result<Option<CommandRecord>> {
        self.mutate(|doc| {
            if let Some(running) = doc.commands.iter().find(|c| c.status.is_running()) {
                return Err(Error::invalid_transition(
                    running.id,
                    CommandStatus::Running,
                    "running (single-worker violation)",
                ));
            }

            let Some(id) = doc.oldest_pending() else {
                doc.processor_running = false;
                doc.current_executing_id = None;
                return Ok(None);
            };

            let record = doc
                .find_mut(id)
                .ok_or_else(|| Error::Internal(format!("command {} vanished", id)))?;
            record.start()?;
            let record = record.clone();

            doc.processor_running = true;
            doc.current_executing_id = Some(id);
            Ok(Some(record))
        })
    }

    /// Count one more executor invocation for a running record
    pub fn record_attempt(&self, id: CommandId) -> Result<u32> {
        self.mutate(|doc| {
            let record = doc
                .find_mut(id)
                .ok_or_else(|| Error::NotFound(format!("command {}", id)))?;
            if !record.status.is_running() {
                return Err(Error::invalid_transition(id, record.status, "running"));
            }
            record.attempts += 1;
            Ok(record.attempts)
        })
    }

    pub fn set_processor_running(&self, running: bool) -> Result<()> {
        self.mutate(|doc| {
            doc.processor_running = running;
            if !running {
                doc.current_executing_id = None;
            }
            Ok(())
        })
    }

    /// `pending -> cancelled` for one record
    pub fn cancel(&self, id: CommandId) -> Result<CommandRecord> {
        let record = self.mutate(|doc| {
            let record = doc
                .find_mut(id)
                .ok_or_else(|| Error::NotCancellable(format!("command {} does not exist", id)))?;
            if !record.status.is_pending() {
                return Err(Error::NotCancellable(format!(
                    "command {} is {}",
                    id, record.status
                )));
            }
            record.cancel()?;
            Ok(record.clone())
        })?;

        info!(command = %id, "Cancelled command");
        Ok(record)
    }

    /// Cancel every pending record; returns how many changed
    pub fn cancel_all_pending(&self) -> Result<usize> {
        let cancelled = self.mutate(|doc| {
            let mut cancelled = 0;
            for record in doc.commands.iter_mut().filter(|c| c.status.is_pending()) {
                record.cancel()?;
                cancelled += 1;
            }
            Ok(cancelled)
        })?;

        if cancelled > 0 {
            info!("Cancelled {} pending commands", cancelled);
        }
        Ok(cancelled)
    }

    /// Delete every completed, failed and cancelled record
    pub fn purge_terminal(&self) -> Result<usize> {
        let purged = self.mutate(|doc| {
            let before = doc.commands.len();
            doc.commands.retain(|c| !c.status.is_terminal());
            Ok(before - doc.commands.len())
        })?;

        if purged > 0 {
            info!("Purged {} finished commands", purged);
        }
        Ok(purged)
    }

    // ========================================================================
    // Worker lease
    // ========================================================================

    /// Become the only processor for this store, if nobody else is
    pub fn try_acquire_lease(&self) -> Result<Option<WorkerLease>> {
        Ok(FileLock::try_exclusive(&self.worker_lock_path)?.map(|lock| WorkerLease { _lock: lock }))
    }

    /// Reset records orphaned by a dead processor.
    ///
    /// Holding the lease proves no other processor is alive, so any
    /// `running` record belongs to a process that is gone.
    pub fn recover_orphans(&self, _lease: &WorkerLease) -> Result<Vec<CommandId>> {
        let recovered = self.mutate(|doc| Ok(doc.recover()))?;
        for id in &recovered {
            warn!(command = %id, "Recovered orphaned running command");
        }
        Ok(recovered)
    }
}

impl std::fmt::Debug for QueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueStore")
            .field("path", &self.path)
            .field("max_pending", &self.max_pending)
            .finish()
    }
}

/// `queue.json` -> `queue.json.<suffix>`
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "queue".into());
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}
