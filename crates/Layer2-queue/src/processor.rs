//! Queue Processor - the single background worker
//!
//! The processor holds the store's worker lease for as long as it runs, so
//! at most one processor is alive per queue file across all processes. It
//! claims the oldest pending record, hands it to the executor, records the
//! outcome and moves on until nothing is pending.

use crate::command::{CommandId, CommandRecord};
use crate::executor::{ExecutionOutcome, ExecutionRequest, Executor};
use crate::store::{QueueStore, StatusUpdate, WorkerLease};
use agentq_foundation::{Error, Result, DEFAULT_MAX_ATTEMPTS};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lease attempts before another processor is assumed alive
const LEASE_RETRIES: u32 = 5;
const LEASE_RETRY_DELAY: Duration = Duration::from_millis(25);

/// Records processed by one processor run, in execution order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSummary {
    pub completed: Vec<CommandId>,
    pub failed: Vec<CommandId>,
}

impl ProcessSummary {
    pub fn processed(&self) -> usize {
        self.completed.len() + self.failed.len()
    }
}

/// Result of a start request
#[derive(Debug)]
pub enum StartOutcome {
    /// This call started a processor in the background
    Started(ProcessorHandle),

    /// A processor is already alive, possibly in another process
    AlreadyRunning { current: Option<CommandId> },
}

impl StartOutcome {
    pub fn is_started(&self) -> bool {
        matches!(self, StartOutcome::Started(_))
    }
}

/// Handle to a processor running on the tokio runtime
#[derive(Debug)]
pub struct ProcessorHandle {
    handle: JoinHandle<Result<ProcessSummary>>,
}

impl ProcessorHandle {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the processor to go idle
    pub async fn wait(self) -> Result<ProcessSummary> {
        self.handle
            .await
            .map_err(|e| Error::Internal(format!("processor task failed: {}", e)))?
    }
}

/// Single-worker queue processor
pub struct QueueProcessor {
    store: Arc<QueueStore>,
    executor: Arc<dyn Executor>,
    max_attempts: u32,
}

impl QueueProcessor {
    pub fn new(store: Arc<QueueStore>, executor: Arc<dyn Executor>) -> Self {
        Self {
            store,
            executor,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Executor invocations per record before it is marked failed
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn store(&self) -> &Arc<QueueStore> {
        &self.store
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    // ========================================================================
    // Start
    // ========================================================================

    /// Start in the background unless a processor is already alive.
    ///
    /// Never fails because one is running; that case reports the record it
    /// is working on.
    pub async fn start(self: &Arc<Self>) -> Result<StartOutcome> {
        match self.acquire_lease().await? {
            Some(lease) => {
                let this = Arc::clone(self);
                let handle = tokio::spawn(async move { this.run_with_lease(lease).await });
                Ok(StartOutcome::Started(ProcessorHandle { handle }))
            }
            None => {
                let current = self
                    .blocking(|store| Ok(store.snapshot()?.current_executing_id))
                    .await?;
                info!("Processor already running (current: {:?})", current);
                Ok(StartOutcome::AlreadyRunning { current })
            }
        }
    }

    /// Drain the queue on the current task.
    ///
    /// Returns `None` when another processor already owns the queue.
    pub async fn run(&self) -> Result<Option<ProcessSummary>> {
        match self.acquire_lease().await? {
            Some(lease) => self.run_with_lease(lease).await.map(Some),
            None => Ok(None),
        }
    }

    /// Take the worker lease.
    ///
    /// A store load holds the lease for a moment to check for a live
    /// processor, so contention is retried before it counts as one.
    async fn acquire_lease(&self) -> Result<Option<WorkerLease>> {
        for attempt in 1..=LEASE_RETRIES {
            if let Some(lease) = self.blocking(|store| store.try_acquire_lease()).await? {
                return Ok(Some(lease));
            }
            if attempt < LEASE_RETRIES {
                debug!("Worker lease busy, retry {}", attempt);
                tokio::time::sleep(LEASE_RETRY_DELAY).await;
            }
        }
        Ok(None)
    }

    /// Run a store call on the blocking pool; it may wait on the file lock
    /// and fsync.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&QueueStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| Error::Internal(format!("store task failed: {}", e)))?
    }

    // ========================================================================
    // Worker loop
    // ========================================================================

    async fn run_with_lease(&self, lease: WorkerLease) -> Result<ProcessSummary> {
        let result = self.drain(lease).await;
        if let Err(e) = &result {
            error!("Processor stopped: {}", e);
            if let Err(reset) = self.blocking(|store| store.set_processor_running(false)).await {
                warn!("Could not clear processor flag: {}", reset);
            }
        }
        result
    }

    async fn drain(&self, lease: WorkerLease) -> Result<ProcessSummary> {
        let mut summary = ProcessSummary::default();

        info!("Processor started ({} executor)", self.executor.name());
        let mut lease = self.begin(lease).await?;

        loop {
            if let Some(record) = self.blocking(|store| store.claim_next()).await? {
                self.process(record, &mut summary).await?;
                continue;
            }
            match self.release_idle(lease).await? {
                Some(renewed) => lease = renewed,
                None => break,
            }
        }

        info!(
            "Processor idle: {} completed, {} failed",
            summary.completed.len(),
            summary.failed.len()
        );
        Ok(summary)
    }

    /// Recover orphans and raise the processor flag under `lease`
    async fn begin(&self, lease: WorkerLease) -> Result<WorkerLease> {
        self.blocking(move |store| {
            store.recover_orphans(&lease)?;
            store.set_processor_running(true)?;
            Ok(lease)
        })
        .await
    }

    /// Give up the lease after `claim_next` found nothing to do.
    ///
    /// An enqueue that saw the lease held just before it was released would
    /// otherwise strand its record, so pending work is checked once more.
    /// Returns the renewed lease when that work must be drained.
    async fn release_idle(&self, lease: WorkerLease) -> Result<Option<WorkerLease>> {
        // claim_next already cleared processorRunning
        drop(lease);

        if !self.blocking(|store| store.has_pending()).await? {
            return Ok(None);
        }
        match self.blocking(|store| store.try_acquire_lease()).await? {
            Some(renewed) => {
                debug!("Pending work arrived during idle exit, continuing");
                self.begin(renewed).await.map(Some)
            }
            None => Ok(None),
        }
    }

    /// Execute one claimed record and store its outcome.
    ///
    /// Executor errors and panics fail the record only. Store errors
    /// propagate and stop the processor.
    async fn process(&self, record: CommandRecord, summary: &mut ProcessSummary) -> Result<()> {
        let id = record.id;
        info!(command = %id, "Executing: {}", record.task.summary());

        let request = ExecutionRequest::from(&record);
        let result = loop {
            let attempt = self.blocking(move |store| store.record_attempt(id)).await?;
            match self.execute_isolated(&request).await {
                Ok(outcome) => break Ok(outcome),
                Err(message) if attempt < self.max_attempts => {
                    warn!(
                        command = %id,
                        "Attempt {}/{} failed, retrying: {}",
                        attempt, self.max_attempts, message
                    );
                }
                Err(message) => break Err((message, attempt)),
            }
        };

        match result {
            Ok(outcome) => {
                let update = StatusUpdate::Completed {
                    result_refs: outcome.result_refs,
                };
                self.blocking(move |store| store.update_status(id, update))
                    .await?;
                info!(command = %id, "Completed");
                summary.completed.push(id);
            }
            Err((message, attempts)) => {
                error!(command = %id, attempts, "Failed: {}", message);
                let update = StatusUpdate::Failed { error: message };
                self.blocking(move |store| store.update_status(id, update))
                    .await?;
                summary.failed.push(id);
            }
        }
        Ok(())
    }

    /// Run the executor, turning errors and panics into failure text
    async fn execute_isolated(
        &self,
        request: &ExecutionRequest,
    ) -> std::result::Result<ExecutionOutcome, String> {
        match AssertUnwindSafe(self.executor.execute(request))
            .catch_unwind()
            .await
        {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(Error::Execution(message))) => Err(message),
            Ok(Err(e)) => Err(e.to_string()),
            Err(panic) => Err(format!("executor panicked: {}", panic_message(&*panic))),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandOptions, NewCommand, TaskSource};
    use crate::state::CommandStatus;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// Behaviour chosen by task text: `ok`, `fail`, `panic`, or `flaky:<n>`
    /// (fails the first n calls).
    #[derive(Default)]
    struct ScriptedExecutor {
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedExecutor {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl Executor for ScriptedExecutor {
        async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome> {
            let task = request.task.resolve()?;
            let seen = {
                let mut calls = self.calls.lock();
                calls.push(task.clone());
                calls.iter().filter(|c| **c == task).count()
            };

            match task.as_str() {
                "ok" => Ok(ExecutionOutcome::default().with_ref("trajectory", "/tmp/t.json")),
                "fail" => Err(Error::Execution("scripted failure".into())),
                "panic" => panic!("scripted panic"),
                other => {
                    let failures: usize = other
                        .strip_prefix("flaky:")
                        .and_then(|n| n.parse().ok())
                        .unwrap_or(0);
                    if seen <= failures {
                        Err(Error::Execution(format!("flaky failure {}", seen)))
                    } else {
                        Ok(ExecutionOutcome::default())
                    }
                }
            }
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn setup() -> (Arc<QueueStore>, Arc<ScriptedExecutor>, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(QueueStore::open(temp.path().join("queue.json")).unwrap());
        (store, Arc::new(ScriptedExecutor::default()), temp)
    }

    fn enqueue(store: &QueueStore, task: &str) -> CommandId {
        store
            .append(NewCommand {
                task: TaskSource::Text(task.to_string()),
                working_directory: PathBuf::from("/work"),
                options: CommandOptions::new(),
            })
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_run_empty_queue() {
        let (store, executor, _temp) = setup();
        let processor = QueueProcessor::new(store.clone(), executor);

        let summary = processor.run().await.unwrap().unwrap();
        assert_eq!(summary.processed(), 0);
        assert!(!store.snapshot().unwrap().processor_running);
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_queue() {
        let (store, executor, _temp) = setup();
        let a = enqueue(&store, "ok");
        let b = enqueue(&store, "fail");
        let c = enqueue(&store, "ok");

        let processor = QueueProcessor::new(store.clone(), executor.clone());
        let summary = processor.run().await.unwrap().unwrap();

        assert_eq!(summary.completed, vec![a, c]);
        assert_eq!(summary.failed, vec![b]);
        assert_eq!(executor.calls(), vec!["ok", "fail", "ok"]);

        let snapshot = store.snapshot().unwrap();
        let failed = snapshot.get(b).unwrap();
        assert_eq!(failed.status, CommandStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("scripted failure"));

        let done = snapshot.get(a).unwrap();
        assert_eq!(
            done.result_refs.as_ref().and_then(|r| r.get("trajectory")).map(String::as_str),
            Some("/tmp/t.json")
        );
        assert!(!snapshot.processor_running);
        assert_eq!(snapshot.current_executing_id, None);
    }

    #[tokio::test]
    async fn test_panic_is_isolated() {
        let (store, executor, _temp) = setup();
        let a = enqueue(&store, "panic");
        let b = enqueue(&store, "ok");

        let processor = QueueProcessor::new(store.clone(), executor);
        let summary = processor.run().await.unwrap().unwrap();

        assert_eq!(summary.failed, vec![a]);
        assert_eq!(summary.completed, vec![b]);
        let error = store.get(a).unwrap().unwrap().error.unwrap();
        assert!(error.contains("scripted panic"));
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let (store, executor, _temp) = setup();
        let a = enqueue(&store, "flaky:2");

        let processor = QueueProcessor::new(store.clone(), executor.clone()).with_max_attempts(3);
        let summary = processor.run().await.unwrap().unwrap();

        assert_eq!(summary.completed, vec![a]);
        let record = store.get(a).unwrap().unwrap();
        assert_eq!(record.status, CommandStatus::Completed);
        assert_eq!(record.attempts, 3);
        assert_eq!(executor.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted_keeps_last_error() {
        let (store, executor, _temp) = setup();
        let a = enqueue(&store, "flaky:5");

        let processor = QueueProcessor::new(store.clone(), executor).with_max_attempts(2);
        processor.run().await.unwrap();

        let record = store.get(a).unwrap().unwrap();
        assert_eq!(record.status, CommandStatus::Failed);
        assert_eq!(record.attempts, 2);
        assert_eq!(record.error.as_deref(), Some("flaky failure 2"));
    }

    #[tokio::test]
    async fn test_start_reports_existing_processor() {
        let (store, executor, _temp) = setup();
        enqueue(&store, "ok");

        let lease = store.try_acquire_lease().unwrap().unwrap();
        store.set_processor_running(true).unwrap();

        let processor = Arc::new(QueueProcessor::new(store.clone(), executor.clone()));
        assert!(matches!(
            processor.start().await.unwrap(),
            StartOutcome::AlreadyRunning { current: None }
        ));
        assert!(processor.run().await.unwrap().is_none());
        assert!(executor.calls().is_empty());

        drop(lease);
        match processor.start().await.unwrap() {
            StartOutcome::Started(handle) => {
                let summary = handle.wait().await.unwrap();
                assert_eq!(summary.completed.len(), 1);
            }
            other => panic!("expected start, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_orphaned_running_record_is_retried() {
        let (store, executor, _temp) = setup();
        let a = enqueue(&store, "ok");
        store.claim_next().unwrap();

        let processor = QueueProcessor::new(store.clone(), executor);
        let summary = processor.run().await.unwrap().unwrap();

        assert_eq!(summary.completed, vec![a]);
    }

    #[tokio::test]
    async fn test_enqueue_during_idle_exit_is_drained() {
        let (store, executor, _temp) = setup();
        let processor = QueueProcessor::new(store.clone(), executor.clone());

        // processor state right after claim_next came back empty
        let lease = store.try_acquire_lease().unwrap().unwrap();
        assert!(store.claim_next().unwrap().is_none());

        // another process enqueues and sees the lease still held
        let other = QueueStore::open(store.path()).unwrap();
        let late = enqueue(&other, "ok");
        assert!(other.try_acquire_lease().unwrap().is_none());

        let renewed = processor.release_idle(lease).await.unwrap().unwrap();
        assert!(store.snapshot().unwrap().processor_running);

        let summary = processor.drain(renewed).await.unwrap();
        assert_eq!(summary.completed, vec![late]);
        assert_eq!(executor.calls(), vec!["ok"]);
        assert!(!store.snapshot().unwrap().processor_running);
    }

    #[tokio::test]
    async fn test_release_idle_without_work_frees_lease() {
        let (store, executor, _temp) = setup();
        let processor = QueueProcessor::new(store.clone(), executor);

        let lease = store.try_acquire_lease().unwrap().unwrap();
        assert!(store.claim_next().unwrap().is_none());

        assert!(processor.release_idle(lease).await.unwrap().is_none());
        assert!(store.try_acquire_lease().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_start_waits_out_brief_lease_check() {
        let (store, executor, _temp) = setup();
        let a = enqueue(&store, "ok");

        // stale flag from a crash, lease held briefly by another process's load
        store.set_processor_running(true).unwrap();
        let holder = store.try_acquire_lease().unwrap().unwrap();
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(holder);
        });

        let processor = Arc::new(QueueProcessor::new(store.clone(), executor));
        match processor.start().await.unwrap() {
            StartOutcome::Started(handle) => {
                let summary = handle.wait().await.unwrap();
                assert_eq!(summary.completed, vec![a]);
            }
            other => panic!("expected start, got {:?}", other),
        }
        release.await.unwrap();
    }

    /// Completes the task, but breaks the store's next write first
    struct SabotagingExecutor {
        blocked_temp: PathBuf,
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl Executor for SabotagingExecutor {
        async fn execute(&self, _request: &ExecutionRequest) -> Result<ExecutionOutcome> {
            *self.calls.lock() += 1;
            std::fs::create_dir_all(&self.blocked_temp).unwrap();
            Ok(ExecutionOutcome::default())
        }

        fn name(&self) -> &'static str {
            "sabotaging"
        }
    }

    #[tokio::test]
    async fn test_persistence_failure_stops_processor() {
        let (store, _executor, temp) = setup();
        let a = enqueue(&store, "first");
        let b = enqueue(&store, "second");

        // the atomic writer's temp file cannot be created over a directory
        let executor = Arc::new(SabotagingExecutor {
            blocked_temp: temp
                .path()
                .join(format!(".queue.json.{}.tmp", std::process::id())),
            calls: Mutex::new(0),
        });
        let processor = QueueProcessor::new(store.clone(), executor.clone());

        let err = processor.run().await.unwrap_err();
        assert!(matches!(err, Error::Persistence(_)), "{:?}", err);
        assert_eq!(*executor.calls.lock(), 1);

        // the failed write left the last good document in place
        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.get(a).unwrap().status, CommandStatus::Running);
        assert_eq!(snapshot.get(b).unwrap().status, CommandStatus::Pending);
    }
}
