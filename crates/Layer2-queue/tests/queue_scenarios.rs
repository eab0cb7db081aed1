//! End-to-end queue scenarios against a real queue file

use agentq_foundation::{Error, QueueConfig, Result};
use agentq_queue::{
    CommandId, CommandOptions, CommandStatus, EnqueueRequest, ExecutionOutcome, ExecutionRequest,
    Executor, QueueController, QueueStore, StartReport,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// `noop-ok` succeeds, `noop-fail` fails, anything else succeeds
#[derive(Default)]
struct NoopExecutor {
    order: Mutex<Vec<Option<CommandId>>>,
}

#[async_trait]
impl Executor for NoopExecutor {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome> {
        self.order.lock().push(request.id);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        match request.task.resolve()?.trim() {
            "noop-fail" => Err(Error::Execution("noop-fail requested".into())),
            _ => Ok(ExecutionOutcome::default()),
        }
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

fn config(temp: &TempDir) -> QueueConfig {
    QueueConfig::new().with_queue_file(temp.path().join("queue.json"))
}

fn controller(temp: &TempDir, executor: Arc<NoopExecutor>) -> QueueController {
    QueueController::from_config(&config(temp), executor)
        .unwrap()
        .with_auto_start(false)
}

fn request(task: &str, dir: &Path) -> EnqueueRequest {
    EnqueueRequest::text(task)
        .in_directory(dir)
        .with_options(CommandOptions::new().with("provider", "openai").with("max_steps", 20u32))
}

#[tokio::test]
async fn fifo_order_without_overlap() {
    let temp = TempDir::new().unwrap();
    let executor = Arc::new(NoopExecutor::default());
    let controller = controller(&temp, executor.clone());

    let mut ids = Vec::new();
    for task in ["first", "second", "third"] {
        ids.push(controller.enqueue(request(task, temp.path())).await.unwrap());
    }

    assert_eq!(controller.start_processor().await.unwrap(), StartReport::Started);
    controller.wait_idle().await.unwrap();

    let order: Vec<_> = executor.order.lock().iter().flatten().copied().collect();
    assert_eq!(order, ids);

    let records: Vec<_> = ids.iter().map(|id| controller.get(*id).unwrap()).collect();
    for pair in records.windows(2) {
        let finished = pair[0].finished_at.unwrap();
        let started = pair[1].started_at.unwrap();
        assert!(finished <= started, "{} overlapped {}", pair[0].id, pair[1].id);
    }
}

#[tokio::test]
async fn failure_is_isolated() {
    let temp = TempDir::new().unwrap();
    let executor = Arc::new(NoopExecutor::default());
    let controller = controller(&temp, executor.clone());

    let x = controller.enqueue(request("noop-ok", temp.path())).await.unwrap();
    let y = controller.enqueue(request("noop-fail", temp.path())).await.unwrap();
    let z = controller.enqueue(request("noop-ok", temp.path())).await.unwrap();

    controller.start_processor().await.unwrap();
    let summary = controller.wait_idle().await.unwrap().unwrap();

    assert_eq!(summary.completed, vec![x, z]);
    assert_eq!(summary.failed, vec![y]);

    assert_eq!(controller.get(x).unwrap().status, CommandStatus::Completed);
    let failed = controller.get(y).unwrap();
    assert_eq!(failed.status, CommandStatus::Failed);
    assert!(!failed.error.unwrap_or_default().is_empty());
    assert_eq!(controller.get(z).unwrap().status, CommandStatus::Completed);

    let status = controller.status().unwrap();
    assert!(!status.processor_running);
    assert_eq!(status.current_executing_id, None);
}

#[tokio::test]
async fn invalid_enqueue_changes_nothing() {
    let temp = TempDir::new().unwrap();
    let controller = controller(&temp, Arc::new(NoopExecutor::default()));
    controller.enqueue(request("noop-ok", temp.path())).await.unwrap();

    std::fs::write(temp.path().join("task.md"), "noop-ok").unwrap();
    let both = EnqueueRequest {
        task_text: Some("noop-ok".into()),
        task_file: Some(temp.path().join("task.md")),
        working_directory: Some(temp.path().to_path_buf()),
        options: CommandOptions::new(),
    };
    let neither = EnqueueRequest::default().in_directory(temp.path());

    for bad in [both, neither] {
        let err = controller.enqueue(bad).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }
    assert_eq!(controller.status().unwrap().counts.total(), 1);
}

#[tokio::test]
async fn task_file_is_read_at_execution() {
    let temp = TempDir::new().unwrap();
    let controller = controller(&temp, Arc::new(NoopExecutor::default()));

    let file = temp.path().join("task.md");
    std::fs::write(&file, "noop-ok").unwrap();
    let id = controller
        .enqueue(EnqueueRequest::file(&file).in_directory(temp.path()))
        .await
        .unwrap();

    // edited after enqueue; the processor sees the new content
    std::fs::write(&file, "noop-fail").unwrap();

    controller.start_processor().await.unwrap();
    controller.wait_idle().await.unwrap();
    assert_eq!(controller.get(id).unwrap().status, CommandStatus::Failed);
}

#[tokio::test]
async fn crash_recovery_requeues_running_record() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("queue.json");

    // what a process killed mid-execution leaves behind
    let doc = serde_json::json!({
        "version": 1,
        "nextId": 2,
        "processorRunning": true,
        "currentExecutingId": 1,
        "commands": [{
            "id": 1,
            "task": { "text": "noop-ok" },
            "workingDirectory": temp.path(),
            "options": { "model": "gpt-4o" },
            "status": "running",
            "createdAt": "2024-05-01T10:00:00Z",
            "startedAt": "2024-05-01T10:00:01Z"
        }]
    });
    std::fs::write(&path, serde_json::to_string_pretty(&doc).unwrap()).unwrap();

    let store = QueueStore::open(&path).unwrap();
    let snapshot = store.snapshot().unwrap();
    let record = snapshot.get(CommandId(1)).unwrap();
    assert_eq!(record.status, CommandStatus::Pending);
    assert!(record.started_at.is_none());
    assert!(!snapshot.processor_running);
    assert_eq!(snapshot.current_executing_id, None);
    drop(store);

    let controller = controller(&temp, Arc::new(NoopExecutor::default()));
    controller.start_processor().await.unwrap();
    let summary = controller.wait_idle().await.unwrap().unwrap();
    assert_eq!(summary.completed, vec![CommandId(1)]);
}

#[tokio::test]
async fn cancel_rules() {
    let temp = TempDir::new().unwrap();
    let controller = controller(&temp, Arc::new(NoopExecutor::default()));

    let done = controller.enqueue(request("noop-ok", temp.path())).await.unwrap();
    let failed = controller.enqueue(request("noop-fail", temp.path())).await.unwrap();
    controller.start_processor().await.unwrap();
    controller.wait_idle().await.unwrap();

    let pending = controller.enqueue(request("later", temp.path())).await.unwrap();
    let cancelled = controller.cancel(pending).unwrap();
    assert_eq!(cancelled.status, CommandStatus::Cancelled);

    for id in [done, failed, pending, CommandId(999)] {
        let before = controller.get(id).ok();
        let err = controller.cancel(id).unwrap_err();
        assert!(matches!(err, Error::NotCancellable(_)), "{}", id);
        assert_eq!(controller.get(id).ok(), before);
    }
}

#[tokio::test]
async fn clear_all_spares_running_record() {
    let temp = TempDir::new().unwrap();
    let controller = controller(&temp, Arc::new(NoopExecutor::default()));

    let running = controller.enqueue(request("noop-ok", temp.path())).await.unwrap();
    controller.enqueue(request("noop-ok", temp.path())).await.unwrap();
    controller.enqueue(request("noop-fail", temp.path())).await.unwrap();

    // hold a lease so the claimed record stays running during clear
    let store = controller.store();
    let lease = store.try_acquire_lease().unwrap().unwrap();
    store.claim_next().unwrap();

    let report = controller.clear_all().unwrap();
    assert_eq!(report.cancelled, 2);
    assert_eq!(report.purged, 2);

    let status = controller.status().unwrap();
    assert_eq!(status.counts.pending, 0);
    assert_eq!(status.counts.completed, 0);
    assert_eq!(status.counts.failed, 0);
    assert_eq!(status.counts.cancelled, 0);
    assert_eq!(status.counts.running, 1);
    assert_eq!(controller.get(running).unwrap().status, CommandStatus::Running);
    drop(lease);
}

#[tokio::test]
async fn second_start_reports_existing_processor() {
    let temp = TempDir::new().unwrap();
    let executor = Arc::new(NoopExecutor::default());
    let first = controller(&temp, executor.clone());
    let second = controller(&temp, executor.clone());

    first.enqueue(request("noop-ok", temp.path())).await.unwrap();

    let store = first.store();
    let lease = store.try_acquire_lease().unwrap().unwrap();
    store.set_processor_running(true).unwrap();

    assert!(matches!(
        second.start_processor().await.unwrap(),
        StartReport::AlreadyRunning { .. }
    ));
    assert!(second.wait_idle().await.unwrap().is_none());
    drop(lease);

    assert_eq!(second.start_processor().await.unwrap(), StartReport::Started);
    let summary = second.wait_idle().await.unwrap().unwrap();
    assert_eq!(summary.completed.len(), 1);
}

#[tokio::test]
async fn enqueue_while_processing_runs_after() {
    let temp = TempDir::new().unwrap();
    let executor = Arc::new(NoopExecutor::default());
    let controller = controller(&temp, executor.clone()).with_auto_start(true);

    let a = controller.enqueue(request("noop-ok", temp.path())).await.unwrap();
    let b = controller.enqueue(request("noop-ok", temp.path())).await.unwrap();
    controller.wait_idle().await.unwrap();

    let order: Vec<_> = executor.order.lock().iter().flatten().copied().collect();
    assert_eq!(order, vec![a, b]);
    assert_eq!(controller.status().unwrap().counts.completed, 2);
}
