//! Subcommand handlers

use crate::options::{enqueue_request, ExecOptions, TaskArgs};
use agentq_queue::{
    CommandId, CommandRecord, CommandStatus, ProcessSummary, QueueController, QueueStatus,
    StartReport,
};
use chrono::{DateTime, Local, Utc};
use std::future::Future;

/// Queue a task. The invocation that starts the processor stays in the
/// foreground until the queue is empty.
pub async fn add_queue(
    controller: &QueueController,
    task: TaskArgs,
    options: &ExecOptions,
) -> anyhow::Result<()> {
    let id = controller.enqueue(enqueue_request(task, options)).await?;
    println!("✓ Queued command {}", id);

    let status = controller.status()?;
    if status.counts.pending > 1 || status.current_executing_id.is_some_and(|c| c != id) {
        println!("  Position: {} pending", status.counts.pending);
    }

    wait_for_processor(controller).await
}

/// Run a task directly, bypassing the queue
pub async fn run_direct(
    controller: &QueueController,
    task: TaskArgs,
    options: &ExecOptions,
) -> anyhow::Result<()> {
    let outcome = controller
        .execute_now(enqueue_request(task, options))
        .await?;

    println!("✓ Task finished");
    for (name, location) in &outcome.result_refs {
        println!("  {}: {}", name, location);
    }
    Ok(())
}

/// Start the processor, or report the one already running
pub async fn process_queue(controller: &QueueController) -> anyhow::Result<()> {
    match controller.start_processor().await? {
        StartReport::Started => {
            println!("Processing queue...");
            wait_for_processor(controller).await
        }
        StartReport::AlreadyRunning { current } => {
            match current {
                Some(id) => println!("Processor already running (executing {})", id),
                None => println!("Processor already running"),
            }
            Ok(())
        }
    }
}

async fn wait_for_processor(controller: &QueueController) -> anyhow::Result<()> {
    let Some(summary) = until_interrupted(controller.wait_idle()).await? else {
        return Ok(());
    };
    print_summary(&summary);
    Ok(())
}

/// Run `work` unless Ctrl-C arrives first
async fn until_interrupted<T>(
    work: impl Future<Output = agentq_foundation::Result<Option<T>>>,
) -> anyhow::Result<Option<T>> {
    tokio::select! {
        result = work => Ok(result?),
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\nInterrupted. The running command returns to pending on next start.");
            Ok(None)
        }
    }
}

fn print_summary(summary: &ProcessSummary) {
    if summary.processed() == 0 {
        println!("Queue is empty.");
        return;
    }
    println!(
        "\nQueue drained: {} completed, {} failed",
        summary.completed.len(),
        summary.failed.len()
    );
    for id in &summary.failed {
        println!("  ✗ command {} failed (see `agentq show-command {}`)", id, id);
    }
}

// ============================================================================
// Status and maintenance
// ============================================================================

pub fn queue_status(controller: &QueueController, json: bool) -> anyhow::Result<()> {
    let status = controller.status()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print_status(&status);
    }
    Ok(())
}

fn print_status(status: &QueueStatus) {
    println!("\nQueue Status\n");

    let processor = match (status.processor_running, status.current_executing_id) {
        (true, Some(id)) => format!("running (executing {})", id),
        (true, None) => "running".to_string(),
        (false, _) => "idle".to_string(),
    };
    println!("Processor: {}", processor);

    let counts: Vec<String> = CommandStatus::ALL
        .iter()
        .map(|s| format!("{} {}", status.counts.get(*s), s))
        .collect();
    println!("Commands:  {}\n", counts.join(", "));

    if status.recent.is_empty() {
        println!("No commands in queue.");
        return;
    }

    println!(
        "{:<6} {:<12} {:<54} {:<20}",
        "ID", "Status", "Task", "Created"
    );
    println!("{}", "-".repeat(94));
    for command in &status.recent {
        println!(
            "{:<6} {:<12} {:<54} {:<20}",
            command.id,
            format!("{} {}", command.status.symbol(), command.status),
            command.task_summary,
            local_time(&command.created_at)
        );
        println!("       in {}", command.working_directory.display());
    }
    println!();
}

pub fn show_command(controller: &QueueController, id: CommandId) -> anyhow::Result<()> {
    let record = controller.get(id)?;
    print_record(&record);
    Ok(())
}

fn print_record(record: &CommandRecord) {
    println!("\nCommand {}\n", record.id);
    println!("Status:    {} {}", record.status.symbol(), record.status);
    println!("Task:      {}", record.task.summary());
    println!("Directory: {}", record.working_directory.display());
    println!("Created:   {}", local_time(&record.created_at));
    if let Some(started) = &record.started_at {
        println!("Started:   {}", local_time(started));
    }
    if let Some(finished) = &record.finished_at {
        println!("Finished:  {}", local_time(finished));
    }
    if let Some(duration) = record.duration() {
        println!("Duration:  {}s", duration.as_secs());
    }
    if record.attempts > 0 {
        println!("Attempts:  {}", record.attempts);
    }
    if let Some(error) = &record.error {
        println!("Error:     {}", error);
    }

    if !record.options.is_empty() {
        println!("\nOptions:");
        for (key, value) in record.options.masked() {
            println!("  {:<18} {}", key, value);
        }
    }
    if let Some(refs) = &record.result_refs {
        println!("\nResults:");
        for (name, location) in refs {
            println!("  {:<18} {}", name, location);
        }
    }
    println!();
}

pub fn cancel_command(controller: &QueueController, id: CommandId) -> anyhow::Result<()> {
    controller.cancel(id)?;
    println!("✓ Cancelled command {}", id);
    Ok(())
}

pub fn clear_all(controller: &QueueController) -> anyhow::Result<()> {
    let report = controller.clear_all()?;
    println!(
        "✓ Cancelled {} pending, removed {} finished commands",
        report.cancelled, report.purged
    );
    Ok(())
}

pub fn clear_completed(controller: &QueueController) -> anyhow::Result<()> {
    let purged = controller.clear_completed()?;
    println!("✓ Removed {} finished commands", purged);
    Ok(())
}

fn local_time(time: &DateTime<Utc>) -> String {
    time.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}
