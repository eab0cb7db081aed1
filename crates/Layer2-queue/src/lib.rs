//! # agentq-queue
//!
//! Persistent command queue for long-running agent tasks.
//! Commands survive process restarts and run one at a time, oldest first.
//!
//! ## Components
//!
//! - `CommandRecord` / `CommandStatus` - the unit of work and its state machine
//! - `QueueStore` - JSON-file store with locked read-modify-write and crash recovery
//! - `QueueProcessor` - single background worker draining pending commands
//! - `QueueController` - enqueue, status, cancel, clear and start
//! - `Executor` - pluggable execution backend (`ProcessExecutor` by default)

pub mod command;
pub mod controller;
pub mod executor;
pub mod processor;
pub mod state;
pub mod store;

pub use command::{
    CommandId, CommandOptions, CommandRecord, CommandSummary, NewCommand, OptionValue,
    ResultRefs, TaskSource, TASK_SUMMARY_LEN,
};
pub use controller::{ClearReport, EnqueueRequest, QueueController, QueueStatus, StartReport};
pub use executor::{ExecutionOutcome, ExecutionRequest, Executor, ProcessExecutor};
pub use processor::{ProcessSummary, ProcessorHandle, QueueProcessor, StartOutcome};
pub use state::CommandStatus;
pub use store::{
    QueueDocument, QueueSnapshot, QueueStore, StatusCounts, StatusUpdate, WorkerLease,
    STORE_VERSION,
};
