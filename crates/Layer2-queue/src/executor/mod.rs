//! Execution backends
//!
//! - `ProcessExecutor` - launches the agent CLI as a child process
//!
//! Implement [`Executor`] to plug in a different backend.

pub mod process;
pub mod r#trait;

pub use process::ProcessExecutor;
pub use r#trait::{ExecutionOutcome, ExecutionRequest, Executor};
