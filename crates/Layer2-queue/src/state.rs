//! Command state machine

use serde::{Deserialize, Serialize};

/// Lifecycle state of a queued command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    /// Waiting for the processor
    Pending,

    /// Claimed by the processor and handed to the executor
    Running,

    /// Executor returned successfully
    Completed,

    /// Executor returned an error
    Failed,

    /// Cancelled before it started
    Cancelled,
}

impl CommandStatus {
    pub const ALL: [CommandStatus; 5] = [
        CommandStatus::Pending,
        CommandStatus::Running,
        CommandStatus::Completed,
        CommandStatus::Failed,
        CommandStatus::Cancelled,
    ];

    /// Check if this is a terminal state (cannot transition further)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandStatus::Completed | CommandStatus::Failed | CommandStatus::Cancelled
        )
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, CommandStatus::Pending)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, CommandStatus::Running)
    }

    /// Transitions allowed during normal operation.
    ///
    /// `Running -> Pending` is not listed: it only happens through
    /// crash recovery when the store is loaded.
    pub fn can_transition_to(&self, next: CommandStatus) -> bool {
        use CommandStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, Cancelled) | (Running, Completed) | (Running, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Running => "running",
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
            CommandStatus::Cancelled => "cancelled",
        }
    }

    /// Get a symbol for the state (for terminal output)
    pub fn symbol(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "◯",
            CommandStatus::Running => "⟳",
            CommandStatus::Completed => "✓",
            CommandStatus::Failed => "✗",
            CommandStatus::Cancelled => "⊘",
        }
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
