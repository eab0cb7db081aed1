//! Error types for AgentQ
//!
//! All queue, storage and execution errors are collected here.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// AgentQ error type
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration
    // ========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    // ========================================================================
    // Queue requests
    // ========================================================================
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Command not cancellable: {0}")]
    NotCancellable(String),

    #[error("Invalid transition for command {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: String,
        to: String,
    },

    // ========================================================================
    // Storage
    // ========================================================================
    #[error("Queue store corrupt at {}: {message}", path.display())]
    StoreCorrupt { path: PathBuf, message: String },

    #[error("Persistence failure: {0}")]
    Persistence(String),

    // ========================================================================
    // Execution
    // ========================================================================
    #[error("Execution failed: {0}")]
    Execution(String),

    // ========================================================================
    // General
    // ========================================================================
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Errors caused by the caller's input; nothing was mutated.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Error::InvalidRequest(_) | Error::NotCancellable(_) | Error::NotFound(_)
        )
    }

    pub fn store_corrupt(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Error::StoreCorrupt {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn invalid_transition(
        id: impl ToString,
        from: impl ToString,
        to: impl ToString,
    ) -> Self {
        Error::InvalidTransition {
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}
