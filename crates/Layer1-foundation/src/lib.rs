//! # agentq-foundation
//!
//! Foundation layer for AgentQ:
//! - Error: central error taxonomy shared by every layer
//! - Config: queue settings (global + project merge)
//! - Storage: JSON documents with atomic replace, advisory file locks

pub mod config;
pub mod error;
pub mod storage;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, Result};

// ============================================================================
// Config
// ============================================================================
pub use config::{
    QueueConfig, CONFIG_FILE, DEFAULT_AGENT_COMMAND, DEFAULT_MAX_ATTEMPTS, DEFAULT_RECENT_LIMIT,
    QUEUE_FILE,
};

// ============================================================================
// Storage
// ============================================================================
pub use storage::{write_atomic, FileLock, JsonStore};
