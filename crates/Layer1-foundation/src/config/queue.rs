//! Queue Config
//!
//! Settings are read from the global store first, then the project store;
//! values set in the project file win.

use crate::storage::JsonStore;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Settings file name
pub const CONFIG_FILE: &str = "config.json";

/// Queue file name inside the user data directory
pub const QUEUE_FILE: &str = "queue.json";

/// Number of records listed by `queue-status`
pub const DEFAULT_RECENT_LIMIT: usize = 10;

/// Executor invocations per record (1 = no retry)
pub const DEFAULT_MAX_ATTEMPTS: u32 = 1;

/// Program launched for each record by the process executor
pub const DEFAULT_AGENT_COMMAND: &[&str] = &["trae-cli", "run"];

// ============================================================================
// Queue Config
// ============================================================================

/// AgentQ queue settings
///
/// Every field is optional so partial files can be layered; the accessors
/// resolve defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    /// Queue document location (default `~/.agentq/queue.json`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_file: Option<PathBuf>,

    /// Records shown by status reports
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recent_limit: Option<usize>,

    /// Upper bound on pending records; unlimited when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_pending: Option<usize>,

    /// Executor attempts per record before it is marked failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,

    /// Agent program and leading arguments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_command: Option<Vec<String>>,
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Load / Save
    // ========================================================================

    /// Global + project merged load
    pub fn load() -> Result<Self> {
        let mut config = Self::new();

        if let Ok(global) = JsonStore::global() {
            if let Some(global_config) = global.load_optional::<QueueConfig>(CONFIG_FILE)? {
                config.merge(global_config);
            }
        }

        if let Ok(project) = JsonStore::current_project() {
            if let Some(project_config) = project.load_optional::<QueueConfig>(CONFIG_FILE)? {
                config.merge(project_config);
            }
        }

        Ok(config)
    }

    /// Load from a single store only
    pub fn load_from(store: &JsonStore) -> Result<Self> {
        Ok(store
            .load_optional::<QueueConfig>(CONFIG_FILE)?
            .unwrap_or_default())
    }

    pub fn save_to(&self, store: &JsonStore) -> Result<()> {
        store.save(CONFIG_FILE, self)
    }

    // ========================================================================
    // Merge
    // ========================================================================

    /// Merge another config into this one (`other` wins)
    pub fn merge(&mut self, other: QueueConfig) {
        if other.queue_file.is_some() {
            self.queue_file = other.queue_file;
        }
        if other.recent_limit.is_some() {
            self.recent_limit = other.recent_limit;
        }
        if other.max_pending.is_some() {
            self.max_pending = other.max_pending;
        }
        if other.max_attempts.is_some() {
            self.max_attempts = other.max_attempts;
        }
        if other.agent_command.is_some() {
            self.agent_command = other.agent_command;
        }
    }

    // ========================================================================
    // Resolved values
    // ========================================================================

    pub fn queue_file(&self) -> Result<PathBuf> {
        match &self.queue_file {
            Some(path) => Ok(path.clone()),
            None => Ok(JsonStore::user_data()?.file_path(QUEUE_FILE)),
        }
    }

    pub fn recent_limit(&self) -> usize {
        self.recent_limit.unwrap_or(DEFAULT_RECENT_LIMIT)
    }

    pub fn max_pending(&self) -> Option<usize> {
        self.max_pending
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS).max(1)
    }

    pub fn agent_command(&self) -> Vec<String> {
        match &self.agent_command {
            Some(cmd) if !cmd.is_empty() => cmd.clone(),
            _ => DEFAULT_AGENT_COMMAND.iter().map(|s| s.to_string()).collect(),
        }
    }

    // ========================================================================
    // Builder
    // ========================================================================

    pub fn with_queue_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.queue_file = Some(path.into());
        self
    }

    pub fn with_max_pending(mut self, max: usize) -> Self {
        self.max_pending = Some(max);
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_agent_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.agent_command = Some(command.into_iter().map(Into::into).collect());
        self
    }
}
