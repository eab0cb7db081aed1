//! Command record definition and types

use crate::state::CommandStatus;
use agentq_foundation::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

/// Characters kept in a task summary before it is truncated
pub const TASK_SUMMARY_LEN: usize = 50;

/// Output locations produced by an execution (e.g. `trajectory`, `patch`)
pub type ResultRefs = BTreeMap<String, String>;

// ============================================================================
// CommandId
// ============================================================================

/// Unique identifier for a queued command.
///
/// Ids are allocated from a counter persisted with the queue, so they grow
/// monotonically and are never reused, even after a purge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(pub u64);

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CommandId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .trim_start_matches('#')
            .parse::<u64>()
            .map(CommandId)
            .map_err(|_| Error::InvalidRequest(format!("'{}' is not a command id", s)))
    }
}

// ============================================================================
// TaskSource
// ============================================================================

/// What the agent should work on: inline text or a task description file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskSource {
    Text(String),
    File(PathBuf),
}

impl TaskSource {
    /// Build from the two mutually exclusive inputs; exactly one must be set.
    pub fn from_parts(text: Option<String>, file: Option<PathBuf>) -> Result<Self> {
        match (text, file) {
            (Some(_), Some(_)) => Err(Error::InvalidRequest(
                "cannot use both a task string and a task file".to_string(),
            )),
            (None, None) => Err(Error::InvalidRequest(
                "must provide either a task string or a task file".to_string(),
            )),
            (Some(text), None) => {
                if text.trim().is_empty() {
                    return Err(Error::InvalidRequest("task text is empty".to_string()));
                }
                Ok(TaskSource::Text(text))
            }
            (None, Some(file)) => Ok(TaskSource::File(file)),
        }
    }

    /// Task text, reading the file when the task is file-backed
    pub fn resolve(&self) -> Result<String> {
        match self {
            TaskSource::Text(text) => Ok(text.clone()),
            TaskSource::File(path) => std::fs::read_to_string(path).map_err(|e| {
                Error::Execution(format!("cannot read task file {}: {}", path.display(), e))
            }),
        }
    }

    /// One-line preview for listings
    pub fn summary(&self) -> String {
        match self {
            TaskSource::Text(text) => truncate(text, TASK_SUMMARY_LEN),
            TaskSource::File(path) => truncate(&format!("@{}", path.display()), TASK_SUMMARY_LEN),
        }
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    let flat = s.replace(['\n', '\r'], " ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        let head: String = flat.chars().take(max_chars).collect();
        format!("{}...", head)
    }
}

// ============================================================================
// CommandOptions
// ============================================================================

/// A single option value; the queue stores these without interpreting them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl std::fmt::Display for OptionValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OptionValue::Bool(v) => write!(f, "{}", v),
            OptionValue::Int(v) => write!(f, "{}", v),
            OptionValue::Float(v) => write!(f, "{}", v),
            OptionValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<bool> for OptionValue {
    fn from(v: bool) -> Self {
        OptionValue::Bool(v)
    }
}

impl From<i64> for OptionValue {
    fn from(v: i64) -> Self {
        OptionValue::Int(v)
    }
}

impl From<u32> for OptionValue {
    fn from(v: u32) -> Self {
        OptionValue::Int(i64::from(v))
    }
}

impl From<f64> for OptionValue {
    fn from(v: f64) -> Self {
        OptionValue::Float(v)
    }
}

impl From<String> for OptionValue {
    fn from(v: String) -> Self {
        OptionValue::Text(v)
    }
}

impl From<&str> for OptionValue {
    fn from(v: &str) -> Self {
        OptionValue::Text(v.to_string())
    }
}

/// Execution parameters captured at enqueue time and passed through verbatim
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandOptions(BTreeMap<String, OptionValue>);

impl CommandOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<OptionValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<OptionValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(OptionValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &OptionValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Display pairs with credential-looking values masked
    pub fn masked(&self) -> Vec<(String, String)> {
        self.0
            .iter()
            .map(|(k, v)| {
                let value = if is_sensitive_key(k) {
                    "********".to_string()
                } else {
                    v.to_string()
                };
                (k.clone(), value)
            })
            .collect()
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    ["key", "token", "secret", "password", "credential"]
        .iter()
        .any(|needle| key.contains(needle))
}

// ============================================================================
// CommandRecord
// ============================================================================

/// Validated input for a new record
#[derive(Debug, Clone)]
pub struct NewCommand {
    pub task: TaskSource,
    pub working_directory: PathBuf,
    pub options: CommandOptions,
}

/// One queued unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRecord {
    /// Unique command identifier
    pub id: CommandId,

    /// Task text or task file
    pub task: TaskSource,

    /// Absolute directory the executor runs in
    pub working_directory: PathBuf,

    /// Opaque execution parameters
    #[serde(default)]
    pub options: CommandOptions,

    /// Current state
    pub status: CommandStatus,

    /// When the command was enqueued
    pub created_at: DateTime<Utc>,

    /// When the processor claimed it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// When it left `running`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    /// Failure description, only for `failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Outputs reported by the executor, only for `completed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_refs: Option<ResultRefs>,

    /// Executor invocations made for the current run
    #[serde(default)]
    pub attempts: u32,
}

impl CommandRecord {
    pub(crate) fn new(id: CommandId, command: NewCommand, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            task: command.task,
            working_directory: command.working_directory,
            options: command.options,
            status: CommandStatus::Pending,
            created_at,
            started_at: None,
            finished_at: None,
            error: None,
            result_refs: None,
            attempts: 0,
        }
    }

    fn transition(&mut self, next: CommandStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::invalid_transition(self.id, self.status, next));
        }
        self.status = next;
        Ok(())
    }

    /// Mark command as running
    pub(crate) fn start(&mut self) -> Result<()> {
        self.transition(CommandStatus::Running)?;
        self.started_at = Some(Utc::now());
        self.finished_at = None;
        self.attempts = 0;
        Ok(())
    }

    /// Mark command as completed successfully
    pub(crate) fn complete(&mut self, result_refs: ResultRefs) -> Result<()> {
        self.transition(CommandStatus::Completed)?;
        self.finished_at = Some(Utc::now());
        self.error = None;
        self.result_refs = (!result_refs.is_empty()).then_some(result_refs);
        Ok(())
    }

    /// Mark command as failed
    pub(crate) fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition(CommandStatus::Failed)?;
        let error = error.into();
        self.finished_at = Some(Utc::now());
        self.error = Some(if error.trim().is_empty() {
            "execution failed without a message".to_string()
        } else {
            error
        });
        Ok(())
    }

    /// Mark command as cancelled
    pub(crate) fn cancel(&mut self) -> Result<()> {
        self.transition(CommandStatus::Cancelled)
    }

    /// Crash recovery: a `running` record found at load goes back to `pending`.
    /// Returns whether anything changed.
    pub(crate) fn recover(&mut self) -> bool {
        if !self.status.is_running() {
            return false;
        }
        self.status = CommandStatus::Pending;
        self.started_at = None;
        self.attempts = 0;
        true
    }

    /// Get execution duration if the command has started
    pub fn duration(&self) -> Option<std::time::Duration> {
        let start = self.started_at?;
        let end = self.finished_at.unwrap_or_else(Utc::now);
        Some((end - start).to_std().unwrap_or_default())
    }

    pub fn summary(&self) -> CommandSummary {
        CommandSummary {
            id: self.id,
            status: self.status,
            task_summary: self.task.summary(),
            working_directory: self.working_directory.clone(),
            created_at: self.created_at,
        }
    }
}

/// Brief record metadata for status listings
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandSummary {
    pub id: CommandId,
    pub status: CommandStatus,
    pub task_summary: String,
    pub working_directory: PathBuf,
    pub created_at: DateTime<Utc>,
}
