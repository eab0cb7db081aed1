//! Storage module for AgentQ
//!
//! - `json`: JSON documents on disk, replaced atomically
//! - `lock`: advisory file locks shared between processes

mod json;
mod lock;

pub use json::{write_atomic, JsonStore};
pub use lock::FileLock;
