//! Config - queue settings
//!
//! - `queue.rs` - QueueConfig (global + project merge)

mod queue;

pub use queue::{
    QueueConfig, CONFIG_FILE, DEFAULT_AGENT_COMMAND, DEFAULT_MAX_ATTEMPTS, DEFAULT_RECENT_LIMIT,
    QUEUE_FILE,
};
