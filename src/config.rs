//! Configuration options for script execution.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration options for a scripting session.
///
/// Options can be embedded in a host's configuration file; missing fields
/// take their default values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptOptions {
    /// Wall time after which a running script is declared slow.
    /// A slow script keeps running but yields to the host scheduler and
    /// becomes killable. `None` or a zero duration disables the hook.
    /// Default: 5 seconds
    pub time_limit: Option<Duration>,

    /// Number of interpreter instructions between two hook firings.
    /// Timeout and kill detection cannot be finer than this.
    /// Default: 100000
    pub hook_instruction_interval: u32,

    /// Maximum table nesting converted into a reply.
    /// Default: 512
    pub max_reply_depth: usize,

    /// Capacity of each session's control-event queue.
    /// Default: 64
    pub control_queue_capacity: usize,
}

impl Default for ScriptOptions {
    fn default() -> Self {
        Self {
            time_limit: Some(Duration::from_millis(5000)),
            hook_instruction_interval: 100_000,
            max_reply_depth: 512,
            control_queue_capacity: 64,
        }
    }
}

impl ScriptOptions {
    /// Creates a new ScriptOptions with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the slow-script time limit.
    pub fn time_limit(mut self, limit: Option<Duration>) -> Self {
        self.time_limit = limit;
        self
    }

    /// Sets the hook interval, in instructions.
    pub fn hook_instruction_interval(mut self, interval: u32) -> Self {
        self.hook_instruction_interval = interval;
        self
    }

    /// Sets the maximum reply nesting depth.
    pub fn max_reply_depth(mut self, depth: usize) -> Self {
        self.max_reply_depth = depth;
        self
    }

    /// Sets the control queue capacity.
    pub fn control_queue_capacity(mut self, capacity: usize) -> Self {
        self.control_queue_capacity = capacity;
        self
    }

    /// Returns the time limit if the cooperative hook should be installed.
    pub fn effective_time_limit(&self) -> Option<Duration> {
        self.time_limit.filter(|limit| !limit.is_zero())
    }

    /// Validates the options and returns an error if any are invalid.
    pub fn validate(&self) -> crate::Result<()> {
        if self.hook_instruction_interval == 0 {
            return Err(crate::Error::invalid_argument(
                "hook_instruction_interval must be > 0",
            ));
        }
        if self.max_reply_depth == 0 {
            return Err(crate::Error::invalid_argument("max_reply_depth must be > 0"));
        }
        if self.control_queue_capacity == 0 {
            return Err(crate::Error::invalid_argument(
                "control_queue_capacity must be > 0",
            ));
        }
        Ok(())
    }
}
