//! Per-session execution bookkeeping.
//!
//! The context is shared between the executor and the instruction hook it
//! installs, so it lives behind a `parking_lot::Mutex`:
//!
//! ```text
//! evaluate()                      hook (every N instructions)
//!   begin(digest) ────────────►   elapsed() >= limit → mark_timed_out()
//!   xpcall(f)                     drain events → apply(event)
//!   finish()     ◄─────────────   kill_requested() → raise
//! ```

use crate::script::control::ControlEvent;
use std::time::{Duration, Instant};

/// State of the script currently running on a session, if any.
#[derive(Debug, Default)]
pub struct ExecutionContext {
    executing: Option<String>,
    started: Option<Instant>,
    kill_requested: bool,
    timed_out: bool,
    flush_pending: bool,
}

impl ExecutionContext {
    /// Creates an idle context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the start of the script whose digest is `digest`.
    pub fn begin(&mut self, digest: &str) {
        self.executing = Some(digest.to_string());
        self.started = Some(Instant::now());
        self.kill_requested = false;
        self.timed_out = false;
    }

    /// Clears the running script; returns whether it was killed.
    pub fn finish(&mut self) -> bool {
        self.executing = None;
        self.started = None;
        self.timed_out = false;
        std::mem::take(&mut self.kill_requested)
    }

    /// Digest of the running script.
    pub fn executing(&self) -> Option<&str> {
        self.executing.as_deref()
    }

    /// Time since the running script started.
    pub fn elapsed(&self) -> Option<Duration> {
        self.started.map(|started| started.elapsed())
    }

    /// Whether the running script has passed its time limit.
    pub fn is_timed_out(&self) -> bool {
        self.timed_out
    }

    /// Flags the running script as slow; true only the first time.
    pub fn mark_timed_out(&mut self) -> bool {
        !std::mem::replace(&mut self.timed_out, true)
    }

    /// Whether a kill request matched the running script.
    pub fn kill_requested(&self) -> bool {
        self.kill_requested
    }

    /// Applies a control event.
    ///
    /// A kill only sticks if it names what is running right now; a flush is
    /// remembered until the next invocation boundary.
    pub fn apply(&mut self, event: &ControlEvent) {
        match event {
            ControlEvent::Kill(target) => {
                if let Some(name) = self.executing.as_deref() {
                    if target.matches(name) {
                        self.kill_requested = true;
                    }
                }
            }
            ControlEvent::Flush { .. } => self.flush_pending = true,
        }
    }

    /// Takes the pending flush flag.
    pub fn take_flush_pending(&mut self) -> bool {
        std::mem::take(&mut self.flush_pending)
    }
}
