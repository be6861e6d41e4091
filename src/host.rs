//! Interfaces to the host server.
//!
//! The scripting subsystem does not own a command table, a script store or
//! an event loop. It is handed capabilities implementing the traits below
//! when a session's executor is built, which keeps script-to-host
//! reentrancy explicit and lets tests plug in fakes.

use crate::{ReplyValue, Result};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::script::control::ScriptControl;

/// Identifier of a client session.
pub type SessionId = u64;

/// What the command table knows about a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandInfo {
    /// Whether the command may be invoked through `redis.call`.
    pub script_eligible: bool,
}

impl CommandInfo {
    /// A command scripts may call.
    pub fn scriptable() -> Self {
        Self {
            script_eligible: true,
        }
    }

    /// A command flagged as unavailable to scripts.
    pub fn no_script() -> Self {
        Self {
            script_eligible: false,
        }
    }
}

/// The host's command dispatch path.
///
/// `dispatch` runs synchronously on the calling session and must not
/// replicate the command by itself; replication of the whole script is the
/// host's job.
pub trait CommandDispatcher {
    /// Looks up a command by lowercase name.
    fn find_handler(&self, name: &str) -> Option<CommandInfo>;

    /// Executes `name` with `args` (command name excluded) for `session`.
    fn dispatch(&self, session: SessionId, name: &str, args: &[Bytes]) -> ReplyValue;
}

/// Persistent storage of script bodies, keyed by function name (`f_<digest>`).
pub trait ScriptStore: Send + Sync {
    /// Saves a body under `name`. Saving the same pair twice is harmless.
    fn save(&self, name: &str, body: &[u8]) -> Result<()>;

    /// Returns the body stored under `name`, if any.
    fn get(&self, name: &str) -> Result<Option<Bytes>>;

    /// Discards every stored body.
    fn flush_all(&self) -> Result<()>;
}

/// The host scheduler cooperation point used during a slow script.
pub trait Scheduler {
    /// Lets the host make progress on other work before returning.
    fn yield_now(&self);
}

/// Scheduler that yields the OS thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadYield;

impl Scheduler for ThreadYield {
    fn yield_now(&self) {
        std::thread::yield_now();
    }
}

/// In-memory script store shared by all sessions of a process.
#[derive(Debug, Default)]
pub struct MemoryScriptStore {
    scripts: RwLock<HashMap<String, Bytes>>,
}

impl MemoryScriptStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored bodies.
    pub fn len(&self) -> usize {
        self.scripts.read().len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.scripts.read().is_empty()
    }
}

impl ScriptStore for MemoryScriptStore {
    fn save(&self, name: &str, body: &[u8]) -> Result<()> {
        self.scripts
            .write()
            .insert(name.to_string(), Bytes::copy_from_slice(body));
        Ok(())
    }

    fn get(&self, name: &str) -> Result<Option<Bytes>> {
        Ok(self.scripts.read().get(name).cloned())
    }

    fn flush_all(&self) -> Result<()> {
        self.scripts.write().clear();
        Ok(())
    }
}

/// The collaborators a session's executor is built from.
#[derive(Clone)]
pub struct ScriptHost {
    /// Command table and dispatch path.
    pub dispatcher: Arc<dyn CommandDispatcher>,
    /// Persisted script bodies, shared by all sessions.
    pub store: Arc<dyn ScriptStore>,
    /// Cooperation point used while a slow script runs.
    pub scheduler: Arc<dyn Scheduler>,
    /// Cross-session kill/flush events.
    pub control: Arc<ScriptControl>,
}

impl ScriptHost {
    /// Creates a host with the thread-yielding scheduler.
    pub fn new(
        dispatcher: Arc<dyn CommandDispatcher>,
        store: Arc<dyn ScriptStore>,
        control: Arc<ScriptControl>,
    ) -> Self {
        Self {
            dispatcher,
            store,
            scheduler: Arc::new(ThreadYield),
            control,
        }
    }

    /// Replaces the scheduler.
    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }
}
