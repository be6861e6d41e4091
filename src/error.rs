//! Error types for the scripting subsystem.
//!
//! Every variant renders to the text that is sent back to the client as an
//! error reply, so `to_string()` is the wire message minus the protocol
//! framing.

use thiserror::Error;

/// The result type used throughout aidb-script.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for scripting operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed arguments passed to a bridge function or an entry point.
    #[error("ERR {0}")]
    InvalidArgument(String),

    /// `redis.call` named a command the host does not know.
    #[error("Unknown Redis command called from Lua script")]
    UnknownCommand,

    /// `redis.call` named a command flagged as unavailable to scripts.
    #[error("This Redis command is not allowed from scripts")]
    CommandNotScriptable,

    /// The script body failed to compile.
    #[error("ERR Error compiling script (new function): {0}")]
    Compile(String),

    /// A hash-only request had no cached or persisted body.
    #[error("NOSCRIPT No matching script. Please use EVAL.")]
    NoScript,

    /// The script raised an error while running.
    #[error("ERR Error running script (call to {function}): {message}")]
    Runtime {
        /// Name of the global function that failed (`f_<digest>`).
        function: String,
        /// Decorated interpreter message.
        message: String,
    },

    /// The script was aborted by a kill request.
    #[error("ERR Error running script (call to {0}): Script killed by user with SCRIPT KILL...")]
    Killed(String),

    /// The sandbox could not be built.
    #[error("ERR Lua sandbox initialization failed: {0}")]
    Init(String),

    /// The persisted script store failed.
    #[error("ERR script store: {0}")]
    Store(String),

    /// An interpreter failure outside of script execution.
    #[error("ERR Lua error: {0}")]
    Lua(#[from] mlua::Error),
}

impl Error {
    /// Creates a new invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Creates a new runtime error for the given function.
    pub fn runtime(function: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Runtime {
            function: function.into(),
            message: message.into(),
        }
    }

    /// Creates a new sandbox initialization error.
    pub fn init(msg: impl Into<String>) -> Self {
        Error::Init(msg.into())
    }

    /// Creates a new script store error.
    pub fn store(msg: impl Into<String>) -> Self {
        Error::Store(msg.into())
    }

    /// Returns true if the sandbox must be rebuilt before it is used again.
    pub fn requires_reset(&self) -> bool {
        matches!(self, Error::Killed(_) | Error::Init(_))
    }
}
