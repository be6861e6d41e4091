//! Lua scripting engine.
//!
//! # Architecture
//!
//! The scripting system consists of these components:
//!
//! - **bridge**: Converts replies to Lua values and back
//! - **command**: Runs `redis.call` / `redis.pcall` through the host
//! - **sandbox**: Builds the restricted interpreter and its libraries
//! - **msgpack**: Decodes `cmsgpack.unpack` input into Lua values
//! - **cache**: Maps script digests to compiled functions
//! - **context** / **control**: Per-session state and cross-session events
//! - **executor**: `LuaExecutor`, which drives an invocation end to end
//!
//! # Features
//!
//! - **Deterministic**: `math.random` is reseeded before every invocation
//! - **Sandboxed Execution**: no file access, no new globals at run time
//! - **Cooperative Timeouts**: slow scripts yield to the host and can be killed
//! - **Hash Invocation**: bodies are persisted and recompiled on demand
//!
//! # Example
//!
//! ```rust,no_run
//! use aidb_script::{LuaExecutor, MemoryScriptStore, ScriptControl, ScriptHost, ScriptOptions};
//! # use aidb_script::{CommandDispatcher, CommandInfo, ReplyValue, SessionId};
//! # use bytes::Bytes;
//! use std::sync::Arc;
//!
//! # struct Commands;
//! # impl CommandDispatcher for Commands {
//! #     fn find_handler(&self, _: &str) -> Option<CommandInfo> { None }
//! #     fn dispatch(&self, _: SessionId, _: &str, _: &[Bytes]) -> ReplyValue { ReplyValue::Nil }
//! # }
//! # fn main() -> Result<(), aidb_script::Error> {
//! let store = Arc::new(MemoryScriptStore::new());
//! let control = Arc::new(ScriptControl::new());
//! let host = ScriptHost::new(Arc::new(Commands), store, control);
//!
//! let mut executor = LuaExecutor::new(host, ScriptOptions::default())?;
//! let hash = executor.load(b"return ARGV[1]")?;
//! let reply = executor.eval_sha(&hash, &[], &[Bytes::from_static(b"hi")])?;
//! assert_eq!(reply, ReplyValue::bulk("hi"));
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod cache;
pub mod command;
pub mod context;
pub mod control;
pub mod executor;
pub mod msgpack;
pub mod rand;
pub mod sandbox;

pub use cache::{sha1_hex, FunctionCache};
pub use command::CommandBridge;
pub use context::ExecutionContext;
pub use control::{ControlEvent, KillTarget, ScriptControl, Subscription};
pub use executor::LuaExecutor;
pub use sandbox::Sandbox;
