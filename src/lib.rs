//! # aidb-script - Embedded Lua Scripting for a Redis-Protocol Store
//!
//! aidb-script runs client supplied Lua scripts inside a sandboxed
//! interpreter, one per client session. Scripts issue store commands through
//! `redis.call` / `redis.pcall` and their result is converted into the
//! store's reply representation.
//!
//! ## Architecture
//!
//! The subsystem consists of several key components:
//!
//! - **Value Bridge**: Converts between replies and Lua values
//! - **Sandbox**: A restricted interpreter with `cjson`, `cmsgpack` and `struct`
//! - **Function Cache**: Compiles each body once, keyed by its SHA-1 digest
//! - **Executor**: Runs invocations with timeout, kill and flush handling
//! - **Command Bridge**: Dispatches script commands on the calling session
//!
//! The host server plugs in through the traits of the [`host`] module.
//!
//! ## Example Usage
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
//! let host = ScriptHost::new(
//!     Arc::new(Commands),
//!     Arc::new(MemoryScriptStore::new()),
//!     Arc::new(ScriptControl::new()),
//! );
//! let mut executor = LuaExecutor::new(host, ScriptOptions::default())?;
//!
//! let reply = executor.evaluate(b"return {1, 2, 3}", &[], &[], false);
//! println!("{:?}", reply);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// Module declarations
pub mod config;
pub mod error;
pub mod host;
pub mod reply;
pub mod script;

// Re-exports
pub use config::ScriptOptions;
pub use error::{Error, Result};
pub use host::{
    CommandDispatcher, CommandInfo, MemoryScriptStore, Scheduler, ScriptHost, ScriptStore,
    SessionId, ThreadYield,
};
pub use reply::ReplyValue;
pub use script::{ControlEvent, KillTarget, LuaExecutor, ScriptControl};
