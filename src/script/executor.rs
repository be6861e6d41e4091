//! Lua script execution for one session.
//!
//! `LuaExecutor` owns a session's sandbox and drives every invocation:
//! resolve the function, bind `KEYS`/`ARGV`, run it under the cooperative
//! hook, and turn the outcome into a reply.

use crate::config::ScriptOptions;
use crate::host::{ScriptHost, SessionId};
use crate::script::bridge::to_reply_value;
use crate::script::cache::{
    function_name, sha1_hex, FunctionCache, DIGEST_HEX_LEN, FUNCTION_PREFIX,
};
use crate::script::command::CommandBridge;
use crate::script::context::ExecutionContext;
use crate::script::control::Subscription;
use crate::script::sandbox::{Sandbox, ERROR_HANDLER};
use crate::{Error, ReplyValue, Result};
use bytes::Bytes;
use mlua::{Function, HookTriggers, Lua, Table, Value};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

const KILLED_MESSAGE: &str = "Script killed by user with SCRIPT KILL...";
const TRACEBACK_MARKER: &str = "stack traceback:";

/// Executes scripts on behalf of one session.
///
/// An executor is not `Send`: the interpreter it owns is bound to the
/// session's thread and runs one script at a time. Sessions interact only
/// through the shared [`ScriptStore`](crate::ScriptStore) and
/// [`ScriptControl`](crate::ScriptControl).
///
/// # Example
///
/// ```rust
/// use aidb_script::{
///     CommandDispatcher, CommandInfo, LuaExecutor, MemoryScriptStore, ReplyValue,
///     ScriptControl, ScriptHost, ScriptOptions, SessionId,
/// };
/// use bytes::Bytes;
/// use std::sync::Arc;
///
/// struct Ping;
///
/// impl CommandDispatcher for Ping {
///     fn find_handler(&self, name: &str) -> Option<CommandInfo> {
///         (name == "ping").then(CommandInfo::scriptable)
///     }
///
///     fn dispatch(&self, _: SessionId, _: &str, _: &[Bytes]) -> ReplyValue {
///         ReplyValue::status("PONG")
///     }
/// }
///
/// # fn main() -> Result<(), aidb_script::Error> {
/// let host = ScriptHost::new(
///     Arc::new(Ping),
///     Arc::new(MemoryScriptStore::new()),
///     Arc::new(ScriptControl::new()),
/// );
/// let mut executor = LuaExecutor::new(host, ScriptOptions::default())?;
///
/// let reply = executor.eval(b"return redis.call('ping')", &[], &[])?;
/// assert_eq!(reply, ReplyValue::status("PONG"));
/// # Ok(())
/// # }
/// ```
pub struct LuaExecutor {
    sandbox: Sandbox,
    cache: FunctionCache,
    host: ScriptHost,
    options: ScriptOptions,
    context: Arc<Mutex<ExecutionContext>>,
    subscription: Arc<Subscription>,
}

impl LuaExecutor {
    /// Creates an executor and subscribes it to the host's control hub.
    ///
    /// # Errors
    ///
    /// Returns an error if the options are invalid or the sandbox cannot be
    /// built.
    pub fn new(host: ScriptHost, options: ScriptOptions) -> Result<Self> {
        options.validate()?;

        let subscription = Arc::new(host.control.subscribe(options.control_queue_capacity));
        let session = subscription.id();
        let sandbox = Sandbox::new(CommandBridge::new(Arc::clone(&host.dispatcher), session))?;
        let cache = FunctionCache::new(Arc::clone(&host.store));

        log::debug!("Created Lua executor for session {}", session);

        Ok(Self {
            sandbox,
            cache,
            host,
            options,
            context: Arc::new(Mutex::new(ExecutionContext::new())),
            subscription,
        })
    }

    /// The session this executor runs scripts for.
    pub fn session(&self) -> SessionId {
        self.subscription.id()
    }

    /// Current options.
    pub fn options(&self) -> &ScriptOptions {
        &self.options
    }

    /// Changes the slow-script limit for subsequent invocations.
    pub fn set_time_limit(&mut self, limit: Option<Duration>) {
        self.options.time_limit = limit;
    }

    /// Runs a script given by source or by 40-character hash and returns
    /// the reply to send to the client; failures become error replies.
    pub fn evaluate(
        &mut self,
        script: &[u8],
        keys: &[Bytes],
        args: &[Bytes],
        is_hash: bool,
    ) -> ReplyValue {
        match self.run(script, keys, args, is_hash) {
            Ok(reply) => reply,
            Err(err) => {
                log::debug!("Script failed on session {}: {}", self.session(), err);
                err.into()
            }
        }
    }

    /// Runs a script given by source.
    pub fn eval(&mut self, source: &[u8], keys: &[Bytes], args: &[Bytes]) -> Result<ReplyValue> {
        self.run(source, keys, args, false)
    }

    /// Runs a previously loaded script by hash.
    pub fn eval_sha(&mut self, hash: &str, keys: &[Bytes], args: &[Bytes]) -> Result<ReplyValue> {
        self.run(hash.as_bytes(), keys, args, true)
    }

    /// Returns true if `hash` can be run without resending its source.
    pub fn exists(&mut self, hash: &str) -> Result<bool> {
        self.poll_control()?;
        let Some(name) = name_for_hash(hash.as_bytes()) else {
            return Ok(false);
        };
        if self.cache.lookup(self.sandbox.lua(), &name)?.is_some() {
            return Ok(true);
        }
        Ok(self.host.store.get(&name)?.is_some())
    }

    /// Compiles and persists `source` without running it; returns its hash.
    pub fn load(&mut self, source: &[u8]) -> Result<String> {
        self.poll_control()?;
        let digest = sha1_hex(source);
        self.cache
            .resolve(self.sandbox.lua(), &function_name(&digest), Some(source))?;
        Ok(digest)
    }

    /// Broadcasts a kill request to every session; returns how many were
    /// reached.
    pub fn request_kill(&self, target: &str) -> usize {
        self.host.control.request_kill(target)
    }

    /// Discards every persisted script, rebuilds this session's sandbox and
    /// tells the other sessions to rebuild theirs.
    pub fn request_flush(&mut self) -> Result<()> {
        self.host.store.flush_all()?;
        self.reset()?;
        self.host.control.request_flush(self.session());
        Ok(())
    }

    /// Replaces the sandbox with a freshly built one.
    ///
    /// If building fails the previous sandbox stays in place.
    pub fn reset(&mut self) -> Result<()> {
        let bridge = CommandBridge::new(Arc::clone(&self.host.dispatcher), self.session());
        self.sandbox = Sandbox::new(bridge)?;
        *self.context.lock() = ExecutionContext::new();
        log::info!("Lua sandbox of session {} reset", self.session());
        Ok(())
    }

    /// Applies queued control events; a remote flush resets the sandbox.
    ///
    /// A flush the hook already drained during a slow script is still
    /// pending here and is honoured too.
    pub fn poll_control(&mut self) -> Result<()> {
        let events = self.subscription.drain();
        let flush = {
            let mut ctx = self.context.lock();
            for event in &events {
                ctx.apply(event);
            }
            ctx.take_flush_pending()
        };
        if flush {
            self.reset()?;
        }
        Ok(())
    }

    fn run(
        &mut self,
        script: &[u8],
        keys: &[Bytes],
        args: &[Bytes],
        is_hash: bool,
    ) -> Result<ReplyValue> {
        self.poll_control()?;

        let (name, body) = if is_hash {
            (name_for_hash(script).ok_or(Error::NoScript)?, None)
        } else {
            (function_name(&sha1_hex(script)), Some(script))
        };

        let start = Instant::now();
        log::debug!("Running {} on session {}", name, self.session());

        let result = self.invoke(&name, body, keys, args);
        if let Err(Error::Killed(_)) = &result {
            if let Err(e) = self.reset() {
                log::warn!("Failed to reset sandbox after kill: {}", e);
            }
        }

        log::debug!("{} finished in {:?}", name, start.elapsed());
        result
    }

    fn invoke(
        &self,
        name: &str,
        body: Option<&[u8]>,
        keys: &[Bytes],
        args: &[Bytes],
    ) -> Result<ReplyValue> {
        let lua = self.sandbox.lua();
        let function = self.cache.resolve(lua, name, body)?;

        let globals = lua.globals();
        let handler: Function<'_> = globals.raw_get(ERROR_HANDLER)?;
        let xpcall: Function<'_> = globals.raw_get("xpcall")?;

        self.sandbox.reseed();
        globals.raw_set("KEYS", string_table(lua, keys)?)?;
        globals.raw_set("ARGV", string_table(lua, args)?)?;

        let digest = name.strip_prefix(FUNCTION_PREFIX).unwrap_or(name);
        self.context.lock().begin(digest);
        self.install_hook(lua);

        let outcome = xpcall.call::<_, (bool, Value<'_>)>((function, handler));

        lua.remove_hook();
        let killed = self.context.lock().finish();
        if let Err(e) = lua.gc_step() {
            log::debug!("Lua GC step failed: {}", e);
        }

        if killed {
            log::warn!("{} on session {} was killed", name, self.session());
            return Err(Error::Killed(name.to_string()));
        }

        match outcome {
            Ok((true, value)) => to_reply_value(&value, self.options.max_reply_depth)
                .map_err(|e| Error::runtime(name, e.to_string())),
            Ok((false, err)) => Err(Error::runtime(name, error_message(&err))),
            Err(e) => Err(Error::runtime(name, single_line(&e.to_string()))),
        }
    }

    /// Installs the slow-script hook when a time limit is configured.
    fn install_hook(&self, lua: &Lua) {
        let Some(limit) = self.options.effective_time_limit() else {
            return;
        };

        let context = Arc::clone(&self.context);
        let subscription = Arc::clone(&self.subscription);
        let scheduler = Arc::clone(&self.host.scheduler);

        lua.set_hook(
            HookTriggers {
                every_nth_instruction: Some(self.options.hook_instruction_interval),
                ..Default::default()
            },
            move |_lua, _debug| {
                let mut ctx = context.lock();
                if !ctx.is_timed_out() {
                    if let Some(elapsed) = ctx.elapsed().filter(|elapsed| *elapsed >= limit) {
                        if ctx.mark_timed_out() {
                            log::warn!(
                                "Lua slow script detected: {} still in execution after {} milliseconds. \
                                 You can try killing the script using the SCRIPT KILL command.",
                                ctx.executing().unwrap_or("?"),
                                elapsed.as_millis()
                            );
                        }
                    }
                }

                if ctx.is_timed_out() {
                    drop(ctx);
                    scheduler.yield_now();
                    let events = subscription.drain();
                    ctx = context.lock();
                    for event in &events {
                        ctx.apply(event);
                    }
                }

                if ctx.kill_requested() {
                    log::warn!("Lua script killed by user with SCRIPT KILL.");
                    return Err(mlua::Error::RuntimeError(KILLED_MESSAGE.to_string()));
                }
                Ok(())
            },
        );
    }
}

/// Function name for a client supplied hash; `None` unless it is 40 hex
/// characters.
fn name_for_hash(hash: &[u8]) -> Option<String> {
    if hash.len() != DIGEST_HEX_LEN || !hash.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    let digest = String::from_utf8_lossy(hash).to_ascii_lowercase();
    Some(function_name(&digest))
}

fn string_table<'lua>(lua: &'lua Lua, items: &[Bytes]) -> mlua::Result<Table<'lua>> {
    let table = lua.create_table()?;
    for (i, item) in items.iter().enumerate() {
        table.raw_set(i + 1, lua.create_string(item)?)?;
    }
    Ok(table)
}

/// Error text as a single line, without the traceback mlua appends to
/// errors raised by Rust callbacks.
fn error_message(err: &Value<'_>) -> String {
    match err {
        Value::String(s) => single_line(&String::from_utf8_lossy(s.as_bytes())),
        Value::Nil => "unknown error".to_string(),
        other => single_line(&format!("{:?}", other)),
    }
}

fn single_line(message: &str) -> String {
    let message = match message.find(TRACEBACK_MARKER) {
        Some(at) => &message[..at],
        None => message,
    };
    message.trim_end().replace(['\r', '\n'], " ")
}
