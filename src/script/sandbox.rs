//! Construction of the restricted interpreter a session runs scripts in.
//!
//! Bootstrap order matters: libraries first, then the `redis` namespace and
//! the deterministic `math.random`, then the pcall error handler, and the
//! global guard last so the installation traffic above is not rejected by
//! it.

use crate::script::bridge::single_field_table;
use crate::script::cache::sha1_hex;
use crate::script::command::CommandBridge;
use crate::script::msgpack;
use crate::script::rand::Rand48;
use crate::{Error, Result};
use mlua::{Lua, LuaOptions, LuaSerdeExt, StdLib, Table, Value, Variadic};
use parking_lot::Mutex;
use std::sync::Arc;

/// Globals under which the command namespace is exposed.
pub const NAMESPACE_ALIASES: [&str; 2] = ["redis", "server"];

/// Global holding the message handler used for every protected call.
pub const ERROR_HANDLER: &str = "__redis__err__handler";

/// Chunk name of user script bodies; shows up in error positions.
pub const USER_SCRIPT_CHUNK: &str = "@user_script";

/// `redis.log` level constants. Valid levels run from 0 (fatal) to 5 (trace).
pub const LOG_WARNING: i64 = 2;
/// See [`LOG_WARNING`].
pub const LOG_NOTICE: i64 = 3;
/// See [`LOG_WARNING`].
pub const LOG_DEBUG: i64 = 4;
/// See [`LOG_WARNING`].
pub const LOG_VERBOSE: i64 = 5;

/// Log target of messages emitted through `redis.log`.
pub const LOG_TARGET: &str = "aidb_script::lua";

const BRIDGE_CHUNK_NAME: &str = "@redis_bridge";

// `call` raises failures with the plain error text, `pcall` hands back the
// `{err = ...}` table. Argument errors are never raised.
const BRIDGE_CHUNK: &str = r#"
local dispatch, namespace = ...
local error = error

namespace.call = function(...)
  local reply, failed = dispatch(...)
  if failed then
    error(reply.err, 0)
  end
  return reply
end

namespace.pcall = function(...)
  local reply = dispatch(...)
  return reply
end
"#;

const STRUCT_CHUNK: &str = r#"
struct = { pack = string.pack, unpack = string.unpack, size = string.packsize }
"#;

// Positions refer to the innermost frame that is script code, skipping C
// functions and the bridge wrappers.
const ERROR_HANDLER_CHUNK: &str = r#"
function __redis__err__handler(err)
  local level = 2
  local info = debug.getinfo(level, 'nSl')
  while info and (info.what == 'C' or info.source == '@redis_bridge') do
    level = level + 1
    info = debug.getinfo(level, 'nSl')
  end
  if info then
    return info.source .. ':' .. info.currentline .. ': ' .. tostring(err)
  end
  return tostring(err)
end
"#;

// Main chunks (function definitions) and C code may touch globals freely.
const GLOBALS_PROTECTION_CHUNK: &str = r#"
local getinfo, error, rawset, rawget, tostring = debug.getinfo, error, rawset, rawget, tostring
local mt = {}
setmetatable(_G, mt)
mt.__newindex = function (t, n, v)
  if getinfo(2) then
    local w = getinfo(2, "S").what
    if w ~= "main" and w ~= "C" then
      error("Script attempted to create global variable '" .. tostring(n) .. "'", 2)
    end
  end
  rawset(t, n, v)
end
mt.__index = function (t, n)
  if getinfo(2) and getinfo(2, "S").what ~= "C" then
    error("Script attempted to access nonexistent global variable '" .. tostring(n) .. "'", 2)
  end
  return rawget(t, n)
end
"#;

/// One isolated interpreter with the scripting API installed.
pub struct Sandbox {
    lua: Lua,
    rng: Arc<Mutex<Rand48>>,
}

impl Sandbox {
    /// Builds a fresh sandbox whose `redis.call` goes through `bridge`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Init` if any library or bootstrap chunk fails; a
    /// partially initialized interpreter is never returned.
    pub fn new(bridge: CommandBridge) -> Result<Self> {
        let libs = StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::DEBUG;
        // SAFETY: `debug` is only unsafe because it can break memory safety
        // guarantees of Rust values held by Lua. The global guard needs
        // `debug.getinfo`, and no Rust userdata is exposed to scripts.
        let lua = unsafe { Lua::unsafe_new_with(libs, LuaOptions::default()) };

        let sandbox = Self {
            lua,
            rng: Arc::new(Mutex::new(Rand48::default())),
        };
        sandbox
            .bootstrap(bridge)
            .map_err(|e| Error::init(e.to_string()))?;
        log::debug!("Lua sandbox initialized");
        Ok(sandbox)
    }

    /// The underlying interpreter.
    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    /// Resets `math.random` to its fixed starting seed.
    pub fn reseed(&self) {
        self.rng.lock().seed(0);
    }

    fn bootstrap(&self, bridge: CommandBridge) -> mlua::Result<()> {
        self.remove_unsupported()?;
        self.load_codecs()?;
        self.install_namespace(bridge)?;
        self.install_random()?;
        self.run_chunk(ERROR_HANDLER_CHUNK, "@err_handler_def")?;
        self.run_chunk(GLOBALS_PROTECTION_CHUNK, "@enable_strict_lua")?;
        Ok(())
    }

    fn run_chunk(&self, source: &str, name: &str) -> mlua::Result<()> {
        self.lua.load(source).set_name(name).exec()
    }

    fn remove_unsupported(&self) -> mlua::Result<()> {
        let globals = self.lua.globals();
        globals.set("loadfile", Value::Nil)?;
        globals.set("dofile", Value::Nil)?;
        Ok(())
    }

    /// Installs `cjson`, `struct` and `cmsgpack`.
    fn load_codecs(&self) -> mlua::Result<()> {
        let lua = &self.lua;
        let globals = lua.globals();

        let cjson = lua.create_table()?;
        cjson.set(
            "encode",
            lua.create_function(|lua, value: Value<'_>| {
                let json = serde_json::to_vec(&value).map_err(mlua::Error::external)?;
                lua.create_string(json)
            })?,
        )?;
        cjson.set(
            "decode",
            lua.create_function(|lua, data: mlua::String<'_>| {
                let json: serde_json::Value =
                    serde_json::from_slice(data.as_bytes()).map_err(mlua::Error::external)?;
                lua.to_value(&json)
            })?,
        )?;
        cjson.set("null", lua.null())?;
        globals.set("cjson", cjson)?;

        let cmsgpack = lua.create_table()?;
        cmsgpack.set(
            "pack",
            lua.create_function(|lua, values: Variadic<Value<'_>>| {
                let mut out = Vec::new();
                for value in values.iter() {
                    rmp_serde::encode::write(&mut out, value).map_err(mlua::Error::external)?;
                }
                lua.create_string(out)
            })?,
        )?;
        cmsgpack.set(
            "unpack",
            lua.create_function(|lua, data: mlua::String<'_>| {
                msgpack::unpack(lua, data.as_bytes())
            })?,
        )?;
        globals.set("cmsgpack", cmsgpack)?;

        self.run_chunk(STRUCT_CHUNK, "@struct_def")
    }

    fn install_namespace(&self, bridge: CommandBridge) -> mlua::Result<()> {
        let lua = &self.lua;
        let namespace = lua.create_table()?;

        namespace.set("log", lua.create_function(script_log)?)?;
        namespace.set(
            "sha1hex",
            lua.create_function(|lua, args: Variadic<Value<'_>>| {
                if args.len() != 1 {
                    return error_value(lua, "wrong number of arguments");
                }
                match lua.coerce_string(args[0].clone())? {
                    Some(s) => Ok(Value::String(lua.create_string(sha1_hex(s.as_bytes()))?)),
                    None => error_value(lua, "wrong number or type of arguments"),
                }
            })?,
        )?;
        namespace.set(
            "error_reply",
            lua.create_function(|lua, args: Variadic<Value<'_>>| {
                single_field_reply(lua, "err", args)
            })?,
        )?;
        namespace.set(
            "status_reply",
            lua.create_function(|lua, args: Variadic<Value<'_>>| {
                single_field_reply(lua, "ok", args)
            })?,
        )?;
        namespace.set("LOG_DEBUG", LOG_DEBUG)?;
        namespace.set("LOG_VERBOSE", LOG_VERBOSE)?;
        namespace.set("LOG_NOTICE", LOG_NOTICE)?;
        namespace.set("LOG_WARNING", LOG_WARNING)?;

        let dispatch = lua.create_function(move |lua, args: Variadic<Value<'_>>| {
            bridge.call_from_lua(lua, args)
        })?;
        lua.load(BRIDGE_CHUNK)
            .set_name(BRIDGE_CHUNK_NAME)
            .call::<_, ()>((dispatch, namespace.clone()))?;

        let globals = lua.globals();
        for alias in NAMESPACE_ALIASES {
            globals.set(alias, namespace.clone())?;
        }
        Ok(())
    }

    fn install_random(&self) -> mlua::Result<()> {
        let lua = &self.lua;
        let math: Table<'_> = lua.globals().get("math")?;

        let rng = Arc::clone(&self.rng);
        math.set(
            "random",
            lua.create_function(move |lua, args: Variadic<Value<'_>>| {
                let r = rng.lock().next_f64();
                match args.len() {
                    0 => Ok(Value::Number(r)),
                    1 => {
                        let upper: i64 = lua.unpack(args[0].clone())?;
                        if upper < 1 {
                            return Err(interval_is_empty(1));
                        }
                        Ok(Value::Integer((r * upper as f64).floor() as i64 + 1))
                    }
                    2 => {
                        let lower: i64 = lua.unpack(args[0].clone())?;
                        let upper: i64 = lua.unpack(args[1].clone())?;
                        if lower > upper {
                            return Err(interval_is_empty(2));
                        }
                        let span = upper as f64 - lower as f64 + 1.0;
                        Ok(Value::Integer((r * span).floor() as i64 + lower))
                    }
                    _ => Err(mlua::Error::RuntimeError(
                        "wrong number of arguments".to_string(),
                    )),
                }
            })?,
        )?;

        let rng = Arc::clone(&self.rng);
        math.set(
            "randomseed",
            lua.create_function(move |lua, seed: Value<'_>| {
                // Fractional seeds are truncated toward zero
                let seed = match seed {
                    Value::Integer(n) => n,
                    other => lua.unpack::<f64>(other)?.trunc() as i64,
                };
                rng.lock().seed(seed as i32);
                Ok(())
            })?,
        )?;
        Ok(())
    }
}

fn interval_is_empty(arg: usize) -> mlua::Error {
    mlua::Error::RuntimeError(format!("bad argument #{} to 'random' (interval is empty)", arg))
}

fn error_value<'lua>(lua: &'lua Lua, msg: &str) -> mlua::Result<Value<'lua>> {
    Ok(Value::Table(single_field_table(lua, "err", msg)?))
}

/// `redis.error_reply` / `redis.status_reply`.
fn single_field_reply<'lua>(
    lua: &'lua Lua,
    field: &str,
    args: Variadic<Value<'lua>>,
) -> mlua::Result<Value<'lua>> {
    let text = match args.first() {
        Some(v @ (Value::String(_) | Value::Integer(_) | Value::Number(_))) if args.len() == 1 => {
            lua.coerce_string(v.clone())?
        }
        _ => None,
    };
    match text {
        Some(s) => Ok(Value::Table(single_field_table(lua, field, s.as_bytes())?)),
        None => error_value(lua, "wrong number or type of arguments"),
    }
}

/// `redis.log(level, ...)`.
fn script_log<'lua>(lua: &'lua Lua, args: Variadic<Value<'lua>>) -> mlua::Result<Value<'lua>> {
    if args.len() < 2 {
        return error_value(lua, "redis.log() requires two arguments or more.");
    }
    let Some(level) = lua.coerce_integer(args[0].clone())? else {
        return error_value(lua, "First argument must be a number (log level).");
    };
    let Some(level) = log_level(level) else {
        return error_value(lua, "Invalid debug level.");
    };

    let mut message = Vec::new();
    for arg in args[1..].iter() {
        if let Some(s) = lua.coerce_string(arg.clone())? {
            if !message.is_empty() {
                message.push(b' ');
            }
            message.extend_from_slice(s.as_bytes());
        }
    }
    log::log!(target: LOG_TARGET, level, "{}", String::from_utf8_lossy(&message));
    Ok(Value::Nil)
}

/// Maps a script log level onto the `log` facade.
pub fn log_level(level: i64) -> Option<log::Level> {
    match level {
        0 | 1 => Some(log::Level::Error),
        LOG_WARNING => Some(log::Level::Warn),
        LOG_NOTICE => Some(log::Level::Info),
        LOG_DEBUG => Some(log::Level::Debug),
        LOG_VERBOSE => Some(log::Level::Trace),
        _ => None,
    }
}
