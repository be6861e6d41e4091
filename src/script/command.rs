//! The command bridge behind `redis.call` and `redis.pcall`.
//!
//! A script issues commands as if it were an ordinary client of the same
//! session, minus the wire codec: arguments are validated, the command is
//! looked up in the host's table and dispatched synchronously, and the
//! reply comes back through the value bridge.

use crate::host::{CommandDispatcher, SessionId};
use crate::script::bridge::{single_field_table, to_script_value};
use crate::{Error, ReplyValue};
use bytes::Bytes;
use mlua::{Lua, Value, Variadic};
use std::sync::Arc;

const NO_ARGUMENTS: &str = "Please specify at least one argument for redis.call()";
const BAD_ARGUMENT_TYPE: &str = "Lua redis() command arguments must be strings or integers";

/// The outcome of a bridged command, before it is handed to Lua.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    /// The arguments were malformed; reported as a value, never raised.
    BadArguments(&'static str),
    /// The command was rejected or returned an error reply.
    Failed(ReplyValue),
    /// The command ran and produced a non-error reply.
    Reply(ReplyValue),
}

/// Dispatches script commands on behalf of one session.
#[derive(Clone)]
pub struct CommandBridge {
    dispatcher: Arc<dyn CommandDispatcher>,
    session: SessionId,
}

impl CommandBridge {
    /// Creates a bridge for `session`.
    pub fn new(dispatcher: Arc<dyn CommandDispatcher>, session: SessionId) -> Self {
        Self {
            dispatcher,
            session,
        }
    }

    /// Returns the session commands are dispatched for.
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Validates, looks up and runs one command.
    ///
    /// `argv[0]` is the command name; it is matched case-insensitively.
    pub fn execute(&self, argv: &[Bytes]) -> CallOutcome {
        let Some((name, args)) = argv.split_first() else {
            return CallOutcome::BadArguments(NO_ARGUMENTS);
        };
        let name = String::from_utf8_lossy(name).to_ascii_lowercase();

        match self.dispatcher.find_handler(&name) {
            None => return CallOutcome::Failed(Error::UnknownCommand.into()),
            Some(info) if !info.script_eligible => {
                return CallOutcome::Failed(Error::CommandNotScriptable.into())
            }
            Some(_) => {}
        }

        let reply = self.dispatcher.dispatch(self.session, &name, args);
        if reply.is_error() {
            CallOutcome::Failed(reply)
        } else {
            CallOutcome::Reply(reply)
        }
    }

    /// Lua entry point: returns the converted reply and whether `call`
    /// should raise it.
    pub(crate) fn call_from_lua<'lua>(
        &self,
        lua: &'lua Lua,
        args: Variadic<Value<'lua>>,
    ) -> mlua::Result<(Value<'lua>, bool)> {
        let argv = match collect_arguments(lua, args)? {
            Some(argv) => argv,
            None => {
                let err = single_field_table(lua, "err", BAD_ARGUMENT_TYPE)?;
                return Ok((Value::Table(err), false));
            }
        };

        match self.execute(&argv) {
            CallOutcome::BadArguments(msg) => {
                Ok((Value::Table(single_field_table(lua, "err", msg)?), false))
            }
            CallOutcome::Failed(reply) => Ok((to_script_value(lua, &reply)?, true)),
            CallOutcome::Reply(reply) => Ok((to_script_value(lua, &reply)?, false)),
        }
    }
}

/// Collects command arguments; `None` if one is neither a string nor a number.
fn collect_arguments<'lua>(
    lua: &'lua Lua,
    args: Variadic<Value<'lua>>,
) -> mlua::Result<Option<Vec<Bytes>>> {
    let mut argv = Vec::with_capacity(args.len());
    for arg in args.iter() {
        let coerced = match arg {
            Value::String(_) | Value::Integer(_) | Value::Number(_) => {
                lua.coerce_string(arg.clone())?
            }
            _ => None,
        };
        match coerced {
            Some(s) => argv.push(Bytes::copy_from_slice(s.as_bytes())),
            None => return Ok(None),
        }
    }
    Ok(Some(argv))
}
