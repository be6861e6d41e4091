//! Digest-keyed cache of compiled script functions.
//!
//! A script body is compiled once per sandbox into a global function named
//! `f_<sha1 hex>` and its body persisted in the [`ScriptStore`], so a later
//! hash-only invocation (possibly on another session, or after a reset)
//! can recompile it without the client resending the source.

use crate::host::ScriptStore;
use crate::script::sandbox::USER_SCRIPT_CHUNK;
use crate::{Error, Result};
use mlua::{Function, Lua, Value};
use sha1::{Digest, Sha1};
use std::sync::Arc;

/// Prefix of every compiled script function.
pub const FUNCTION_PREFIX: &str = "f_";

/// Length of a hex encoded SHA-1 digest.
pub const DIGEST_HEX_LEN: usize = 40;

/// Lowercase hex SHA-1 of `data`.
pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

/// Global function name for a (lowercase) digest.
pub fn function_name(digest: &str) -> String {
    format!("{}{}", FUNCTION_PREFIX, digest)
}

/// Resolves function names to compiled functions of one sandbox.
#[derive(Clone)]
pub struct FunctionCache {
    store: Arc<dyn ScriptStore>,
}

impl FunctionCache {
    /// Creates a cache persisting bodies in `store`.
    pub fn new(store: Arc<dyn ScriptStore>) -> Self {
        Self { store }
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn ScriptStore> {
        &self.store
    }

    /// Returns the function registered under `name`, compiling it first if
    /// needed. Without a `body` the source comes from the store.
    ///
    /// # Errors
    ///
    /// `Error::NoScript` when neither the sandbox nor the store knows the
    /// name and no body was given; otherwise see [`Self::create_or_replace`].
    pub fn resolve<'lua>(
        &self,
        lua: &'lua Lua,
        name: &str,
        body: Option<&[u8]>,
    ) -> Result<Function<'lua>> {
        if let Some(function) = self.lookup(lua, name)? {
            return Ok(function);
        }

        match body {
            Some(body) => self.create_or_replace(lua, name, body),
            None => match self.store.get(name)? {
                Some(body) => {
                    log::debug!("Recompiling {} from the script store", name);
                    self.create_or_replace(lua, name, &body)
                }
                None => Err(Error::NoScript),
            },
        }
    }

    /// Returns the function registered under `name` in this sandbox.
    pub fn lookup<'lua>(&self, lua: &'lua Lua, name: &str) -> Result<Option<Function<'lua>>> {
        match lua.globals().raw_get::<_, Value<'_>>(name)? {
            Value::Function(function) => Ok(Some(function)),
            _ => Ok(None),
        }
    }

    /// Compiles `body` as the global function `name`, replacing any previous
    /// definition, and persists the body.
    pub fn create_or_replace<'lua>(
        &self,
        lua: &'lua Lua,
        name: &str,
        body: &[u8],
    ) -> Result<Function<'lua>> {
        let mut source = Vec::with_capacity(body.len() + name.len() + 16);
        source.extend_from_slice(b"function ");
        source.extend_from_slice(name.as_bytes());
        source.extend_from_slice(b"() ");
        source.extend_from_slice(body);
        source.extend_from_slice(b"\nend");

        let definition = lua
            .load(source)
            .set_name(USER_SCRIPT_CHUNK)
            .into_function()
            .map_err(|e| match e {
                mlua::Error::SyntaxError { message, .. } => Error::Compile(message),
                other => Error::Compile(other.to_string()),
            })?;
        definition
            .call::<_, ()>(())
            .map_err(|e| Error::runtime(name, e.to_string()))?;

        self.store.save(name, body)?;

        self.lookup(lua, name)?
            .ok_or_else(|| Error::runtime(name, "function was not registered"))
    }
}
