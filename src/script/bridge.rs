//! Conversion between command replies and Lua values.
//!
//! | Reply          | Lua                         |
//! |----------------|-----------------------------|
//! | `Integer(n)`   | integer `n`                 |
//! | `Nil`          | `false`                     |
//! | `Bulk(s)`      | string `s`                  |
//! | `Status(s)`    | `{ok = s}`                  |
//! | `Error(s)`     | `{err = s}`                 |
//! | `Array(xs)`    | `{x1, x2, ...}` (1-indexed) |
//!
//! The reverse direction also maps `true` to `Integer(1)`, floats to
//! integers truncated toward zero, and anything without a reply shape
//! (functions, userdata, nil) to `Nil`.

use crate::ReplyValue;
use bytes::Bytes;
use mlua::{Lua, Table, Value};

/// Error element emitted in place of a table nested beyond the depth limit.
pub const DEPTH_LIMIT_ERROR: &str = "ERR reached lua stack limit";

/// Converts a command reply into a Lua value.
pub fn to_script_value<'lua>(lua: &'lua Lua, reply: &ReplyValue) -> mlua::Result<Value<'lua>> {
    let value = match reply {
        ReplyValue::Integer(n) => Value::Integer(*n),
        ReplyValue::Nil => Value::Boolean(false),
        ReplyValue::Bulk(data) => Value::String(lua.create_string(data)?),
        ReplyValue::Status(msg) => Value::Table(single_field_table(lua, "ok", msg)?),
        ReplyValue::Error(msg) => Value::Table(single_field_table(lua, "err", msg)?),
        ReplyValue::Array(items) => {
            let table = lua.create_table()?;
            for (i, item) in items.iter().enumerate() {
                table.raw_set(i + 1, to_script_value(lua, item)?)?;
            }
            Value::Table(table)
        }
    };
    Ok(value)
}

/// Converts a Lua value into a command reply.
///
/// Tables are read through `index` metamethods, hence the `Result`. A table
/// is walked from index 1 up to the first nil, so anything past a hole in
/// a sparse table is dropped.
pub fn to_reply_value(value: &Value<'_>, max_depth: usize) -> mlua::Result<ReplyValue> {
    let reply = match value {
        Value::String(s) => ReplyValue::Bulk(Bytes::copy_from_slice(s.as_bytes())),
        Value::Boolean(true) => ReplyValue::Integer(1),
        Value::Boolean(false) => ReplyValue::Nil,
        Value::Integer(n) => ReplyValue::Integer(*n),
        // `as` truncates toward zero and saturates, NaN becomes 0.
        Value::Number(n) => ReplyValue::Integer(*n as i64),
        Value::Table(table) => table_to_reply(table, max_depth)?,
        _ => ReplyValue::Nil,
    };
    Ok(reply)
}

fn table_to_reply(table: &Table<'_>, depth_left: usize) -> mlua::Result<ReplyValue> {
    if depth_left == 0 {
        return Ok(ReplyValue::error(DEPTH_LIMIT_ERROR));
    }

    if let Value::String(err) = table.get::<_, Value<'_>>("err")? {
        return Ok(ReplyValue::Error(collapse_newlines(err.as_bytes())));
    }
    if let Value::String(ok) = table.get::<_, Value<'_>>("ok")? {
        return Ok(ReplyValue::Status(collapse_newlines(ok.as_bytes())));
    }

    let mut items = Vec::new();
    let mut index: i64 = 1;
    loop {
        let item: Value<'_> = table.get(index)?;
        if let Value::Nil = item {
            break;
        }
        items.push(to_reply_value(&item, depth_left - 1)?);
        index += 1;
    }
    Ok(ReplyValue::Array(items))
}

/// Builds `{field = value}`, the shape of status and error replies.
pub(crate) fn single_field_table<'lua>(
    lua: &'lua Lua,
    field: &str,
    value: impl AsRef<[u8]>,
) -> mlua::Result<Table<'lua>> {
    let table = lua.create_table()?;
    table.raw_set(field, lua.create_string(value)?)?;
    Ok(table)
}

/// Status and error replies are single-line; CRLF, CR and LF become a space.
fn collapse_newlines(msg: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(msg.len());
    let mut i = 0;
    while i < msg.len() {
        match msg[i] {
            b'\r' if msg.get(i + 1) == Some(&b'\n') => {
                out.push(b' ');
                i += 2;
                continue;
            }
            b'\r' | b'\n' => out.push(b' '),
            b => out.push(b),
        }
        i += 1;
    }
    Bytes::from(out)
}
