//! MessagePack decoding straight into Lua values.
//!
//! `cmsgpack.unpack` has to accept what `cmsgpack.pack` produces: binary
//! strings that are not UTF-8 and maps keyed by integers. Neither fits a
//! JSON-shaped intermediate, so the decoder walks the msgpack stream with a
//! serde visitor and builds `mlua::Value`s directly.

use mlua::{Lua, MultiValue, Value};
use serde::de::{self, DeserializeSeed, Deserializer, MapAccess, SeqAccess, Visitor};
use std::fmt;

/// Decodes every msgpack object in `input`, in order.
pub fn unpack<'lua>(lua: &'lua Lua, mut input: &[u8]) -> mlua::Result<MultiValue<'lua>> {
    let mut values = Vec::new();
    while !input.is_empty() {
        let mut decoder = rmp_serde::Deserializer::new(&mut input);
        let value = LuaValueSeed { lua }
            .deserialize(&mut decoder)
            .map_err(|e| mlua::Error::RuntimeError(format!("bad msgpack data: {}", e)))?;
        values.push(value);
    }
    Ok(MultiValue::from_vec(values))
}

#[derive(Clone, Copy)]
struct LuaValueSeed<'lua> {
    lua: &'lua Lua,
}

impl<'de, 'lua> DeserializeSeed<'de> for LuaValueSeed<'lua> {
    type Value = Value<'lua>;

    fn deserialize<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(self)
    }
}

impl<'lua> LuaValueSeed<'lua> {
    fn string<E: de::Error>(self, bytes: &[u8]) -> Result<Value<'lua>, E> {
        self.lua
            .create_string(bytes)
            .map(Value::String)
            .map_err(E::custom)
    }
}

impl<'de, 'lua> Visitor<'de> for LuaValueSeed<'lua> {
    type Value = Value<'lua>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a msgpack object")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Self::Value, E> {
        Ok(Value::Boolean(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        Ok(Value::Integer(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        Ok(i64::try_from(v)
            .map(Value::Integer)
            .unwrap_or(Value::Number(v as f64)))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
        Ok(Value::Number(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        self.string(v.as_bytes())
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
        self.string(v)
    }

    fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(Value::Nil)
    }

    fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(Value::Nil)
    }

    fn visit_some<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(self)
    }

    fn visit_newtype_struct<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(self)
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let table = self.lua.create_table().map_err(de::Error::custom)?;
        let mut index: i64 = 1;
        while let Some(item) = seq.next_element_seed(self)? {
            table.raw_set(index, item).map_err(de::Error::custom)?;
            index += 1;
        }
        Ok(Value::Table(table))
    }

    fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let table = self.lua.create_table().map_err(de::Error::custom)?;
        while let Some(key) = map.next_key_seed(self)? {
            let value = map.next_value_seed(self)?;
            // nil keys cannot be stored in a table
            if matches!(key, Value::Nil) {
                continue;
            }
            table.raw_set(key, value).map_err(de::Error::custom)?;
        }
        Ok(Value::Table(table))
    }
}
