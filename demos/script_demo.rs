//! Example: Lua Scripts Against an In-Memory Command Table
//!
//! This example demonstrates EVAL / EVALSHA style invocation, the bundled
//! libraries and the error replies a client would see.

use aidb_script::{
    CommandDispatcher, CommandInfo, LuaExecutor, MemoryScriptStore, ReplyValue, ScriptControl,
    ScriptHost, ScriptOptions, SessionId,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
struct Accounts {
    balances: Mutex<HashMap<Bytes, i64>>,
}

impl CommandDispatcher for Accounts {
    fn find_handler(&self, name: &str) -> Option<CommandInfo> {
        match name {
            "get" | "incrby" => Some(CommandInfo::scriptable()),
            _ => None,
        }
    }

    fn dispatch(&self, _session: SessionId, name: &str, args: &[Bytes]) -> ReplyValue {
        let mut balances = self.balances.lock();
        match (name, args) {
            ("get", [key]) => match balances.get(key) {
                Some(n) => ReplyValue::bulk(n.to_string()),
                None => ReplyValue::Nil,
            },
            ("incrby", [key, by]) => {
                let Some(by) = std::str::from_utf8(by).ok().and_then(|s| s.parse::<i64>().ok())
                else {
                    return ReplyValue::error("ERR value is not an integer or out of range");
                };
                let balance = balances.entry(key.clone()).or_insert(0);
                *balance += by;
                ReplyValue::Integer(*balance)
            }
            _ => ReplyValue::error(format!("ERR wrong number of arguments for '{}' command", name)),
        }
    }
}

const TRANSFER: &str = r#"
    local from = tonumber(redis.call('get', KEYS[1])) or 0
    local amount = tonumber(ARGV[1])
    if from < amount then
        return redis.error_reply('ERR insufficient balance')
    end
    redis.call('incrby', KEYS[1], -amount)
    redis.call('incrby', KEYS[2], amount)
    redis.log(redis.LOG_NOTICE, 'moved', amount, 'from', KEYS[1], 'to', KEYS[2])
    return {redis.call('get', KEYS[1]), redis.call('get', KEYS[2])}
"#;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let accounts = Arc::new(Accounts::default());
    accounts.balances.lock().insert(Bytes::from_static(b"alice"), 1000);

    let host = ScriptHost::new(
        accounts,
        Arc::new(MemoryScriptStore::new()),
        Arc::new(ScriptControl::new()),
    );
    let mut executor = LuaExecutor::new(host, ScriptOptions::default())?;

    println!("=== Lua Scripting Example ===\n");

    let keys = [Bytes::from_static(b"alice"), Bytes::from_static(b"bob")];
    let hash = executor.load(TRANSFER.as_bytes())?;
    println!("Loaded transfer script as {}", hash);

    for amount in ["200", "5000"] {
        let reply = executor.eval_sha(&hash, &keys, &[Bytes::from(amount)])?;
        println!("transfer {:>5}: {:?}", amount, reply);
    }

    println!("\nLibraries");
    println!("---------");
    let reply = executor.evaluate(
        b"return cjson.encode(cjson.decode(ARGV[1]))",
        &[],
        &[Bytes::from_static(br#"{"items":[1,2,3]}"#)],
        false,
    );
    println!("cjson round trip: {:?}", reply);

    let reply = executor.evaluate(b"return redis.sha1hex('abc')", &[], &[], false);
    println!("sha1hex: {:?}", reply);

    println!("\nErrors");
    println!("------");
    for source in ["return nosuch", "undeclared = 1", "return redis.call('flushall')"] {
        let reply = executor.evaluate(source.as_bytes(), &[], &[], false);
        println!("{:<32} => {:?}", source, reply);
    }

    Ok(())
}
