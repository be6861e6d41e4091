// Integration tests for aidb-script
// These tests drive LuaExecutor end to end against an in-memory command table

use aidb_script::script::sha1_hex;
use aidb_script::{
    CommandDispatcher, CommandInfo, Error, LuaExecutor, MemoryScriptStore, ReplyValue, Scheduler,
    ScriptControl, ScriptHost, ScriptOptions, ScriptStore, SessionId,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// A tiny key-value command table: set, get, incr and a script-ineligible
/// subscribe.
#[derive(Default)]
struct KvStore {
    data: Mutex<HashMap<Bytes, Bytes>>,
}

impl CommandDispatcher for KvStore {
    fn find_handler(&self, name: &str) -> Option<CommandInfo> {
        match name {
            "set" | "get" | "incr" => Some(CommandInfo::scriptable()),
            "subscribe" => Some(CommandInfo::no_script()),
            _ => None,
        }
    }

    fn dispatch(&self, _session: SessionId, name: &str, args: &[Bytes]) -> ReplyValue {
        let mut data = self.data.lock();
        match (name, args) {
            ("set", [key, value]) => {
                data.insert(key.clone(), value.clone());
                ReplyValue::ok()
            }
            ("get", [key]) => match data.get(key) {
                Some(value) => ReplyValue::Bulk(value.clone()),
                None => ReplyValue::Nil,
            },
            ("incr", [key]) => {
                let current = match data.get(key) {
                    Some(value) => match std::str::from_utf8(value).ok().and_then(|s| s.parse::<i64>().ok()) {
                        Some(n) => n,
                        None => return ReplyValue::error("ERR value is not an integer or out of range"),
                    },
                    None => 0,
                };
                let next = current + 1;
                data.insert(key.clone(), Bytes::from(next.to_string()));
                ReplyValue::Integer(next)
            }
            _ => ReplyValue::error(format!("ERR wrong number of arguments for '{}' command", name)),
        }
    }
}

struct Fixture {
    kv: Arc<KvStore>,
    store: Arc<MemoryScriptStore>,
    control: Arc<ScriptControl>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            kv: Arc::new(KvStore::default()),
            store: Arc::new(MemoryScriptStore::new()),
            control: Arc::new(ScriptControl::new()),
        }
    }

    fn host(&self) -> ScriptHost {
        ScriptHost::new(self.kv.clone(), self.store.clone(), self.control.clone())
    }

    fn session(&self) -> LuaExecutor {
        self.session_with(ScriptOptions::default())
    }

    fn session_with(&self, options: ScriptOptions) -> LuaExecutor {
        LuaExecutor::new(self.host(), options).unwrap()
    }
}

fn b(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

/// Test the array, status and error reply shapes
#[test]
fn test_reply_examples() {
    let fx = Fixture::new();
    let mut exec = fx.session();

    assert_eq!(
        exec.evaluate(b"return {1,2,3}", &[], &[], false),
        ReplyValue::Array(vec![
            ReplyValue::Integer(1),
            ReplyValue::Integer(2),
            ReplyValue::Integer(3),
        ])
    );
    assert_eq!(
        exec.evaluate(
            b"return redis.call('set', KEYS[1], ARGV[1])",
            &[b("k")],
            &[b("v")],
            false
        ),
        ReplyValue::status("OK")
    );
    assert_eq!(
        exec.evaluate(b"return redis.error_reply('bad')", &[], &[], false),
        ReplyValue::error("bad")
    );
    assert_eq!(fx.kv.data.lock().get(&b("k")), Some(&b("v")));
}

/// Test that a hash is unknown until its source has been evaluated
#[test]
fn test_hash_binding() {
    let fx = Fixture::new();
    let mut exec = fx.session();
    let source = b"return redis.call('incr', KEYS[1])";
    let hash = sha1_hex(source);

    assert_eq!(
        exec.evaluate(hash.as_bytes(), &[b("n")], &[], true),
        ReplyValue::error("NOSCRIPT No matching script. Please use EVAL.")
    );

    assert_eq!(exec.evaluate(source, &[b("n")], &[], false), ReplyValue::Integer(1));
    assert_eq!(exec.evaluate(hash.as_bytes(), &[b("n")], &[], true), ReplyValue::Integer(2));
    assert!(fx.store.get(&format!("f_{}", hash)).unwrap().is_some());
}

/// Test that scripts loaded on one session run by hash on another
#[test]
fn test_hash_shared_across_sessions() {
    let fx = Fixture::new();
    let mut a = fx.session();
    let mut b_session = fx.session();

    let hash = a.load(b"return 'shared'").unwrap();
    assert!(b_session.exists(&hash).unwrap());
    assert_eq!(
        b_session.eval_sha(&hash, &[], &[]).unwrap(),
        ReplyValue::bulk("shared")
    );
}

/// Test that runtime globals cannot be created or read when missing
#[test]
fn test_global_protection() {
    let fx = Fixture::new();
    let mut exec = fx.session();

    let err = exec.eval(b"leaked = 1 return 1", &[], &[]).unwrap_err();
    assert!(err
        .to_string()
        .contains("Script attempted to create global variable 'leaked'"));

    let err = exec.eval(b"return not_defined", &[], &[]).unwrap_err();
    assert!(err
        .to_string()
        .contains("Script attempted to access nonexistent global variable 'not_defined'"));

    // Locals are fine.
    assert_eq!(
        exec.eval(b"local x = 5 return x", &[], &[]).unwrap(),
        ReplyValue::Integer(5)
    );
}

/// Test call vs pcall on unknown and script-ineligible commands
#[test]
fn test_command_eligibility() {
    let fx = Fixture::new();
    let mut exec = fx.session();

    let err = exec.eval(b"return redis.call('subscribe', 'ch')", &[], &[]).unwrap_err();
    assert!(matches!(err, Error::Runtime { .. }));
    assert!(err
        .to_string()
        .contains("This Redis command is not allowed from scripts"));

    assert_eq!(
        exec.eval(b"return redis.pcall('subscribe', 'ch')", &[], &[]).unwrap(),
        ReplyValue::error("This Redis command is not allowed from scripts")
    );
    assert_eq!(
        exec.eval(b"return redis.pcall('nosuchcmd')", &[], &[]).unwrap(),
        ReplyValue::error("Unknown Redis command called from Lua script")
    );
}

/// Test that error replies from the store abort call but not pcall
#[test]
fn test_store_errors() {
    let fx = Fixture::new();
    let mut exec = fx.session();
    fx.kv.data.lock().insert(b("s"), b("text"));

    let err = exec.eval(b"redis.call('incr', 's') return 'unreachable'", &[], &[]).unwrap_err();
    assert!(err.to_string().contains("value is not an integer"));

    assert_eq!(
        exec.eval(
            b"local r = redis.pcall('incr', 's') return {type(r), r.err}",
            &[],
            &[]
        )
        .unwrap(),
        ReplyValue::Array(vec![
            ReplyValue::bulk("table"),
            ReplyValue::bulk("ERR value is not an integer or out of range"),
        ])
    );
}

/// Test argument validation of redis.call
#[test]
fn test_call_argument_errors() {
    let fx = Fixture::new();
    let mut exec = fx.session();

    assert_eq!(
        exec.eval(b"return redis.call()", &[], &[]).unwrap(),
        ReplyValue::error("Please specify at least one argument for redis.call()")
    );
    assert_eq!(
        exec.eval(b"return redis.call('set', 'k', {})", &[], &[]).unwrap(),
        ReplyValue::error("Lua redis() command arguments must be strings or integers")
    );
    assert_eq!(
        exec.eval(b"redis.call('set', 'n', 42) return redis.call('get', 'n')", &[], &[])
            .unwrap(),
        ReplyValue::bulk("42")
    );
}

/// Test that math.random is identical across invocations and sessions
#[test]
fn test_random_is_deterministic() {
    let fx = Fixture::new();
    let mut a = fx.session();
    let mut b_session = fx.session();
    let source = b"return {math.random(1000000), math.random(1000000), math.random(1, 10)}";

    let first = a.eval(source, &[], &[]).unwrap();
    let second = a.eval(source, &[], &[]).unwrap();
    let other = b_session.eval(source, &[], &[]).unwrap();
    assert_eq!(first, second);
    assert_eq!(first, other);

    // A script that reseeds does not affect the next invocation.
    a.eval(b"math.randomseed(99) return math.random(5)", &[], &[]).unwrap();
    assert_eq!(a.eval(source, &[], &[]).unwrap(), first);
}

/// Test the bundled serialization libraries
#[test]
fn test_libraries() {
    let fx = Fixture::new();
    let mut exec = fx.session();

    assert_eq!(
        exec.eval(b"return cjson.decode(ARGV[1]).name", &[], &[b("{\"name\":\"aidb\"}")])
            .unwrap(),
        ReplyValue::bulk("aidb")
    );
    assert_eq!(
        exec.eval(b"return cjson.encode({10, 20})", &[], &[]).unwrap(),
        ReplyValue::bulk("[10,20]")
    );
    assert_eq!(
        exec.eval(b"return cmsgpack.unpack(cmsgpack.pack({1, 'two'}))", &[], &[])
            .unwrap(),
        ReplyValue::Array(vec![ReplyValue::Integer(1), ReplyValue::bulk("two")])
    );
    assert_eq!(
        exec.eval(b"return struct.unpack('<i4', struct.pack('<i4', -7))", &[], &[])
            .unwrap(),
        ReplyValue::Integer(-7)
    );
    assert_eq!(
        exec.eval(b"return redis.sha1hex('abc')", &[], &[]).unwrap(),
        ReplyValue::bulk("a9993e364706816aba3e25717850c26c9cd0d89d")
    );
    assert_eq!(
        exec.eval(b"redis.log(redis.LOG_NOTICE, 'hello', 'log') return 1", &[], &[])
            .unwrap(),
        ReplyValue::Integer(1)
    );
    assert_eq!(
        exec.eval(b"return server.status_reply('FINE')", &[], &[]).unwrap(),
        ReplyValue::status("FINE")
    );
}

/// Test that the sandbox has no file or OS access
#[test]
fn test_sandbox_restrictions() {
    let fx = Fixture::new();
    let mut exec = fx.session();

    for source in [
        &b"return loadfile('x')"[..],
        &b"return dofile('x')"[..],
        &b"return os.time()"[..],
        &b"return io.open('x')"[..],
    ] {
        let reply = exec.evaluate(source, &[], &[], false);
        assert!(reply.is_error(), "{:?} should fail", String::from_utf8_lossy(source));
    }
}

/// Test that a flush on one session invalidates hashes on every session
#[test]
fn test_flush_across_sessions() {
    let fx = Fixture::new();
    let mut a = fx.session();
    let mut b_session = fx.session();

    let source = b"return 'cached'";
    let hash = sha1_hex(source);
    b_session.eval(source, &[], &[]).unwrap();
    assert_eq!(b_session.eval_sha(&hash, &[], &[]).unwrap(), ReplyValue::bulk("cached"));

    a.request_flush().unwrap();
    assert!(fx.store.is_empty());

    assert!(matches!(b_session.eval_sha(&hash, &[], &[]), Err(Error::NoScript)));
    assert!(!a.exists(&hash).unwrap());
}

/// Scheduler that flushes the script store on behalf of another client the
/// first time a slow script yields.
struct FlushOnFirstYield {
    store: Arc<MemoryScriptStore>,
    control: Arc<ScriptControl>,
    flushed: AtomicBool,
}

impl Scheduler for FlushOnFirstYield {
    fn yield_now(&self) {
        if !self.flushed.swap(true, Ordering::SeqCst) {
            self.store.flush_all().unwrap();
            // Session ids start at 1, so 0 stands for a client without a session.
            self.control.request_flush(0);
        }
    }
}

/// Test that a flush delivered while a slow script runs resets the session
/// once the script returns
#[test]
fn test_flush_during_slow_script() {
    let fx = Fixture::new();
    let scheduler = Arc::new(FlushOnFirstYield {
        store: fx.store.clone(),
        control: fx.control.clone(),
        flushed: AtomicBool::new(false),
    });
    let opts = ScriptOptions::default()
        .time_limit(Some(Duration::from_millis(1)))
        .hook_instruction_interval(1000);
    let mut exec = LuaExecutor::new(fx.host().with_scheduler(scheduler.clone()), opts).unwrap();

    let hash = exec.load(b"return 'cached'").unwrap();
    let reply = exec
        .eval(b"local n = 0 for i = 1, 5000000 do n = n + 1 end return n", &[], &[])
        .unwrap();
    assert_eq!(reply, ReplyValue::Integer(5_000_000));
    assert!(scheduler.flushed.load(Ordering::SeqCst));

    assert!(matches!(exec.eval_sha(&hash, &[], &[]), Err(Error::NoScript)));
    assert!(!exec.exists(&hash).unwrap());
}

fn spawn_killer(control: Arc<ScriptControl>, target: String, done: Arc<AtomicBool>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while !done.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(20));
            control.request_kill(&target);
        }
    })
}

fn slow_options() -> ScriptOptions {
    ScriptOptions::default()
        .time_limit(Some(Duration::from_millis(10)))
        .hook_instruction_interval(1000)
}

/// Test that kill "all" stops a runaway script
#[test]
fn test_kill_all() {
    let fx = Fixture::new();
    let mut exec = fx.session_with(slow_options());
    let done = Arc::new(AtomicBool::new(false));
    let killer = spawn_killer(fx.control.clone(), "all".to_string(), done.clone());

    let result = exec.eval(b"while true do end", &[], &[]);
    done.store(true, Ordering::SeqCst);
    killer.join().unwrap();

    let err = result.unwrap_err();
    assert!(matches!(err, Error::Killed(_)));
    assert!(err.to_string().contains("Script killed by user with SCRIPT KILL..."));

    // The session keeps working after the reset.
    assert_eq!(exec.eval(b"return 1", &[], &[]).unwrap(), ReplyValue::Integer(1));
}

/// Test that a kill naming the running function stops it
#[test]
fn test_kill_by_name() {
    let fx = Fixture::new();
    let mut exec = fx.session_with(slow_options());
    let source = b"local n = 0 while true do n = n + 1 end";
    let target = sha1_hex(source).to_uppercase();

    let done = Arc::new(AtomicBool::new(false));
    let killer = spawn_killer(fx.control.clone(), target, done.clone());

    let result = exec.eval(source, &[], &[]);
    done.store(true, Ordering::SeqCst);
    killer.join().unwrap();

    assert!(matches!(result, Err(Error::Killed(_))));
}

/// Test that a kill naming another function leaves the script running
#[test]
fn test_kill_other_name_is_ignored() {
    let fx = Fixture::new();
    let mut exec = fx.session_with(slow_options());
    let target = sha1_hex(b"return 'something else'");

    let done = Arc::new(AtomicBool::new(false));
    let killer = spawn_killer(fx.control.clone(), target, done.clone());

    let result = exec.eval(
        b"local n = 0 for i = 1, 5000000 do n = n + 1 end return n",
        &[],
        &[],
    );
    done.store(true, Ordering::SeqCst);
    killer.join().unwrap();

    assert_eq!(result.unwrap(), ReplyValue::Integer(5_000_000));
}

/// Test that scripts under the limit are untouched by the hook
#[test]
fn test_no_time_limit() {
    let fx = Fixture::new();
    let mut exec = fx.session_with(ScriptOptions::default().time_limit(None));
    assert_eq!(
        exec.eval(b"local n = 0 for i = 1, 100000 do n = n + i end return n", &[], &[])
            .unwrap(),
        ReplyValue::Integer(5_000_050_000)
    );
}

/// Test that cmsgpack round-trips binary strings and integer-keyed tables
#[test]
fn test_cmsgpack_binary_and_sparse_keys() {
    let fx = Fixture::new();
    let mut exec = fx.session();

    let binary = Bytes::from_static(&[0xff, 0xfe, 0x00, 0x80]);
    let reply = exec
        .eval(b"return cmsgpack.unpack(cmsgpack.pack(ARGV[1]))", &[], &[binary.clone()])
        .unwrap();
    assert_eq!(reply, ReplyValue::Bulk(binary));

    let reply = exec
        .eval(
            b"local t = cmsgpack.unpack(cmsgpack.pack({[10] = 1, [20] = 'x'})) return {t[10], t[20]}",
            &[],
            &[],
        )
        .unwrap();
    assert_eq!(reply, ReplyValue::Array(vec![ReplyValue::Integer(1), ReplyValue::bulk("x")]));
}

/// Test that errors raised by library functions reach the client on one line
#[test]
fn test_library_errors_are_single_line() {
    let fx = Fixture::new();
    let mut exec = fx.session();

    for source in [
        "return cmsgpack.unpack('\\193')",
        "return cjson.decode('{')",
        "return math.random(1, 2, 3)",
        "return math.random(0)",
    ] {
        match exec.evaluate(source.as_bytes(), &[], &[], false) {
            ReplyValue::Error(text) => {
                let text = String::from_utf8_lossy(&text);
                assert!(!text.contains('\n'), "{}: {}", source, text);
                assert!(!text.contains("stack traceback"), "{}: {}", source, text);
                assert!(text.contains("user_script:1:"), "{}: {}", source, text);
            }
            other => panic!("{} returned {:?}", source, other),
        }
    }
}
