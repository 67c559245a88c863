//! # Data Engine
//!
//! Purpose: The command dispatcher sitting on top of the Sharded Map, Lock
//! Map, and TTL map: `exec` takes one already-parsed RESP request and
//! returns one RESP reply, touching whatever locks and storage the command
//! needs and nothing more.
//!
//! ## Design Principles
//! 1. **One Exec Boundary**: every command runs inside a single `catch_unwind`
//!    so a bug in one command handler degrades to an error reply instead of
//!    taking the whole connection (or process) down.
//! 2. **Lock Before Touch**: every handler acquires its key's lock slot(s)
//!    from the `LockMap` before reading or writing the `ShardedMap`, and
//!    multi-key commands always go through `write_many`/`read_many` so the
//!    slot order is consistent across concurrent callers.
//! 3. **Entities Are `Arc<Mutex<_>>`**: the keyspace stores
//!    `Arc<Mutex<Entity>>` rather than `Entity` directly, so a `ShardedMap`
//!    lookup only clones a reference-counted pointer, never the (possibly
//!    large) list/set/hash/zset payload. The `LockMap` slot still owns the
//!    *logical* read-modify-write atomicity; the inner `Mutex` exists only
//!    so the engine can mutate through a shared reference.
//! 4. **Canonical AOF Form**: a command that can replay non-deterministically
//!    (`EXPIRE`, `SETEX`, ...) is rewritten to its canonical absolute form
//!    (`PEXPIREAT`, ...) before being handed to the AOF sink, so replay never
//!    depends on wall-clock time at the moment of replay.

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use ahash::AHashMap;
use rand::seq::SliceRandom;
use rand::Rng;
use rkv_common::{ArityKind, RkvError, RkvResult, RespValue};

use crate::lock_map::LockMap;
use crate::sharded_map::ShardedMap;
use crate::value::Entity;

/// Implemented by the AOF writer; kept as a trait here so the engine does
/// not depend on `aof.rs`'s concrete channel/thread plumbing.
pub trait AofSink: Send + Sync {
    fn append(&self, args: &[Vec<u8>]);
}

type Keyspace = ShardedMap<Arc<Mutex<Entity>>>;

/// The command dispatcher and its storage.
pub struct DataEngine {
    keyspace: Keyspace,
    ttl: Mutex<AHashMap<Vec<u8>, Instant>>,
    locks: LockMap,
    /// Held read during normal commands, write during FLUSHALL/FLUSHDB, so a
    /// flush can never observe (or be observed mid-way through) a concurrent
    /// keyspace mutation.
    global: RwLock<()>,
    aof: Option<Arc<dyn AofSink>>,
    subscriptions: Mutex<AHashMap<Vec<u8>, HashSet<u64>>>,
    start_time: Instant,
}

impl DataEngine {
    pub fn new() -> Self {
        DataEngine {
            keyspace: ShardedMap::new(),
            ttl: Mutex::new(AHashMap::new()),
            locks: LockMap::new(),
            global: RwLock::new(()),
            aof: None,
            subscriptions: Mutex::new(AHashMap::new()),
            start_time: Instant::now(),
        }
    }

    pub fn with_aof_sink(sink: Arc<dyn AofSink>) -> Self {
        let mut engine = Self::new();
        engine.aof = Some(sink);
        engine
    }

    /// Attaches an AOF sink after construction, for the startup sequence
    /// that replays an existing log (with no sink attached, so replayed
    /// commands are not re-appended to the file they came from) before
    /// wiring up the writer for everything that follows.
    pub fn attach_aof_sink(&mut self, sink: Arc<dyn AofSink>) {
        self.aof = Some(sink);
    }

    pub fn dbsize(&self) -> usize {
        self.keyspace.len()
    }

    /// Runs one already-tokenized command and returns its reply. `conn_id`
    /// identifies the calling connection for `SUBSCRIBE`/`UNSUBSCRIBE`
    /// bookkeeping; unrelated commands ignore it.
    pub fn exec(&self, conn_id: u64, args: &[Vec<u8>]) -> RespValue {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.dispatch(conn_id, args)));
        match outcome {
            Ok(Ok(value)) => value,
            Ok(Err(err)) => RespValue::from_error(&err),
            Err(_) => {
                tracing::error!("command execution panicked");
                RespValue::from_error(&RkvError::Unknown)
            }
        }
    }

    fn dispatch(&self, conn_id: u64, args: &[Vec<u8>]) -> RkvResult<RespValue> {
        let Some(name) = args.first() else {
            return Err(RkvError::Protocol("empty command".into()));
        };
        let name = String::from_utf8_lossy(name).to_ascii_uppercase();
        let argv = &args[1..];

        if matches!(name.as_str(), "FLUSHALL" | "FLUSHDB") {
            let _gate = self.global.write()?;
            return self.cmd_flush(argv);
        }
        let _gate = self.global.read()?;

        match name.as_str() {
            "PING" => self.cmd_ping(argv),
            "ECHO" => self.cmd_echo(argv),
            "EXISTS" => self.cmd_exists(argv),
            "TYPE" => self.cmd_type(argv),
            "DEL" => self.cmd_del(argv),
            "EXPIRE" => self.cmd_expire(argv, Unit::Seconds, Anchor::Relative),
            "PEXPIRE" => self.cmd_expire(argv, Unit::Millis, Anchor::Relative),
            "EXPIREAT" => self.cmd_expire(argv, Unit::Seconds, Anchor::Absolute),
            "PEXPIREAT" => self.cmd_expire(argv, Unit::Millis, Anchor::Absolute),
            "TTL" => self.cmd_ttl(argv, Unit::Seconds),
            "PTTL" => self.cmd_ttl(argv, Unit::Millis),
            "PERSIST" => self.cmd_persist(argv),
            "RENAME" => self.cmd_rename(argv, false),
            "RENAMENX" => self.cmd_rename(argv, true),
            "KEYS" => self.cmd_keys(argv),
            "DBSIZE" => self.cmd_dbsize(argv),
            "INFO" => self.cmd_info(argv),

            "SET" => self.cmd_set(argv),
            "GET" => self.cmd_get(argv),
            "GETSET" => self.cmd_getset(argv),
            "SETNX" => self.cmd_setnx(argv),
            "MSET" => self.cmd_mset(argv),
            "MSETNX" => self.cmd_msetnx(argv),
            "MGET" => self.cmd_mget(argv),
            "APPEND" => self.cmd_append(argv),
            "STRLEN" => self.cmd_strlen(argv),
            "INCR" => self.cmd_incrby(argv, 1),
            "DECR" => self.cmd_incrby(argv, -1),
            "INCRBY" => self.cmd_incrby_arg(argv, 1),
            "DECRBY" => self.cmd_incrby_arg(argv, -1),
            "INCRBYFLOAT" => self.cmd_incrbyfloat(argv),

            "LPUSH" => self.cmd_push(argv, Side::Left, false),
            "RPUSH" => self.cmd_push(argv, Side::Right, false),
            "LPUSHX" => self.cmd_push(argv, Side::Left, true),
            "RPUSHX" => self.cmd_push(argv, Side::Right, true),
            "LPOP" => self.cmd_pop(argv, Side::Left),
            "RPOP" => self.cmd_pop(argv, Side::Right),
            "LLEN" => self.cmd_llen(argv),
            "LRANGE" => self.cmd_lrange(argv),
            "LINDEX" => self.cmd_lindex(argv),
            "LSET" => self.cmd_lset(argv),
            "LINSERT" => self.cmd_linsert(argv),
            "LREM" => self.cmd_lrem(argv),
            "RPOPLPUSH" => self.cmd_rpoplpush(argv),
            "RPUSHALL" => self.cmd_rpushall(argv),

            "SADD" => self.cmd_sadd(argv),
            "SREM" => self.cmd_srem(argv),
            "SISMEMBER" => self.cmd_sismember(argv),
            "SCARD" => self.cmd_scard(argv),
            "SMEMBERS" => self.cmd_smembers(argv),
            "SINTER" => self.cmd_set_algebra(argv, SetOp::Inter, None),
            "SINTERSTORE" => self.cmd_set_algebra_store(argv, SetOp::Inter),
            "SUNION" => self.cmd_set_algebra(argv, SetOp::Union, None),
            "SUNIONSTORE" => self.cmd_set_algebra_store(argv, SetOp::Union),
            "SDIFF" => self.cmd_set_algebra(argv, SetOp::Diff, None),
            "SDIFFSTORE" => self.cmd_set_algebra_store(argv, SetOp::Diff),
            "SRANDMEMBER" => self.cmd_srandmember(argv),
            "SMOVE" => self.cmd_smove(argv),

            "HSET" => self.cmd_hset(argv, false),
            "HSETNX" => self.cmd_hset(argv, true),
            "HGET" => self.cmd_hget(argv),
            "HDEL" => self.cmd_hdel(argv),
            "HEXISTS" => self.cmd_hexists(argv),
            "HLEN" => self.cmd_hlen(argv),
            "HMSET" => self.cmd_hmset(argv),
            "HGETALL" => self.cmd_hgetall(argv),
            "HKEYS" => self.cmd_hkeys_or_vals(argv, true),
            "HVALS" => self.cmd_hkeys_or_vals(argv, false),
            "HINCRBY" => self.cmd_hincrby(argv),

            "ZADD" => self.cmd_zadd(argv),
            "ZSCORE" => self.cmd_zscore(argv),
            "ZREM" => self.cmd_zrem(argv),
            "ZCARD" => self.cmd_zcard(argv),
            "ZRANK" => self.cmd_zrank(argv, false),
            "ZREVRANK" => self.cmd_zrank(argv, true),
            "ZRANGE" => self.cmd_zrange(argv, false),
            "ZREVRANGE" => self.cmd_zrange(argv, true),
            "ZRANGEBYSCORE" => self.cmd_zrangebyscore(argv),
            "ZCOUNT" => self.cmd_zcount(argv),
            "ZINCRBY" => self.cmd_zincrby(argv),
            "ZREMRANGEBYRANK" => self.cmd_zremrangebyrank(argv),
            "ZREMRANGEBYSCORE" => self.cmd_zremrangebyscore(argv),

            "SUBSCRIBE" => self.cmd_subscribe(conn_id, argv),
            "UNSUBSCRIBE" => self.cmd_unsubscribe(conn_id, argv),
            "PUBLISH" => self.cmd_publish(argv),

            other => Err(RkvError::UnknownCommand(other.to_ascii_lowercase())),
        }
    }

    fn record(&self, args: Vec<Vec<u8>>) {
        if let Some(sink) = &self.aof {
            sink.append(&args);
        }
    }

    // --- key/entity access -------------------------------------------------

    fn entity(&self, key: &[u8]) -> Option<Arc<Mutex<Entity>>> {
        self.touch_expired(key);
        self.keyspace.get(key)
    }

    fn touch_expired(&self, key: &[u8]) {
        let expired = {
            let ttl = self.ttl.lock().expect("ttl map poisoned");
            matches!(ttl.get(key), Some(at) if *at <= Instant::now())
        };
        if expired {
            self.keyspace.remove(key);
            self.ttl.lock().expect("ttl map poisoned").remove(key);
        }
    }

    fn store_new(&self, key: Vec<u8>, entity: Entity) {
        self.ttl.lock().expect("ttl map poisoned").remove(&key);
        self.keyspace.put(key, Arc::new(Mutex::new(entity)));
    }

    /// Removes `key` if its container is now empty, per the empty-container
    /// collapse invariant.
    fn collapse_if_empty(&self, key: &[u8], entity: &Arc<Mutex<Entity>>) {
        let empty = entity.lock().expect("entity poisoned").is_empty_container();
        if empty {
            self.keyspace.remove(key);
            self.ttl.lock().expect("ttl map poisoned").remove(key);
        }
    }

    fn type_mismatch<T>(&self) -> RkvResult<T> {
        Err(RkvError::WrongType)
    }

    // --- generic -------------------------------------------------------

    fn cmd_ping(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        match argv.len() {
            0 => Ok(RespValue::Simple(b"PONG".to_vec())),
            1 => Ok(RespValue::bulk(argv[0].clone())),
            _ => Err(arity_err("ping", ArityKind::AtLeast(0))),
        }
    }

    fn cmd_echo(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("echo", argv, ArityKind::Exact(1))?;
        Ok(RespValue::bulk(argv[0].clone()))
    }

    fn cmd_exists(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("exists", argv, ArityKind::AtLeast(1))?;
        let count = argv.iter().filter(|k| self.entity(k).is_some()).count();
        Ok(RespValue::Integer(count as i64))
    }

    fn cmd_type(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("type", argv, ArityKind::Exact(1))?;
        match self.entity(&argv[0]) {
            Some(entity) => {
                let name = entity.lock().expect("entity poisoned").type_name();
                Ok(RespValue::Simple(name.as_bytes().to_vec()))
            }
            None => Ok(RespValue::Simple(b"none".to_vec())),
        }
    }

    fn cmd_del(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("del", argv, ArityKind::AtLeast(1))?;
        let refs: Vec<&[u8]> = argv.iter().map(|k| k.as_slice()).collect();
        let _guards = self.locks.write_many(refs);
        let mut removed = 0;
        for key in argv {
            self.touch_expired(key);
            if self.keyspace.remove(key) {
                removed += 1;
            }
            self.ttl.lock().expect("ttl map poisoned").remove(key);
        }
        if removed > 0 {
            self.record(prepend(b"DEL", argv));
        }
        Ok(RespValue::Integer(removed))
    }

    fn cmd_expire(&self, argv: &[Vec<u8>], unit: Unit, anchor: Anchor) -> RkvResult<RespValue> {
        require_arity("expire", argv, ArityKind::Exact(2))?;
        let amount = parse_i64(&argv[1])?;
        let _guard = self.locks.write(&argv[0]);
        if self.entity(&argv[0]).is_none() {
            return Ok(RespValue::Integer(0));
        }
        let deadline = match (unit, anchor) {
            (Unit::Seconds, Anchor::Relative) => Instant::now() + Duration::from_secs(amount.max(0) as u64),
            (Unit::Millis, Anchor::Relative) => Instant::now() + Duration::from_millis(amount.max(0) as u64),
            (Unit::Seconds, Anchor::Absolute) => unix_secs_to_instant(amount),
            (Unit::Millis, Anchor::Absolute) => unix_millis_to_instant(amount),
        };
        self.ttl
            .lock()
            .expect("ttl map poisoned")
            .insert(argv[0].clone(), deadline);
        let at_millis = instant_to_unix_millis(deadline);
        self.record(vec![
            b"PEXPIREAT".to_vec(),
            argv[0].clone(),
            at_millis.to_string().into_bytes(),
        ]);
        Ok(RespValue::Integer(1))
    }

    fn cmd_ttl(&self, argv: &[Vec<u8>], unit: Unit) -> RkvResult<RespValue> {
        require_arity("ttl", argv, ArityKind::Exact(1))?;
        let _guard = self.locks.read(&argv[0]);
        if self.entity(&argv[0]).is_none() {
            return Ok(RespValue::Integer(-2));
        }
        let ttl = self.ttl.lock().expect("ttl map poisoned");
        match ttl.get(&argv[0]) {
            None => Ok(RespValue::Integer(-1)),
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let value = match unit {
                    Unit::Seconds => remaining.as_secs() as i64,
                    Unit::Millis => remaining.as_millis() as i64,
                };
                Ok(RespValue::Integer(value))
            }
        }
    }

    fn cmd_persist(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("persist", argv, ArityKind::Exact(1))?;
        let _guard = self.locks.write(&argv[0]);
        if self.entity(&argv[0]).is_none() {
            return Ok(RespValue::Integer(0));
        }
        let removed = self
            .ttl
            .lock()
            .expect("ttl map poisoned")
            .remove(&argv[0])
            .is_some();
        if removed {
            self.record(prepend(b"PERSIST", argv));
        }
        Ok(RespValue::Integer(removed as i64))
    }

    fn cmd_rename(&self, argv: &[Vec<u8>], nx: bool) -> RkvResult<RespValue> {
        require_arity("rename", argv, ArityKind::Exact(2))?;
        let refs: Vec<&[u8]> = vec![argv[0].as_slice(), argv[1].as_slice()];
        let _guards = self.locks.write_many(refs);
        let Some(src) = self.entity(&argv[0]) else {
            return Err(RkvError::Server("ERR no such key".into()));
        };
        if nx && self.entity(&argv[1]).is_some() {
            return Ok(RespValue::Integer(0));
        }
        self.keyspace.remove(&argv[0]);
        let ttl_value = self.ttl.lock().expect("ttl map poisoned").remove(&argv[0]);
        self.keyspace.put(argv[1].clone(), src);
        let mut ttl = self.ttl.lock().expect("ttl map poisoned");
        ttl.remove(&argv[1]);
        if let Some(at) = ttl_value {
            ttl.insert(argv[1].clone(), at);
        }
        drop(ttl);
        self.record(prepend(b"RENAME", argv));
        Ok(if nx { RespValue::Integer(1) } else { RespValue::ok() })
    }

    fn cmd_keys(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("keys", argv, ArityKind::Exact(1))?;
        if argv[0] != b"*" {
            return Err(RkvError::Protocol("only 'KEYS *' is supported".into()));
        }
        let mut keys = Vec::new();
        self.keyspace.for_each(|key, _| keys.push(RespValue::bulk(key.to_vec())));
        Ok(RespValue::Array(Some(keys)))
    }

    fn cmd_dbsize(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("dbsize", argv, ArityKind::Exact(0))?;
        Ok(RespValue::Integer(self.keyspace.len() as i64))
    }

    fn cmd_info(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("info", argv, ArityKind::AtLeast(0))?;
        let uptime = self.start_time.elapsed().as_secs();
        let text = format!(
            "# Server\r\nuptime_in_seconds:{uptime}\r\n# Keyspace\r\ndb0:keys={}\r\n",
            self.keyspace.len()
        );
        Ok(RespValue::bulk(text.into_bytes()))
    }

    fn cmd_flush(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("flushall", argv, ArityKind::Exact(0))?;
        let mut keys = Vec::new();
        self.keyspace.for_each(|key, _| keys.push(key.to_vec()));
        for key in &keys {
            self.keyspace.remove(key);
        }
        self.ttl.lock().expect("ttl map poisoned").clear();
        self.record(vec![b"FLUSHALL".to_vec()]);
        Ok(RespValue::ok())
    }

    // --- strings -------------------------------------------------------

    fn cmd_set(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("set", argv, ArityKind::AtLeast(2))?;
        let key = &argv[0];
        let value = argv[1].clone();
        let mut expire_at: Option<Instant> = None;
        let mut nx = false;
        let mut xx = false;
        let mut i = 2;
        while i < argv.len() {
            let opt = String::from_utf8_lossy(&argv[i]).to_ascii_uppercase();
            match opt.as_str() {
                "EX" => {
                    i += 1;
                    let secs = parse_i64(argv.get(i).ok_or_else(|| RkvError::Protocol("syntax error".into()))?)?;
                    expire_at = Some(Instant::now() + Duration::from_secs(secs.max(0) as u64));
                }
                "PX" => {
                    i += 1;
                    let millis = parse_i64(argv.get(i).ok_or_else(|| RkvError::Protocol("syntax error".into()))?)?;
                    expire_at = Some(Instant::now() + Duration::from_millis(millis.max(0) as u64));
                }
                "NX" => nx = true,
                "XX" => xx = true,
                _ => return Err(RkvError::Protocol("syntax error".into())),
            }
            i += 1;
        }

        let _guard = self.locks.write(key);
        let exists = self.entity(key).is_some();
        if nx && exists {
            return Ok(RespValue::null_bulk());
        }
        if xx && !exists {
            return Ok(RespValue::null_bulk());
        }
        self.store_new(key.clone(), Entity::Bytes(value.clone()));
        if let Some(at) = expire_at {
            self.ttl.lock().expect("ttl map poisoned").insert(key.clone(), at);
            self.record(vec![b"SET".to_vec(), key.clone(), value]);
            self.record(vec![
                b"PEXPIREAT".to_vec(),
                key.clone(),
                instant_to_unix_millis(at).to_string().into_bytes(),
            ]);
        } else {
            self.record(vec![b"SET".to_vec(), key.clone(), value]);
        }
        Ok(RespValue::ok())
    }

    fn cmd_get(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("get", argv, ArityKind::Exact(1))?;
        let _guard = self.locks.read(&argv[0]);
        match self.entity(&argv[0]) {
            None => Ok(RespValue::null_bulk()),
            Some(entity) => match &*entity.lock().expect("entity poisoned") {
                Entity::Bytes(bytes) => Ok(RespValue::bulk(bytes.clone())),
                _ => self.type_mismatch(),
            },
        }
    }

    fn cmd_getset(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("getset", argv, ArityKind::Exact(2))?;
        let _guard = self.locks.write(&argv[0]);
        let previous = match self.entity(&argv[0]) {
            None => RespValue::null_bulk(),
            Some(entity) => match &*entity.lock().expect("entity poisoned") {
                Entity::Bytes(bytes) => RespValue::bulk(bytes.clone()),
                _ => return self.type_mismatch(),
            },
        };
        self.store_new(argv[0].clone(), Entity::Bytes(argv[1].clone()));
        self.record(prepend(b"SET", argv));
        Ok(previous)
    }

    fn cmd_setnx(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("setnx", argv, ArityKind::Exact(2))?;
        let _guard = self.locks.write(&argv[0]);
        if self.entity(&argv[0]).is_some() {
            return Ok(RespValue::Integer(0));
        }
        self.store_new(argv[0].clone(), Entity::Bytes(argv[1].clone()));
        self.record(prepend(b"SET", argv));
        Ok(RespValue::Integer(1))
    }

    fn cmd_mset(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        if argv.is_empty() || argv.len() % 2 != 0 {
            return Err(arity_err("mset", ArityKind::AtLeast(2)));
        }
        let keys: Vec<&[u8]> = argv.iter().step_by(2).map(|k| k.as_slice()).collect();
        let _guards = self.locks.write_many(keys);
        for pair in argv.chunks_exact(2) {
            self.store_new(pair[0].clone(), Entity::Bytes(pair[1].clone()));
        }
        self.record(prepend(b"MSET", argv));
        Ok(RespValue::ok())
    }

    fn cmd_msetnx(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        if argv.is_empty() || argv.len() % 2 != 0 {
            return Err(arity_err("msetnx", ArityKind::AtLeast(2)));
        }
        let keys: Vec<&[u8]> = argv.iter().step_by(2).map(|k| k.as_slice()).collect();
        let _guards = self.locks.write_many(keys);
        let any_exists = argv.chunks_exact(2).any(|pair| self.entity(&pair[0]).is_some());
        if any_exists {
            return Ok(RespValue::Integer(0));
        }
        for pair in argv.chunks_exact(2) {
            self.store_new(pair[0].clone(), Entity::Bytes(pair[1].clone()));
        }
        self.record(prepend(b"MSET", argv));
        Ok(RespValue::Integer(1))
    }

    fn cmd_mget(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("mget", argv, ArityKind::AtLeast(1))?;
        let mut out = Vec::with_capacity(argv.len());
        for key in argv {
            let _guard = self.locks.read(key);
            let value = match self.entity(key) {
                Some(entity) => match &*entity.lock().expect("entity poisoned") {
                    Entity::Bytes(bytes) => RespValue::bulk(bytes.clone()),
                    _ => RespValue::null_bulk(),
                },
                None => RespValue::null_bulk(),
            };
            out.push(value);
        }
        Ok(RespValue::Array(Some(out)))
    }

    fn cmd_append(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("append", argv, ArityKind::Exact(2))?;
        let _guard = self.locks.write(&argv[0]);
        let new_len = match self.entity(&argv[0]) {
            Some(entity) => {
                let mut guard = entity.lock().expect("entity poisoned");
                match &mut *guard {
                    Entity::Bytes(bytes) => {
                        bytes.extend_from_slice(&argv[1]);
                        bytes.len()
                    }
                    _ => return self.type_mismatch(),
                }
            }
            None => {
                self.store_new(argv[0].clone(), Entity::Bytes(argv[1].clone()));
                argv[1].len()
            }
        };
        self.record(prepend(b"APPEND", argv));
        Ok(RespValue::Integer(new_len as i64))
    }

    fn cmd_strlen(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("strlen", argv, ArityKind::Exact(1))?;
        let _guard = self.locks.read(&argv[0]);
        match self.entity(&argv[0]) {
            None => Ok(RespValue::Integer(0)),
            Some(entity) => match &*entity.lock().expect("entity poisoned") {
                Entity::Bytes(bytes) => Ok(RespValue::Integer(bytes.len() as i64)),
                _ => self.type_mismatch(),
            },
        }
    }

    fn cmd_incrby(&self, argv: &[Vec<u8>], delta: i64) -> RkvResult<RespValue> {
        require_arity("incr", argv, ArityKind::Exact(1))?;
        self.apply_incrby(&argv[0], delta, b"INCRBY")
    }

    fn cmd_incrby_arg(&self, argv: &[Vec<u8>], sign: i64) -> RkvResult<RespValue> {
        require_arity("incrby", argv, ArityKind::Exact(2))?;
        let amount = parse_i64(&argv[1])?;
        self.apply_incrby(&argv[0], amount * sign, b"INCRBY")
    }

    fn apply_incrby(&self, key: &[u8], delta: i64, aof_name: &[u8]) -> RkvResult<RespValue> {
        let _guard = self.locks.write(key);
        let entity = match self.entity(key) {
            Some(entity) => entity,
            None => {
                self.store_new(key.to_vec(), Entity::Bytes(b"0".to_vec()));
                self.entity(key).unwrap()
            }
        };
        let mut guard = entity.lock().expect("entity poisoned");
        let Entity::Bytes(bytes) = &mut *guard else {
            return self.type_mismatch();
        };
        let current: i64 = std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(RkvError::NotAnInteger)?;
        let updated = current.checked_add(delta).ok_or(RkvError::NotAnInteger)?;
        *bytes = updated.to_string().into_bytes();
        drop(guard);
        self.record(vec![aof_name.to_vec(), key.to_vec(), delta.to_string().into_bytes()]);
        Ok(RespValue::Integer(updated))
    }

    fn cmd_incrbyfloat(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("incrbyfloat", argv, ArityKind::Exact(2))?;
        let delta: f64 = std::str::from_utf8(&argv[1])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(RkvError::NotAFloat)?;
        let _guard = self.locks.write(&argv[0]);
        let entity = match self.entity(&argv[0]) {
            Some(entity) => entity,
            None => {
                self.store_new(argv[0].clone(), Entity::Bytes(b"0".to_vec()));
                self.entity(&argv[0]).unwrap()
            }
        };
        let mut guard = entity.lock().expect("entity poisoned");
        let Entity::Bytes(bytes) = &mut *guard else {
            return self.type_mismatch();
        };
        let current: f64 = std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(RkvError::NotAFloat)?;
        let updated = current + delta;
        let rendered = format_float(updated);
        *bytes = rendered.clone().into_bytes();
        drop(guard);
        self.record(vec![b"SET".to_vec(), argv[0].clone(), rendered.clone().into_bytes()]);
        Ok(RespValue::bulk(rendered.into_bytes()))
    }

    // --- lists -----------------------------------------------------------

    fn cmd_push(&self, argv: &[Vec<u8>], side: Side, only_if_exists: bool) -> RkvResult<RespValue> {
        require_arity("lpush", argv, ArityKind::AtLeast(2))?;
        let key = &argv[0];
        let _guard = self.locks.write(key);
        let entity = match self.entity(key) {
            Some(entity) => entity,
            None => {
                if only_if_exists {
                    return Ok(RespValue::Integer(0));
                }
                self.store_new(key.clone(), Entity::List(crate::value::DList::new()));
                self.entity(key).unwrap()
            }
        };
        let mut guard = entity.lock().expect("entity poisoned");
        let Entity::List(list) = &mut *guard else {
            return self.type_mismatch();
        };
        for value in &argv[1..] {
            match side {
                Side::Left => list.push_front(value.clone()),
                Side::Right => list.push_back(value.clone()),
            }
        }
        let len = list.len();
        drop(guard);
        let name: &[u8] = match side {
            Side::Left => b"LPUSH",
            Side::Right => b"RPUSH",
        };
        self.record(prepend(name, argv));
        Ok(RespValue::Integer(len as i64))
    }

    fn cmd_pop(&self, argv: &[Vec<u8>], side: Side) -> RkvResult<RespValue> {
        require_arity("lpop", argv, ArityKind::Exact(1))?;
        let key = &argv[0];
        let _guard = self.locks.write(key);
        let Some(entity) = self.entity(key) else {
            return Ok(RespValue::null_bulk());
        };
        let popped = {
            let mut guard = entity.lock().expect("entity poisoned");
            let Entity::List(list) = &mut *guard else {
                return self.type_mismatch();
            };
            match side {
                Side::Left => list.pop_front(),
                Side::Right => list.pop_back(),
            }
        };
        self.collapse_if_empty(key, &entity);
        if popped.is_some() {
            let name: &[u8] = match side {
                Side::Left => b"LPOP",
                Side::Right => b"RPOP",
            };
            self.record(vec![name.to_vec(), key.clone()]);
        }
        Ok(match popped {
            Some(value) => RespValue::bulk(value),
            None => RespValue::null_bulk(),
        })
    }

    fn cmd_llen(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("llen", argv, ArityKind::Exact(1))?;
        let _guard = self.locks.read(&argv[0]);
        match self.entity(&argv[0]) {
            None => Ok(RespValue::Integer(0)),
            Some(entity) => match &*entity.lock().expect("entity poisoned") {
                Entity::List(list) => Ok(RespValue::Integer(list.len() as i64)),
                _ => self.type_mismatch(),
            },
        }
    }

    fn cmd_lrange(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("lrange", argv, ArityKind::Exact(3))?;
        let start = parse_i64(&argv[1])?;
        let stop = parse_i64(&argv[2])?;
        let _guard = self.locks.read(&argv[0]);
        match self.entity(&argv[0]) {
            None => Ok(RespValue::Array(Some(Vec::new()))),
            Some(entity) => match &*entity.lock().expect("entity poisoned") {
                Entity::List(list) => Ok(RespValue::Array(Some(
                    list.range(start, stop).into_iter().map(RespValue::bulk).collect(),
                ))),
                _ => self.type_mismatch(),
            },
        }
    }

    fn cmd_lindex(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("lindex", argv, ArityKind::Exact(2))?;
        let index = parse_i64(&argv[1])?;
        let _guard = self.locks.read(&argv[0]);
        match self.entity(&argv[0]) {
            None => Ok(RespValue::null_bulk()),
            Some(entity) => match &*entity.lock().expect("entity poisoned") {
                Entity::List(list) => Ok(match list.get(index) {
                    Some(value) => RespValue::bulk(value.to_vec()),
                    None => RespValue::null_bulk(),
                }),
                _ => self.type_mismatch(),
            },
        }
    }

    fn cmd_lset(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("lset", argv, ArityKind::Exact(3))?;
        let index = parse_i64(&argv[1])?;
        let _guard = self.locks.write(&argv[0]);
        let Some(entity) = self.entity(&argv[0]) else {
            return Err(RkvError::Server("ERR no such key".into()));
        };
        let mut guard = entity.lock().expect("entity poisoned");
        let Entity::List(list) = &mut *guard else {
            return self.type_mismatch();
        };
        if !list.set(index, argv[2].clone()) {
            return Err(RkvError::Server("ERR index out of range".into()));
        }
        drop(guard);
        self.record(prepend(b"LSET", argv));
        Ok(RespValue::ok())
    }

    fn cmd_linsert(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("linsert", argv, ArityKind::Exact(4))?;
        let before = match String::from_utf8_lossy(&argv[1]).to_ascii_uppercase().as_str() {
            "BEFORE" => true,
            "AFTER" => false,
            _ => return Err(RkvError::Protocol("syntax error".into())),
        };
        let _guard = self.locks.write(&argv[0]);
        let Some(entity) = self.entity(&argv[0]) else {
            return Ok(RespValue::Integer(0));
        };
        let mut guard = entity.lock().expect("entity poisoned");
        let Entity::List(list) = &mut *guard else {
            return self.type_mismatch();
        };
        let inserted = list.insert_relative(&argv[2], argv[3].clone(), before);
        let len = list.len();
        drop(guard);
        if inserted {
            self.record(prepend(b"LINSERT", argv));
            Ok(RespValue::Integer(len as i64))
        } else {
            Ok(RespValue::Integer(-1))
        }
    }

    fn cmd_lrem(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("lrem", argv, ArityKind::Exact(3))?;
        let count = parse_i64(&argv[1])?;
        let key = &argv[0];
        let _guard = self.locks.write(key);
        let Some(entity) = self.entity(key) else {
            return Ok(RespValue::Integer(0));
        };
        let removed = {
            let mut guard = entity.lock().expect("entity poisoned");
            let Entity::List(list) = &mut *guard else {
                return self.type_mismatch();
            };
            list.remove_matching(&argv[2], count)
        };
        self.collapse_if_empty(key, &entity);
        if removed > 0 {
            self.record(prepend(b"LREM", argv));
        }
        Ok(RespValue::Integer(removed as i64))
    }

    fn cmd_rpoplpush(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("rpoplpush", argv, ArityKind::Exact(2))?;
        let keys: Vec<&[u8]> = vec![argv[0].as_slice(), argv[1].as_slice()];
        let _guards = self.locks.write_many(keys);
        let Some(src) = self.entity(&argv[0]) else {
            return Ok(RespValue::null_bulk());
        };
        let popped = {
            let mut guard = src.lock().expect("entity poisoned");
            let Entity::List(list) = &mut *guard else {
                return self.type_mismatch();
            };
            list.pop_back()
        };
        self.collapse_if_empty(&argv[0], &src);
        let Some(value) = popped else {
            return Ok(RespValue::null_bulk());
        };
        let dst = match self.entity(&argv[1]) {
            Some(entity) => entity,
            None => {
                self.store_new(argv[1].clone(), Entity::List(crate::value::DList::new()));
                self.entity(&argv[1]).unwrap()
            }
        };
        {
            let mut guard = dst.lock().expect("entity poisoned");
            let Entity::List(list) = &mut *guard else {
                return self.type_mismatch();
            };
            list.push_front(value.clone());
        }
        self.record(prepend(b"RPOPLPUSH", argv));
        Ok(RespValue::bulk(value))
    }

    /// AOF-only: replaces the destination list wholesale, used to persist or
    /// replay a list entity in one record during rewrite.
    fn cmd_rpushall(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("rpushall", argv, ArityKind::AtLeast(1))?;
        let key = &argv[0];
        let _guard = self.locks.write(key);
        let mut list = crate::value::DList::new();
        for value in &argv[1..] {
            list.push_back(value.clone());
        }
        self.store_new(key.clone(), Entity::List(list));
        Ok(RespValue::ok())
    }

    // --- sets --------------------------------------------------------------

    fn cmd_sadd(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("sadd", argv, ArityKind::AtLeast(2))?;
        let key = &argv[0];
        let _guard = self.locks.write(key);
        let entity = match self.entity(key) {
            Some(entity) => entity,
            None => {
                self.store_new(key.clone(), Entity::Set(HashSet::new()));
                self.entity(key).unwrap()
            }
        };
        let mut guard = entity.lock().expect("entity poisoned");
        let Entity::Set(set) = &mut *guard else {
            return self.type_mismatch();
        };
        let mut added = 0;
        for member in &argv[1..] {
            if set.insert(member.clone()) {
                added += 1;
            }
        }
        drop(guard);
        if added > 0 {
            self.record(prepend(b"SADD", argv));
        }
        Ok(RespValue::Integer(added))
    }

    fn cmd_srem(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("srem", argv, ArityKind::AtLeast(2))?;
        let key = &argv[0];
        let _guard = self.locks.write(key);
        let Some(entity) = self.entity(key) else {
            return Ok(RespValue::Integer(0));
        };
        let removed = {
            let mut guard = entity.lock().expect("entity poisoned");
            let Entity::Set(set) = &mut *guard else {
                return self.type_mismatch();
            };
            argv[1..].iter().filter(|m| set.remove(m.as_slice())).count()
        };
        self.collapse_if_empty(key, &entity);
        if removed > 0 {
            self.record(prepend(b"SREM", argv));
        }
        Ok(RespValue::Integer(removed as i64))
    }

    fn cmd_sismember(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("sismember", argv, ArityKind::Exact(2))?;
        let _guard = self.locks.read(&argv[0]);
        match self.entity(&argv[0]) {
            None => Ok(RespValue::Integer(0)),
            Some(entity) => match &*entity.lock().expect("entity poisoned") {
                Entity::Set(set) => Ok(RespValue::Integer(set.contains(&argv[1]) as i64)),
                _ => self.type_mismatch(),
            },
        }
    }

    fn cmd_scard(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("scard", argv, ArityKind::Exact(1))?;
        let _guard = self.locks.read(&argv[0]);
        match self.entity(&argv[0]) {
            None => Ok(RespValue::Integer(0)),
            Some(entity) => match &*entity.lock().expect("entity poisoned") {
                Entity::Set(set) => Ok(RespValue::Integer(set.len() as i64)),
                _ => self.type_mismatch(),
            },
        }
    }

    fn cmd_smembers(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("smembers", argv, ArityKind::Exact(1))?;
        let _guard = self.locks.read(&argv[0]);
        match self.entity(&argv[0]) {
            None => Ok(RespValue::Array(Some(Vec::new()))),
            Some(entity) => match &*entity.lock().expect("entity poisoned") {
                Entity::Set(set) => Ok(RespValue::Array(Some(
                    set.iter().cloned().map(RespValue::bulk).collect(),
                ))),
                _ => self.type_mismatch(),
            },
        }
    }

    fn read_set(&self, key: &[u8]) -> RkvResult<HashSet<Vec<u8>>> {
        match self.entity(key) {
            None => Ok(HashSet::new()),
            Some(entity) => match &*entity.lock().expect("entity poisoned") {
                Entity::Set(set) => Ok(set.clone()),
                _ => self.type_mismatch(),
            },
        }
    }

    fn cmd_set_algebra(
        &self,
        argv: &[Vec<u8>],
        op: SetOp,
        store_key: Option<&[u8]>,
    ) -> RkvResult<RespValue> {
        require_arity("sinter", argv, ArityKind::AtLeast(1))?;
        let refs: Vec<&[u8]> = argv.iter().map(|k| k.as_slice()).collect();
        let _guards = self.locks.read_many(refs);
        let result = self.combine_sets(argv, op)?;
        let _ = store_key;
        Ok(RespValue::Array(Some(
            result.into_iter().map(RespValue::bulk).collect(),
        )))
    }

    fn combine_sets(&self, keys: &[Vec<u8>], op: SetOp) -> RkvResult<HashSet<Vec<u8>>> {
        let mut sets = Vec::with_capacity(keys.len());
        for key in keys {
            sets.push(self.read_set(key)?);
        }
        let mut result = sets.first().cloned().unwrap_or_default();
        for set in &sets[1..] {
            result = match op {
                SetOp::Inter => result.intersection(set).cloned().collect(),
                SetOp::Union => result.union(set).cloned().collect(),
                SetOp::Diff => result.difference(set).cloned().collect(),
            };
        }
        Ok(result)
    }

    fn cmd_set_algebra_store(&self, argv: &[Vec<u8>], op: SetOp) -> RkvResult<RespValue> {
        require_arity("sinterstore", argv, ArityKind::AtLeast(2))?;
        let dest = argv[0].clone();
        let sources = &argv[1..];
        let mut keys: Vec<&[u8]> = vec![dest.as_slice()];
        keys.extend(sources.iter().map(|k| k.as_slice()));
        let _guards = self.locks.write_many(keys);
        let result = self.combine_sets(sources, op)?;
        let len = result.len();
        if result.is_empty() {
            self.keyspace.remove(&dest);
        } else {
            self.store_new(dest.clone(), Entity::Set(result));
        }
        self.record(prepend(b"SINTERSTORE", argv));
        Ok(RespValue::Integer(len as i64))
    }

    fn cmd_srandmember(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        if argv.is_empty() || argv.len() > 2 {
            return Err(RkvError::WrongArity("srandmember".into()));
        }
        let _guard = self.locks.read(&argv[0]);
        let entity = match self.entity(&argv[0]) {
            None => return Ok(RespValue::null_bulk()),
            Some(entity) => entity,
        };
        let guard = entity.lock().expect("entity poisoned");
        let Entity::Set(set) = &*guard else {
            return self.type_mismatch();
        };

        if argv.len() == 1 {
            return Ok(match random_members(set, 1).into_iter().next() {
                Some(member) => RespValue::bulk(member),
                None => RespValue::null_bulk(),
            });
        }

        let count = parse_i64(&argv[1])?;
        let members = if count > 0 {
            random_members(set, count as usize)
        } else if count < 0 {
            random_distinct_members(set, (-count) as usize)
        } else {
            Vec::new()
        };
        Ok(RespValue::Array(Some(members.into_iter().map(RespValue::bulk).collect())))
    }

    fn cmd_smove(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("smove", argv, ArityKind::Exact(3))?;
        let keys: Vec<&[u8]> = vec![argv[0].as_slice(), argv[1].as_slice()];
        let _guards = self.locks.write_many(keys);
        let Some(src) = self.entity(&argv[0]) else {
            return Ok(RespValue::Integer(0));
        };
        let removed = {
            let mut guard = src.lock().expect("entity poisoned");
            let Entity::Set(set) = &mut *guard else {
                return self.type_mismatch();
            };
            set.remove(&argv[2])
        };
        self.collapse_if_empty(&argv[0], &src);
        if !removed {
            return Ok(RespValue::Integer(0));
        }
        let dst = match self.entity(&argv[1]) {
            Some(entity) => entity,
            None => {
                self.store_new(argv[1].clone(), Entity::Set(HashSet::new()));
                self.entity(&argv[1]).unwrap()
            }
        };
        {
            let mut guard = dst.lock().expect("entity poisoned");
            let Entity::Set(set) = &mut *guard else {
                return self.type_mismatch();
            };
            set.insert(argv[2].clone());
        }
        self.record(prepend(b"SMOVE", argv));
        Ok(RespValue::Integer(1))
    }

    // --- hashes --------------------------------------------------------------

    fn cmd_hset(&self, argv: &[Vec<u8>], only_if_absent: bool) -> RkvResult<RespValue> {
        require_arity("hset", argv, ArityKind::AtLeast(3))?;
        if (argv.len() - 1) % 2 != 0 {
            return Err(arity_err("hset", ArityKind::AtLeast(3)));
        }
        let key = &argv[0];
        let _guard = self.locks.write(key);
        let entity = match self.entity(key) {
            Some(entity) => entity,
            None => {
                self.store_new(key.clone(), Entity::Hash(ShardedMap::new()));
                self.entity(key).unwrap()
            }
        };
        let mut added = 0;
        {
            let guard = entity.lock().expect("entity poisoned");
            let Entity::Hash(hash) = &*guard else {
                return self.type_mismatch();
            };
            for pair in argv[1..].chunks_exact(2) {
                if only_if_absent {
                    if hash.put_if_absent(pair[0].clone(), pair[1].clone()) {
                        added += 1;
                    }
                } else if hash.put(pair[0].clone(), pair[1].clone()) {
                    added += 1;
                }
            }
        }
        self.record(prepend(b"HSET", argv));
        Ok(RespValue::Integer(added))
    }

    fn cmd_hget(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("hget", argv, ArityKind::Exact(2))?;
        let _guard = self.locks.read(&argv[0]);
        match self.entity(&argv[0]) {
            None => Ok(RespValue::null_bulk()),
            Some(entity) => match &*entity.lock().expect("entity poisoned") {
                Entity::Hash(hash) => Ok(match hash.get(&argv[1]) {
                    Some(value) => RespValue::bulk(value),
                    None => RespValue::null_bulk(),
                }),
                _ => self.type_mismatch(),
            },
        }
    }

    fn cmd_hdel(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("hdel", argv, ArityKind::AtLeast(2))?;
        let key = &argv[0];
        let _guard = self.locks.write(key);
        let Some(entity) = self.entity(key) else {
            return Ok(RespValue::Integer(0));
        };
        let removed = {
            let guard = entity.lock().expect("entity poisoned");
            let Entity::Hash(hash) = &*guard else {
                return self.type_mismatch();
            };
            argv[1..].iter().filter(|f| hash.remove(f)).count()
        };
        self.collapse_if_empty(key, &entity);
        if removed > 0 {
            self.record(prepend(b"HDEL", argv));
        }
        Ok(RespValue::Integer(removed as i64))
    }

    fn cmd_hexists(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("hexists", argv, ArityKind::Exact(2))?;
        let _guard = self.locks.read(&argv[0]);
        match self.entity(&argv[0]) {
            None => Ok(RespValue::Integer(0)),
            Some(entity) => match &*entity.lock().expect("entity poisoned") {
                Entity::Hash(hash) => Ok(RespValue::Integer(hash.contains_key(&argv[1]) as i64)),
                _ => self.type_mismatch(),
            },
        }
    }

    fn cmd_hlen(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("hlen", argv, ArityKind::Exact(1))?;
        let _guard = self.locks.read(&argv[0]);
        match self.entity(&argv[0]) {
            None => Ok(RespValue::Integer(0)),
            Some(entity) => match &*entity.lock().expect("entity poisoned") {
                Entity::Hash(hash) => Ok(RespValue::Integer(hash.len() as i64)),
                _ => self.type_mismatch(),
            },
        }
    }

    fn cmd_hmset(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        self.cmd_hset(argv, false).map(|_| RespValue::ok())
    }

    fn cmd_hgetall(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("hgetall", argv, ArityKind::Exact(1))?;
        let _guard = self.locks.read(&argv[0]);
        match self.entity(&argv[0]) {
            None => Ok(RespValue::Array(Some(Vec::new()))),
            Some(entity) => match &*entity.lock().expect("entity poisoned") {
                Entity::Hash(hash) => {
                    let mut out = Vec::new();
                    hash.for_each(|field, value| {
                        out.push(RespValue::bulk(field.to_vec()));
                        out.push(RespValue::bulk(value.clone()));
                    });
                    Ok(RespValue::Array(Some(out)))
                }
                _ => self.type_mismatch(),
            },
        }
    }

    fn cmd_hkeys_or_vals(&self, argv: &[Vec<u8>], keys: bool) -> RkvResult<RespValue> {
        require_arity("hkeys", argv, ArityKind::Exact(1))?;
        let _guard = self.locks.read(&argv[0]);
        match self.entity(&argv[0]) {
            None => Ok(RespValue::Array(Some(Vec::new()))),
            Some(entity) => match &*entity.lock().expect("entity poisoned") {
                Entity::Hash(hash) => {
                    let mut out = Vec::new();
                    hash.for_each(|field, value| {
                        out.push(RespValue::bulk(if keys { field.to_vec() } else { value.clone() }));
                    });
                    Ok(RespValue::Array(Some(out)))
                }
                _ => self.type_mismatch(),
            },
        }
    }

    fn cmd_hincrby(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("hincrby", argv, ArityKind::Exact(3))?;
        let delta = parse_i64(&argv[2])?;
        let key = &argv[0];
        let _guard = self.locks.write(key);
        let entity = match self.entity(key) {
            Some(entity) => entity,
            None => {
                self.store_new(key.clone(), Entity::Hash(ShardedMap::new()));
                self.entity(key).unwrap()
            }
        };
        let updated = {
            let guard = entity.lock().expect("entity poisoned");
            let Entity::Hash(hash) = &*guard else {
                return self.type_mismatch();
            };
            let current: i64 = match hash.get(&argv[1]) {
                Some(bytes) => std::str::from_utf8(&bytes)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or(RkvError::NotAnInteger)?,
                None => 0,
            };
            let updated = current.checked_add(delta).ok_or(RkvError::NotAnInteger)?;
            hash.put(argv[1].clone(), updated.to_string().into_bytes());
            updated
        };
        self.record(prepend(b"HINCRBY", argv));
        Ok(RespValue::Integer(updated))
    }

    // --- sorted sets --------------------------------------------------------

    fn cmd_zadd(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("zadd", argv, ArityKind::AtLeast(3))?;
        if (argv.len() - 1) % 2 != 0 {
            return Err(arity_err("zadd", ArityKind::AtLeast(3)));
        }
        let key = &argv[0];
        let _guard = self.locks.write(key);
        let entity = match self.entity(key) {
            Some(entity) => entity,
            None => {
                self.store_new(key.clone(), Entity::ZSet(crate::value::SortedSet::new()));
                self.entity(key).unwrap()
            }
        };
        let mut added = 0;
        {
            let mut guard = entity.lock().expect("entity poisoned");
            let Entity::ZSet(zset) = &mut *guard else {
                return self.type_mismatch();
            };
            for pair in argv[1..].chunks_exact(2) {
                let score = parse_f64(&pair[0])?;
                if zset.insert(pair[1].clone(), score) {
                    added += 1;
                }
            }
        }
        self.record(prepend(b"ZADD", argv));
        Ok(RespValue::Integer(added))
    }

    fn cmd_zscore(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("zscore", argv, ArityKind::Exact(2))?;
        let _guard = self.locks.read(&argv[0]);
        match self.entity(&argv[0]) {
            None => Ok(RespValue::null_bulk()),
            Some(entity) => match &*entity.lock().expect("entity poisoned") {
                Entity::ZSet(zset) => Ok(match zset.score(&argv[1]) {
                    Some(score) => RespValue::bulk(format_float(score).into_bytes()),
                    None => RespValue::null_bulk(),
                }),
                _ => self.type_mismatch(),
            },
        }
    }

    fn cmd_zrem(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("zrem", argv, ArityKind::AtLeast(2))?;
        let key = &argv[0];
        let _guard = self.locks.write(key);
        let Some(entity) = self.entity(key) else {
            return Ok(RespValue::Integer(0));
        };
        let removed = {
            let mut guard = entity.lock().expect("entity poisoned");
            let Entity::ZSet(zset) = &mut *guard else {
                return self.type_mismatch();
            };
            argv[1..].iter().filter(|m| zset.remove(m)).count()
        };
        self.collapse_if_empty(key, &entity);
        if removed > 0 {
            self.record(prepend(b"ZREM", argv));
        }
        Ok(RespValue::Integer(removed as i64))
    }

    fn cmd_zcard(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("zcard", argv, ArityKind::Exact(1))?;
        let _guard = self.locks.read(&argv[0]);
        match self.entity(&argv[0]) {
            None => Ok(RespValue::Integer(0)),
            Some(entity) => match &*entity.lock().expect("entity poisoned") {
                Entity::ZSet(zset) => Ok(RespValue::Integer(zset.len() as i64)),
                _ => self.type_mismatch(),
            },
        }
    }

    fn cmd_zrank(&self, argv: &[Vec<u8>], reverse: bool) -> RkvResult<RespValue> {
        require_arity("zrank", argv, ArityKind::Exact(2))?;
        let _guard = self.locks.read(&argv[0]);
        match self.entity(&argv[0]) {
            None => Ok(RespValue::null_bulk()),
            Some(entity) => match &*entity.lock().expect("entity poisoned") {
                Entity::ZSet(zset) => Ok(match zset.rank(&argv[1]) {
                    Some(rank) => {
                        let value = if reverse {
                            (zset.len() as u64).saturating_sub(1).saturating_sub(rank)
                        } else {
                            rank
                        };
                        RespValue::Integer(value as i64)
                    }
                    None => RespValue::null_bulk(),
                }),
                _ => self.type_mismatch(),
            },
        }
    }

    fn cmd_zrange(&self, argv: &[Vec<u8>], reverse: bool) -> RkvResult<RespValue> {
        require_arity("zrange", argv, ArityKind::AtLeast(3))?;
        let start = parse_i64(&argv[1])?;
        let stop = parse_i64(&argv[2])?;
        let with_scores = argv
            .get(3)
            .map(|opt| opt.eq_ignore_ascii_case(b"WITHSCORES"))
            .unwrap_or(false);
        let _guard = self.locks.read(&argv[0]);
        match self.entity(&argv[0]) {
            None => Ok(RespValue::Array(Some(Vec::new()))),
            Some(entity) => match &*entity.lock().expect("entity poisoned") {
                Entity::ZSet(zset) => {
                    let mut items = zset.range_by_rank(start, stop);
                    if reverse {
                        items.reverse();
                    }
                    let mut out = Vec::new();
                    for (member, score) in items {
                        out.push(RespValue::bulk(member));
                        if with_scores {
                            out.push(RespValue::bulk(format_float(score).into_bytes()));
                        }
                    }
                    Ok(RespValue::Array(Some(out)))
                }
                _ => self.type_mismatch(),
            },
        }
    }

    fn cmd_zrangebyscore(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("zrangebyscore", argv, ArityKind::AtLeast(3))?;
        let min = parse_f64(&argv[1])?;
        let max = parse_f64(&argv[2])?;
        let _guard = self.locks.read(&argv[0]);
        match self.entity(&argv[0]) {
            None => Ok(RespValue::Array(Some(Vec::new()))),
            Some(entity) => match &*entity.lock().expect("entity poisoned") {
                Entity::ZSet(zset) => Ok(RespValue::Array(Some(
                    zset.range_by_score(min, max)
                        .into_iter()
                        .map(|(member, _)| RespValue::bulk(member))
                        .collect(),
                ))),
                _ => self.type_mismatch(),
            },
        }
    }

    fn cmd_zcount(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("zcount", argv, ArityKind::Exact(3))?;
        let min = parse_f64(&argv[1])?;
        let max = parse_f64(&argv[2])?;
        let _guard = self.locks.read(&argv[0]);
        match self.entity(&argv[0]) {
            None => Ok(RespValue::Integer(0)),
            Some(entity) => match &*entity.lock().expect("entity poisoned") {
                Entity::ZSet(zset) => Ok(RespValue::Integer(zset.count_by_score(min, max) as i64)),
                _ => self.type_mismatch(),
            },
        }
    }

    fn cmd_zincrby(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("zincrby", argv, ArityKind::Exact(3))?;
        let delta = parse_f64(&argv[1])?;
        let key = &argv[0];
        let _guard = self.locks.write(key);
        let entity = match self.entity(key) {
            Some(entity) => entity,
            None => {
                self.store_new(key.clone(), Entity::ZSet(crate::value::SortedSet::new()));
                self.entity(key).unwrap()
            }
        };
        let updated = {
            let mut guard = entity.lock().expect("entity poisoned");
            let Entity::ZSet(zset) = &mut *guard else {
                return self.type_mismatch();
            };
            let current = zset.score(&argv[2]).unwrap_or(0.0);
            let updated = current + delta;
            zset.insert(argv[2].clone(), updated);
            updated
        };
        self.record(vec![
            b"ZADD".to_vec(),
            key.clone(),
            format_float(updated).into_bytes(),
            argv[2].clone(),
        ]);
        Ok(RespValue::bulk(format_float(updated).into_bytes()))
    }

    fn cmd_zremrangebyrank(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("zremrangebyrank", argv, ArityKind::Exact(3))?;
        let start = parse_i64(&argv[1])?;
        let stop = parse_i64(&argv[2])?;
        let key = &argv[0];
        let _guard = self.locks.write(key);
        let Some(entity) = self.entity(key) else {
            return Ok(RespValue::Integer(0));
        };
        let removed = {
            let mut guard = entity.lock().expect("entity poisoned");
            let Entity::ZSet(zset) = &mut *guard else {
                return self.type_mismatch();
            };
            let doomed: Vec<Vec<u8>> = zset
                .range_by_rank(start, stop)
                .into_iter()
                .map(|(member, _)| member)
                .collect();
            for member in &doomed {
                zset.remove(member);
            }
            doomed.len()
        };
        self.collapse_if_empty(key, &entity);
        if removed > 0 {
            self.record(prepend(b"ZREMRANGEBYRANK", argv));
        }
        Ok(RespValue::Integer(removed as i64))
    }

    fn cmd_zremrangebyscore(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("zremrangebyscore", argv, ArityKind::Exact(3))?;
        let min = parse_f64(&argv[1])?;
        let max = parse_f64(&argv[2])?;
        let key = &argv[0];
        let _guard = self.locks.write(key);
        let Some(entity) = self.entity(key) else {
            return Ok(RespValue::Integer(0));
        };
        let removed = {
            let mut guard = entity.lock().expect("entity poisoned");
            let Entity::ZSet(zset) = &mut *guard else {
                return self.type_mismatch();
            };
            let doomed: Vec<Vec<u8>> = zset
                .range_by_score(min, max)
                .into_iter()
                .map(|(member, _)| member)
                .collect();
            for member in &doomed {
                zset.remove(member);
            }
            doomed.len()
        };
        self.collapse_if_empty(key, &entity);
        if removed > 0 {
            self.record(prepend(b"ZREMRANGEBYSCORE", argv));
        }
        Ok(RespValue::Integer(removed as i64))
    }

    // --- pub/sub -------------------------------------------------------------

    fn cmd_subscribe(&self, conn_id: u64, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("subscribe", argv, ArityKind::AtLeast(1))?;
        let mut subs = self.subscriptions.lock().expect("subscriptions poisoned");
        for channel in argv {
            subs.entry(channel.clone()).or_default().insert(conn_id);
        }
        Ok(RespValue::ok())
    }

    fn cmd_unsubscribe(&self, conn_id: u64, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        let mut subs = self.subscriptions.lock().expect("subscriptions poisoned");
        if argv.is_empty() {
            for members in subs.values_mut() {
                members.remove(&conn_id);
            }
        } else {
            for channel in argv {
                if let Some(members) = subs.get_mut(channel) {
                    members.remove(&conn_id);
                }
            }
        }
        Ok(RespValue::ok())
    }

    /// Returns the number of subscribers currently tracked for the channel;
    /// actual socket delivery is the command layer's responsibility.
    fn cmd_publish(&self, argv: &[Vec<u8>]) -> RkvResult<RespValue> {
        require_arity("publish", argv, ArityKind::Exact(2))?;
        let subs = self.subscriptions.lock().expect("subscriptions poisoned");
        let count = subs.get(&argv[0]).map(|members| members.len()).unwrap_or(0);
        Ok(RespValue::Integer(count as i64))
    }

    /// Subscriber ids currently registered for `channel`, for the command
    /// layer to actually deliver `message` to.
    pub fn subscribers_for(&self, channel: &[u8]) -> Vec<u64> {
        self.subscriptions
            .lock()
            .expect("subscriptions poisoned")
            .get(channel)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    // --- AOF / expirer support -----------------------------------------

    /// Canonical commands that would recreate the current keyspace from
    /// scratch: one `SET`/`RPUSHALL`/`SADD`/`HMSET`/`ZADD` per live key, plus
    /// one `PEXPIREAT` per key carrying a TTL. Used by the AOF rewrite step
    /// to compact the log to its minimal replay form.
    pub fn snapshot_commands(&self) -> Vec<Vec<Vec<u8>>> {
        let mut commands = Vec::new();
        self.keyspace.for_each(|key, entity| {
            let guard = entity.lock().expect("entity poisoned");
            let cmd = match &*guard {
                Entity::Bytes(bytes) => vec![b"SET".to_vec(), key.to_vec(), bytes.clone()],
                Entity::List(list) => {
                    let mut cmd = vec![b"RPUSHALL".to_vec(), key.to_vec()];
                    cmd.extend(list.to_vec());
                    cmd
                }
                Entity::Set(set) => {
                    let mut cmd = vec![b"SADD".to_vec(), key.to_vec()];
                    cmd.extend(set.iter().cloned());
                    cmd
                }
                Entity::Hash(hash) => {
                    let mut cmd = vec![b"HMSET".to_vec(), key.to_vec()];
                    hash.for_each(|field, value| {
                        cmd.push(field.to_vec());
                        cmd.push(value.clone());
                    });
                    cmd
                }
                Entity::ZSet(zset) => {
                    let mut cmd = vec![b"ZADD".to_vec(), key.to_vec()];
                    for (member, score) in zset.iter() {
                        cmd.push(format_float(score).into_bytes());
                        cmd.push(member.to_vec());
                    }
                    cmd
                }
            };
            commands.push(cmd);
        });
        let ttl = self.ttl.lock().expect("ttl map poisoned");
        for (key, deadline) in ttl.iter() {
            if self.keyspace.contains_key(key) {
                commands.push(vec![
                    b"PEXPIREAT".to_vec(),
                    key.clone(),
                    instant_to_unix_millis(*deadline).to_string().into_bytes(),
                ]);
            }
        }
        commands
    }

    /// Removes up to `budget` keys whose TTL has already elapsed. Does not
    /// emit anything to the AOF sink: expiry is replayed by re-evaluating the
    /// TTL on load, not by logging the removal (see the periodic expirer).
    pub fn reap_expired(&self, budget: usize) -> usize {
        let now = Instant::now();
        let doomed: Vec<Vec<u8>> = {
            let ttl = self.ttl.lock().expect("ttl map poisoned");
            ttl.iter()
                .filter(|(_, at)| **at <= now)
                .take(budget)
                .map(|(key, _)| key.clone())
                .collect()
        };
        for key in &doomed {
            self.keyspace.remove(key);
            self.ttl.lock().expect("ttl map poisoned").remove(key);
        }
        doomed.len()
    }

    // --- Cluster transaction support ------------------------------------
    //
    // The two-phase `DEL` coordinator in `rkv-cluster` needs to capture an
    // undo image before deleting, and to restore it if a peer's commit
    // fails. These three calls are each a short, independently-atomic
    // engine operation; the router is responsible for holding its own
    // bookkeeping (the transaction id, which keys belong to it) across the
    // network round trip between prepare and commit/rollback.

    /// Clones the current value and TTL of each key (or records its
    /// absence), without mutating anything. Used as the undo image for a
    /// `DEL` transaction's prepare phase.
    pub fn snapshot_many(&self, keys: &[Vec<u8>]) -> Vec<KeySnapshot> {
        let refs: Vec<&[u8]> = keys.iter().map(|k| k.as_slice()).collect();
        let _guards = self.locks.write_many(refs);
        keys.iter()
            .map(|key| {
                self.touch_expired(key);
                let entity = self
                    .keyspace
                    .get(key)
                    .map(|arc| arc.lock().expect("entity poisoned").clone());
                let ttl = self.ttl.lock().expect("ttl map poisoned").get(key).copied();
                KeySnapshot {
                    key: key.clone(),
                    entity,
                    ttl,
                }
            })
            .collect()
    }

    /// Deletes every key in `keys` (the commit phase of a `DEL`
    /// transaction). Returns the number that actually existed.
    pub fn delete_many(&self, keys: &[Vec<u8>]) -> usize {
        let _global = self.global.read().expect("global lock poisoned");
        let refs: Vec<&[u8]> = keys.iter().map(|k| k.as_slice()).collect();
        let _guards = self.locks.write_many(refs);
        let mut count = 0;
        for key in keys {
            if self.keyspace.remove(key) {
                count += 1;
            }
            self.ttl.lock().expect("ttl map poisoned").remove(key);
        }
        count
    }

    /// Restores keys from a snapshot taken by `snapshot_many` (the rollback
    /// path of a `DEL` transaction whose commit failed on some peer).
    pub fn restore_many(&self, snapshots: Vec<KeySnapshot>) {
        let refs: Vec<&[u8]> = snapshots.iter().map(|s| s.key.as_slice()).collect();
        let _guards = self.locks.write_many(refs);
        for snapshot in snapshots {
            match snapshot.entity {
                Some(entity) => {
                    self.keyspace.put(snapshot.key.clone(), Arc::new(Mutex::new(entity)));
                    let mut ttl = self.ttl.lock().expect("ttl map poisoned");
                    match snapshot.ttl {
                        Some(deadline) => {
                            ttl.insert(snapshot.key, deadline);
                        }
                        None => {
                            ttl.remove(&snapshot.key);
                        }
                    }
                }
                None => {
                    self.keyspace.remove(&snapshot.key);
                    self.ttl.lock().expect("ttl map poisoned").remove(&snapshot.key);
                }
            }
        }
    }
}

/// Point-in-time value of one key, used as an undo image by the cluster's
/// two-phase `DEL` coordinator.
pub struct KeySnapshot {
    key: Vec<u8>,
    entity: Option<Entity>,
    ttl: Option<Instant>,
}

impl Default for DataEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy)]
enum Side {
    Left,
    Right,
}

#[derive(Clone, Copy)]
enum SetOp {
    Inter,
    Union,
    Diff,
}

#[derive(Clone, Copy)]
enum Unit {
    Seconds,
    Millis,
}

#[derive(Clone, Copy)]
enum Anchor {
    Relative,
    Absolute,
}

fn require_arity(name: &str, argv: &[Vec<u8>], kind: ArityKind) -> RkvResult<()> {
    let ok = match kind {
        ArityKind::Exact(n) => argv.len() == n,
        ArityKind::AtLeast(n) => argv.len() >= n,
    };
    if ok {
        Ok(())
    } else {
        Err(arity_err(name, kind))
    }
}

fn arity_err(name: &str, _kind: ArityKind) -> RkvError {
    RkvError::WrongArity(name.to_string())
}

fn prepend(name: &[u8], argv: &[Vec<u8>]) -> Vec<Vec<u8>> {
    let mut out = Vec::with_capacity(argv.len() + 1);
    out.push(name.to_vec());
    out.extend(argv.iter().cloned());
    out
}

fn parse_i64(bytes: &[u8]) -> RkvResult<i64> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(RkvError::NotAnInteger)
}

fn parse_f64(bytes: &[u8]) -> RkvResult<f64> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(RkvError::NotAFloat)
}

fn format_float(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e17 {
        format!("{}", value as i64)
    } else {
        let mut text = format!("{value:.17}");
        while text.ends_with('0') {
            text.pop();
        }
        if text.ends_with('.') {
            text.pop();
        }
        text
    }
}

fn unix_secs_to_instant(secs: i64) -> Instant {
    unix_millis_to_instant(secs.saturating_mul(1000))
}

fn unix_millis_to_instant(millis: i64) -> Instant {
    let now_unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64;
    let delta = millis - now_unix;
    if delta <= 0 {
        Instant::now()
    } else {
        Instant::now() + Duration::from_millis(delta as u64)
    }
}

/// Picks `count` members with replacement, per `SRANDMEMBER key <positive count>`.
/// The same member may appear more than once; an empty set yields no members.
fn random_members(set: &HashSet<Vec<u8>>, count: usize) -> Vec<Vec<u8>> {
    if set.is_empty() || count == 0 {
        return Vec::new();
    }
    let pool: Vec<&Vec<u8>> = set.iter().collect();
    let mut rng = rand::rng();
    (0..count)
        .map(|_| pool[rng.random_range(0..pool.len())].clone())
        .collect()
}

/// Picks up to `count` distinct members, per `SRANDMEMBER key <negative count>`.
/// Never returns more members than the set actually has.
fn random_distinct_members(set: &HashSet<Vec<u8>>, count: usize) -> Vec<Vec<u8>> {
    if set.is_empty() || count == 0 {
        return Vec::new();
    }
    let mut pool: Vec<&Vec<u8>> = set.iter().collect();
    let mut rng = rand::rng();
    pool.shuffle(&mut rng);
    pool.into_iter().take(count).cloned().collect()
}

fn instant_to_unix_millis(instant: Instant) -> i64 {
    let now_unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64;
    let delta = instant.saturating_duration_since(Instant::now()).as_millis() as i64;
    now_unix + delta
}

/// Monotonic counter used by the server to hand out connection identifiers
/// for `SUBSCRIBE`/`UNSUBSCRIBE` bookkeeping.
pub static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_conn_id() -> u64 {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec(engine: &DataEngine, args: &[&str]) -> RespValue {
        let args: Vec<Vec<u8>> = args.iter().map(|a| a.as_bytes().to_vec()).collect();
        engine.exec(1, &args)
    }

    #[test]
    fn set_and_get_roundtrip() {
        let engine = DataEngine::new();
        assert_eq!(exec(&engine, &["SET", "k", "v"]), RespValue::ok());
        assert_eq!(exec(&engine, &["GET", "k"]), RespValue::bulk(b"v".to_vec()));
    }

    #[test]
    fn incr_on_missing_key_starts_at_zero() {
        let engine = DataEngine::new();
        assert_eq!(exec(&engine, &["INCR", "counter"]), RespValue::Integer(1));
        assert_eq!(exec(&engine, &["INCRBY", "counter", "4"]), RespValue::Integer(5));
    }

    #[test]
    fn wrong_type_error_on_list_op_against_string() {
        let engine = DataEngine::new();
        exec(&engine, &["SET", "k", "v"]);
        match exec(&engine, &["LPUSH", "k", "x"]) {
            RespValue::Error(msg) => assert!(msg.starts_with(b"WRONGTYPE")),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn list_push_pop_and_range() {
        let engine = DataEngine::new();
        exec(&engine, &["RPUSH", "list", "a"]);
        exec(&engine, &["RPUSH", "list", "b"]);
        exec(&engine, &["LPUSH", "list", "z"]);
        assert_eq!(
            exec(&engine, &["LRANGE", "list", "0", "-1"]),
            RespValue::Array(Some(vec![
                RespValue::bulk(b"z".to_vec()),
                RespValue::bulk(b"a".to_vec()),
                RespValue::bulk(b"b".to_vec())
            ]))
        );
    }

    #[test]
    fn list_pop_collapses_empty_key() {
        let engine = DataEngine::new();
        exec(&engine, &["RPUSH", "list", "only"]);
        exec(&engine, &["LPOP", "list"]);
        assert_eq!(exec(&engine, &["EXISTS", "list"]), RespValue::Integer(0));
    }

    #[test]
    fn hash_set_get_and_incrby() {
        let engine = DataEngine::new();
        exec(&engine, &["HSET", "h", "f1", "v1"]);
        assert_eq!(exec(&engine, &["HGET", "h", "f1"]), RespValue::bulk(b"v1".to_vec()));
        exec(&engine, &["HINCRBY", "h", "count", "3"]);
        assert_eq!(exec(&engine, &["HINCRBY", "h", "count", "2"]), RespValue::Integer(5));
    }

    #[test]
    fn zset_add_rank_and_range() {
        let engine = DataEngine::new();
        exec(&engine, &["ZADD", "z", "1", "a"]);
        exec(&engine, &["ZADD", "z", "2", "b"]);
        exec(&engine, &["ZADD", "z", "3", "c"]);
        assert_eq!(exec(&engine, &["ZRANK", "z", "b"]), RespValue::Integer(1));
        assert_eq!(
            exec(&engine, &["ZRANGE", "z", "0", "-1"]),
            RespValue::Array(Some(vec![
                RespValue::bulk(b"a".to_vec()),
                RespValue::bulk(b"b".to_vec()),
                RespValue::bulk(b"c".to_vec())
            ]))
        );
    }

    #[test]
    fn expire_and_ttl_and_persist() {
        let engine = DataEngine::new();
        exec(&engine, &["SET", "k", "v"]);
        exec(&engine, &["EXPIRE", "k", "100"]);
        match exec(&engine, &["TTL", "k"]) {
            RespValue::Integer(ttl) => assert!(ttl > 0 && ttl <= 100),
            other => panic!("unexpected {other:?}"),
        }
        exec(&engine, &["PERSIST", "k"]);
        assert_eq!(exec(&engine, &["TTL", "k"]), RespValue::Integer(-1));
    }

    #[test]
    fn del_multi_key() {
        let engine = DataEngine::new();
        exec(&engine, &["SET", "a", "1"]);
        exec(&engine, &["SET", "b", "2"]);
        assert_eq!(exec(&engine, &["DEL", "a", "b", "missing"]), RespValue::Integer(2));
    }

    #[test]
    fn flushall_clears_keyspace() {
        let engine = DataEngine::new();
        exec(&engine, &["SET", "a", "1"]);
        exec(&engine, &["SET", "b", "2"]);
        exec(&engine, &["FLUSHALL"]);
        assert_eq!(engine.dbsize(), 0);
    }

    #[test]
    fn unknown_command_returns_error() {
        let engine = DataEngine::new();
        match exec(&engine, &["NOTACOMMAND"]) {
            RespValue::Error(msg) => assert!(msg.starts_with(b"ERR unknown command")),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn sinterstore_combines_sets() {
        let engine = DataEngine::new();
        exec(&engine, &["SADD", "s1", "a", "b", "c"]);
        exec(&engine, &["SADD", "s2", "b", "c", "d"]);
        assert_eq!(exec(&engine, &["SINTERSTORE", "dest", "s1", "s2"]), RespValue::Integer(2));
    }
}
