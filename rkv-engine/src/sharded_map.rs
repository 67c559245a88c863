//! # Sharded Map
//!
//! Purpose: A concurrent hash table keyed by byte-string, with incremental,
//! cooperative resizing so no single writer ever pays for migrating the
//! whole table.
//!
//! ## Design Principles
//! 1. **Bucket == Shard**: each array slot is both the unit of locking and
//!    the unit of migration; a shard is a singly-linked chain of nodes
//!    guarded by its own `RwLock`.
//! 2. **Cooperative Rehash**: once the load factor is crossed, a bounded
//!    pool of worker threads claims shard indices off a shared atomic
//!    cursor and splits each one into the next table's two child shards.
//!    Readers and writers consult the same cursor to decide which table a
//!    key currently lives in, so lookups never block on a rehash in
//!    progress elsewhere in the table.
//! 3. **FNV-1a Hashing**: matches the reference dictionary implementation
//!    this type is grounded on; not cryptographically strong, but fast and
//!    adequate for an in-process hash table.
//!
//! Transfer takes an exclusive lock on the source shard and both
//! destination shards (rather than the reader lock the original
//! implementation uses) since nothing here guarantees, the way a language
//! with a single global scheduler tick might, that no writer can observe a
//! shard mid-split.

use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

const MIN_CAPACITY: usize = 16;
const MAX_CAPACITY: usize = 1 << 15;
const REHASH_WORKERS: usize = 4;
const LOAD_FACTOR: f64 = 0.75;

/// Rounds `hint` up to a power of two within `[MIN_CAPACITY, MAX_CAPACITY]`.
fn compute_capacity(hint: usize) -> usize {
    if hint <= MIN_CAPACITY {
        return MIN_CAPACITY;
    }
    let capacity = hint.next_power_of_two();
    capacity.min(MAX_CAPACITY)
}

const FNV_OFFSET: u32 = 2166136261;
const FNV_PRIME: u32 = 16777619;

/// FNV-1a 32-bit hash over a byte string.
pub fn fnv32(key: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET;
    for &byte in key {
        hash = hash.wrapping_mul(FNV_PRIME);
        hash ^= byte as u32;
    }
    hash
}

struct Node<V> {
    key: Vec<u8>,
    value: V,
    hash_code: u32,
    next: Option<Box<Node<V>>>,
}

struct Shard<V> {
    head: RwLock<Option<Box<Node<V>>>>,
}

impl<V> Default for Shard<V> {
    fn default() -> Self {
        Shard {
            head: RwLock::new(None),
        }
    }
}

fn make_table<V>(size: usize) -> Vec<Shard<V>> {
    (0..size).map(|_| Shard::default()).collect()
}

/// A concurrent byte-string-keyed map with incremental resizing.
///
/// `V` is the value type; the data engine instantiates this both for the
/// top-level keyspace (`V = Entity`), the TTL map (`V = Instant`), and for
/// each hash-type entity's field table (`V = Vec<u8>`).
pub struct ShardedMap<V> {
    table: RwLock<Vec<Shard<V>>>,
    next_table: Mutex<Option<Vec<Shard<V>>>>,
    count: AtomicUsize,
    /// -1 when not rehashing; otherwise the next shard index to migrate.
    rehash_index: AtomicIsize,
}

impl<V> ShardedMap<V> {
    pub fn new() -> Self {
        Self::with_capacity_hint(MIN_CAPACITY)
    }

    pub fn with_capacity_hint(hint: usize) -> Self {
        let capacity = compute_capacity(hint);
        ShardedMap {
            table: RwLock::new(make_table(capacity)),
            next_table: Mutex::new(None),
            count: AtomicUsize::new(0),
            rehash_index: AtomicIsize::new(-1),
        }
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn spread(table_len: usize, hash_code: u32) -> usize {
        (table_len - 1) & hash_code as usize
    }

    fn ensure_next_table(&self) {
        let mut next = self.next_table.lock().expect("next_table mutex poisoned");
        if next.is_some() {
            return;
        }
        let current_len = self.table.read().expect("table rwlock poisoned").len();
        let mut next_len = current_len.saturating_mul(2);
        if next_len > MAX_CAPACITY || next_len == 0 {
            next_len = MAX_CAPACITY;
        }
        if next_len <= current_len {
            // Already at the capacity ceiling; abandon the rehash attempt.
            self.rehash_index.store(-1, Ordering::SeqCst);
            return;
        }
        *next = Some(make_table(next_len));
    }

    /// Routes a hash code to the shard that currently owns it, accounting
    /// for an in-progress rehash.
    fn route(&self, hash_code: u32, current: &[Shard<V>]) -> RouteTarget {
        let index = Self::spread(current.len(), hash_code);
        let rehash_index = self.rehash_index.load(Ordering::SeqCst);
        if rehash_index >= 0 && rehash_index as usize >= index {
            self.ensure_next_table();
            RouteTarget::Next(hash_code)
        } else {
            RouteTarget::Current(index)
        }
    }

    /// Resolves the shard owning `hash_code` and runs `f` against its chain
    /// under a write lock. Retries if a rehash finishes between routing and
    /// locking and leaves `next_table` momentarily empty.
    fn with_shard_mut<R>(&self, hash_code: u32, f: impl Fn(&mut Option<Box<Node<V>>>) -> R) -> R {
        loop {
            let current = self.table.read().expect("table rwlock poisoned");
            match self.route(hash_code, &current) {
                RouteTarget::Current(index) => {
                    let mut head = current[index].head.write().expect("shard rwlock poisoned");
                    return f(&mut head);
                }
                RouteTarget::Next(hash_code) => {
                    drop(current);
                    let next = self.next_table.lock().expect("next_table mutex poisoned");
                    let Some(table) = next.as_ref() else {
                        continue; // resize just finished; re-route against the new current table
                    };
                    let index = Self::spread(table.len(), hash_code);
                    let mut head = table[index].head.write().expect("shard rwlock poisoned");
                    return f(&mut head);
                }
            }
        }
    }

    fn with_shard_ref<R>(&self, hash_code: u32, f: impl Fn(&Option<Box<Node<V>>>) -> R) -> R {
        loop {
            let current = self.table.read().expect("table rwlock poisoned");
            match self.route(hash_code, &current) {
                RouteTarget::Current(index) => {
                    let head = current[index].head.read().expect("shard rwlock poisoned");
                    return f(&head);
                }
                RouteTarget::Next(hash_code) => {
                    drop(current);
                    let next = self.next_table.lock().expect("next_table mutex poisoned");
                    let Some(table) = next.as_ref() else {
                        continue;
                    };
                    let index = Self::spread(table.len(), hash_code);
                    let head = table[index].head.read().expect("shard rwlock poisoned");
                    return f(&head);
                }
            }
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<V>
    where
        V: Clone,
    {
        let hash_code = fnv32(key);
        self.with_shard_ref(hash_code, |head| walk_get(head, key))
    }

    pub fn contains_key(&self, key: &[u8]) -> bool
    where
        V: Clone,
    {
        self.get(key).is_some()
    }

    /// Inserts or overwrites `key`. Returns `true` when the key was new.
    pub fn put(&self, key: Vec<u8>, value: V) -> bool
    where
        V: Clone,
    {
        let hash_code = fnv32(&key);
        let inserted = self.with_shard_mut(hash_code, |head| {
            walk_put(head, key.clone(), value.clone(), hash_code)
        });
        if inserted {
            self.after_insert();
        }
        inserted
    }

    /// Inserts only if absent. Returns `true` when the key was newly set.
    pub fn put_if_absent(&self, key: Vec<u8>, value: V) -> bool
    where
        V: Clone,
    {
        let hash_code = fnv32(&key);
        let inserted = self.with_shard_mut(hash_code, |head| {
            walk_put_if_absent(head, key.clone(), value.clone(), hash_code)
        });
        if inserted {
            self.after_insert();
        }
        inserted
    }

    /// Updates only if present. Returns `true` when a value was replaced.
    pub fn put_if_exists(&self, key: &[u8], value: V) -> bool
    where
        V: Clone,
    {
        let hash_code = fnv32(key);
        self.with_shard_mut(hash_code, |head| {
            walk_put_if_exists(head, key, value.clone())
        })
    }

    /// Removes `key`. Returns `true` when a value was removed.
    pub fn remove(&self, key: &[u8]) -> bool {
        let hash_code = fnv32(key);
        let removed = self.with_shard_mut(hash_code, |head| walk_remove(head, key));
        if removed {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Visits every live entry. Takes a read lock on each shard of whichever
    /// table is authoritative at call time; not a point-in-time snapshot
    /// under concurrent writes, which is acceptable for the callers (KEYS,
    /// DBSIZE, AOF rewrite) that use it.
    pub fn for_each<F: FnMut(&[u8], &V)>(&self, mut visitor: F) {
        let current = self.table.read().expect("table rwlock poisoned");
        for shard in current.iter() {
            let head = shard.head.read().expect("shard rwlock poisoned");
            let mut node = head.as_deref();
            while let Some(n) = node {
                visitor(&n.key, &n.value);
                node = n.next.as_deref();
            }
        }
        drop(current);
        if let Some(next) = self.next_table.lock().expect("next_table mutex poisoned").as_ref() {
            for shard in next.iter() {
                let head = shard.head.read().expect("shard rwlock poisoned");
                let mut node = head.as_deref();
                while let Some(n) = node {
                    visitor(&n.key, &n.value);
                    node = n.next.as_deref();
                }
            }
        }
    }

    fn after_insert(&self) {
        let count = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        let table_len = self.table.read().expect("table rwlock poisoned").len();
        if (count as f64) >= (table_len as f64) * LOAD_FACTOR {
            self.maybe_resize();
        }
    }

    fn maybe_resize(&self) {
        if self
            .rehash_index
            .compare_exchange(-1, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return; // another thread is already driving the resize
        }
        self.ensure_next_table();
        if self.next_table.lock().expect("next_table mutex poisoned").is_none() {
            // At capacity ceiling; ensure_next_table already reset the cursor.
            return;
        }

        let source_len = self.table.read().expect("table rwlock poisoned").len();
        std::thread::scope(|scope| {
            for _ in 0..REHASH_WORKERS {
                scope.spawn(|| self.transfer_worker(source_len));
            }
        });

        let mut next = self.next_table.lock().expect("next_table mutex poisoned");
        let new_table = next.take().expect("next table present after rehash");
        drop(next);
        *self.table.write().expect("table rwlock poisoned") = new_table;
        self.rehash_index.store(-1, Ordering::SeqCst);
    }

    fn transfer_worker(&self, source_len: usize) {
        loop {
            let index = self.rehash_index.fetch_add(1, Ordering::SeqCst);
            if index < 0 || index as usize >= source_len {
                return;
            }
            let index = index as usize;
            let current = self.table.read().expect("table rwlock poisoned");
            let mut source_head = current[index]
                .head
                .write()
                .expect("shard rwlock poisoned");
            let chain = source_head.take();
            drop(source_head);
            drop(current);

            let next = self.next_table.lock().expect("next_table mutex poisoned");
            let next_table = next.as_ref().expect("next table missing mid-rehash");
            let sibling = index + source_len;

            let mut low = Vec::new();
            let mut high = Vec::new();
            let mut remaining = chain;
            while let Some(mut node) = remaining {
                remaining = node.next.take();
                if node.hash_code & (source_len as u32) != 0 {
                    high.push(node);
                } else {
                    low.push(node);
                }
            }

            *next_table[index].head.write().expect("shard rwlock poisoned") = chain_from(low);
            *next_table[sibling]
                .head
                .write()
                .expect("shard rwlock poisoned") = chain_from(high);
        }
    }
}

impl<V> Default for ShardedMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> Clone for ShardedMap<V> {
    /// Deep-clones every live entry into a fresh map. Used for hash-type
    /// entity snapshots (cluster transaction undo images); not a point-in-
    /// time snapshot under concurrent writes, same caveat as `for_each`.
    fn clone(&self) -> Self {
        let cloned = ShardedMap::with_capacity_hint(self.len().max(MIN_CAPACITY));
        self.for_each(|key, value| {
            cloned.put(key.to_vec(), value.clone());
        });
        cloned
    }
}

enum RouteTarget {
    Current(usize),
    Next(u32),
}

/// Rebuilds a singly-linked chain from nodes collected in FIFO order,
/// preserving the original iteration order the way `transfer` does.
fn chain_from<V>(mut nodes: Vec<Box<Node<V>>>) -> Option<Box<Node<V>>> {
    let mut head = None;
    while let Some(mut node) = nodes.pop() {
        node.next = head.take();
        head = Some(node);
    }
    head
}

fn walk_get<V: Clone>(head: &Option<Box<Node<V>>>, key: &[u8]) -> Option<V> {
    let mut node = head.as_deref();
    while let Some(n) = node {
        if n.key == key {
            return Some(n.value.clone());
        }
        node = n.next.as_deref();
    }
    None
}

fn walk_put<V>(head: &mut Option<Box<Node<V>>>, key: Vec<u8>, value: V, hash_code: u32) -> bool {
    let mut cursor = head;
    loop {
        match cursor {
            None => {
                *cursor = Some(Box::new(Node {
                    key,
                    value,
                    hash_code,
                    next: None,
                }));
                return true;
            }
            Some(node) if node.key == key => {
                node.value = value;
                return false;
            }
            Some(node) => cursor = &mut node.next,
        }
    }
}

fn walk_put_if_absent<V>(
    head: &mut Option<Box<Node<V>>>,
    key: Vec<u8>,
    value: V,
    hash_code: u32,
) -> bool {
    let mut cursor = head;
    loop {
        match cursor {
            None => {
                *cursor = Some(Box::new(Node {
                    key,
                    value,
                    hash_code,
                    next: None,
                }));
                return true;
            }
            Some(node) if node.key == key => return false,
            Some(node) => cursor = &mut node.next,
        }
    }
}

fn walk_put_if_exists<V>(head: &mut Option<Box<Node<V>>>, key: &[u8], value: V) -> bool {
    let mut node = head.as_deref_mut();
    let mut value = Some(value);
    while let Some(n) = node {
        if n.key == key {
            n.value = value.take().unwrap();
            return true;
        }
        node = n.next.as_deref_mut();
    }
    false
}

fn walk_remove<V>(head: &mut Option<Box<Node<V>>>, key: &[u8]) -> bool {
    let mut cursor = head;
    loop {
        match cursor {
            None => return false,
            Some(node) if node.key == key => {
                *cursor = node.next.take();
                return true;
            }
            Some(node) => cursor = &mut node.next,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_remove_roundtrip() {
        let map: ShardedMap<i32> = ShardedMap::new();
        assert!(map.put(b"a".to_vec(), 1));
        assert!(!map.put(b"a".to_vec(), 2));
        assert_eq!(map.get(b"a"), Some(2));
        assert!(map.remove(b"a"));
        assert_eq!(map.get(b"a"), None);
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn put_if_absent_and_exists() {
        let map: ShardedMap<i32> = ShardedMap::new();
        assert!(map.put_if_absent(b"k".to_vec(), 1));
        assert!(!map.put_if_absent(b"k".to_vec(), 2));
        assert_eq!(map.get(b"k"), Some(1));

        assert!(map.put_if_exists(b"k", 5));
        assert_eq!(map.get(b"k"), Some(5));
        assert!(!map.put_if_exists(b"missing", 5));
    }

    #[test]
    fn grows_past_initial_capacity() {
        let map: ShardedMap<i32> = ShardedMap::new();
        for i in 0..5000 {
            let key = format!("key-{i}").into_bytes();
            map.put(key, i);
        }
        assert_eq!(map.len(), 5000);
        for i in 0..5000 {
            let key = format!("key-{i}").into_bytes();
            assert_eq!(map.get(&key), Some(i));
        }
    }

    #[test]
    fn for_each_visits_all_entries() {
        let map: ShardedMap<i32> = ShardedMap::new();
        for i in 0..200 {
            map.put(format!("k{i}").into_bytes(), i);
        }
        let mut seen = 0;
        map.for_each(|_, _| seen += 1);
        assert_eq!(seen, 200);
    }

    #[test]
    fn concurrent_inserts_preserve_count() {
        use std::sync::Arc;
        let map = Arc::new(ShardedMap::<i32>::new());
        std::thread::scope(|scope| {
            for t in 0..8 {
                let map = map.clone();
                scope.spawn(move || {
                    for i in 0..500 {
                        let key = format!("t{t}-{i}").into_bytes();
                        map.put(key, i);
                    }
                });
            }
        });
        assert_eq!(map.len(), 8 * 500);
    }
}
