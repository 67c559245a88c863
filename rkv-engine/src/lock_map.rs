//! # Lock Map
//!
//! Purpose: Guard multi-step read-modify-write operations on the keyspace
//! with a small, fixed pool of read-write locks instead of one lock per key,
//! while still letting unrelated keys proceed concurrently.
//!
//! ## Design Principles
//! 1. **Fixed Fan-Out**: a constant number of locks (128 by default) bounds
//!    memory use regardless of keyspace size; collisions just mean two
//!    unrelated keys occasionally serialize against each other.
//! 2. **Deadlock-Free Multi-Key Locking**: acquiring locks for several keys
//!    at once always sorts the selected slot indices first, so any two
//!    callers that need an overlapping set of slots always take them in the
//!    same order.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::sharded_map::fnv32;

const DEFAULT_LOCK_COUNT: usize = 128;

/// A fixed pool of read-write locks, selected by hashing a key.
pub struct LockMap {
    locks: Vec<RwLock<()>>,
}

impl LockMap {
    pub fn new() -> Self {
        Self::with_lock_count(DEFAULT_LOCK_COUNT)
    }

    pub fn with_lock_count(count: usize) -> Self {
        let count = count.max(1);
        LockMap {
            locks: (0..count).map(|_| RwLock::new(())).collect(),
        }
    }

    fn slot_for(&self, key: &[u8]) -> usize {
        fnv32(key) as usize % self.locks.len()
    }

    /// Distinct, sorted slot indices covering every key in `keys`. Sorting
    /// fixes a global lock-acquisition order so concurrent multi-key
    /// operations cannot deadlock on each other.
    fn slots_for<'a>(&self, keys: impl IntoIterator<Item = &'a [u8]>) -> Vec<usize> {
        let mut slots: Vec<usize> = keys.into_iter().map(|k| self.slot_for(k)).collect();
        slots.sort_unstable();
        slots.dedup();
        slots
    }

    pub fn read(&self, key: &[u8]) -> RwLockReadGuard<'_, ()> {
        self.locks[self.slot_for(key)].read().expect("lock map poisoned")
    }

    pub fn write(&self, key: &[u8]) -> RwLockWriteGuard<'_, ()> {
        self.locks[self.slot_for(key)].write().expect("lock map poisoned")
    }

    /// Acquires write locks for every distinct slot covering `keys`, in
    /// ascending slot order. The returned guards must be held for the
    /// duration of the multi-key operation.
    pub fn write_many<'a>(&'a self, keys: impl IntoIterator<Item = &'a [u8]>) -> Vec<RwLockWriteGuard<'a, ()>> {
        self.slots_for(keys)
            .into_iter()
            .map(|slot| self.locks[slot].write().expect("lock map poisoned"))
            .collect()
    }

    pub fn read_many<'a>(&'a self, keys: impl IntoIterator<Item = &'a [u8]>) -> Vec<RwLockReadGuard<'a, ()>> {
        self.slots_for(keys)
            .into_iter()
            .map(|slot| self.locks[slot].read().expect("lock map poisoned"))
            .collect()
    }
}

impl Default for LockMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_maps_to_same_slot() {
        let locks = LockMap::new();
        assert_eq!(locks.slot_for(b"same"), locks.slot_for(b"same"));
    }

    #[test]
    fn multi_key_lock_order_is_sorted() {
        let locks = LockMap::new();
        let keys: Vec<&[u8]> = vec![b"zzz", b"a", b"middle"];
        let slots = locks.slots_for(keys);
        let mut sorted = slots.clone();
        sorted.sort_unstable();
        assert_eq!(slots, sorted);
    }

    #[test]
    fn write_many_deduplicates_colliding_keys() {
        let locks = LockMap::with_lock_count(1);
        let keys: Vec<&[u8]> = vec![b"a", b"b", b"c"];
        let guards = locks.write_many(keys);
        assert_eq!(guards.len(), 1);
    }
}
