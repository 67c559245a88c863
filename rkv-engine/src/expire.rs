//! # Periodic Expirer
//!
//! Purpose: A single background thread that incrementally sweeps the TTL map
//! so keys past their deadline are reclaimed even if nothing ever reads them
//! again (lazy, access-time expiration alone would leak memory for
//! write-once, never-read keys).
//!
//! ## Design Principles
//! 1. **One Thread, Bounded Work Per Tick**: each tick reaps a capped number
//!    of expired keys rather than scanning the whole TTL map, so a huge
//!    keyspace with many simultaneous expirations cannot stall other work.
//! 2. **No AOF Emission**: an expiry is not logged to the AOF. Replay
//!    re-derives expiration from the `PEXPIREAT` record already written when
//!    the TTL was set, so logging the removal itself would be redundant.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::engine::DataEngine;

const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_BUDGET: usize = 256;

/// Owns the background expiration thread; dropping it stops the sweep.
pub struct Expirer {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Expirer {
    pub fn start(engine: Arc<DataEngine>) -> Self {
        Self::start_with(engine, DEFAULT_INTERVAL, DEFAULT_BUDGET)
    }

    pub fn start_with(engine: Arc<DataEngine>, interval: Duration, budget: usize) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name("rkv-expirer".into())
            .spawn(move || {
                while !thread_stop.load(Ordering::Relaxed) {
                    std::thread::sleep(interval);
                    let reaped = engine.reap_expired(budget);
                    if reaped > 0 {
                        tracing::debug!(reaped, "periodic expirer reclaimed keys");
                    }
                }
            })
            .expect("failed to spawn rkv-expirer thread");

        Expirer {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for Expirer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reaps_expired_keys_in_background() {
        let engine = Arc::new(DataEngine::new());
        engine.exec(0, &[b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()]);
        engine.exec(0, &[b"PEXPIRE".to_vec(), b"k".to_vec(), b"10".to_vec()]);

        let _expirer = Expirer::start_with(engine.clone(), Duration::from_millis(20), 100);
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(engine.dbsize(), 0);
    }
}
