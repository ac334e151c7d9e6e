//! Lock coordinator (spec §4.5): out-of-process, non-blocking record locks
//! with timeout diagnosis — realized here as the idiomatic async
//! equivalent spec §9 recommends ("a state machine per in-flight call with
//! explicit suspension points at 'wait for lock'") rather than a literal
//! forked child per lock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ctdb_core::tunables::LOCK_DIAGNOSTIC_INTERVAL;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Coalesces concurrent lock requests on the same key behind one
/// `tokio::sync::Mutex` per key (spec §4.5 "Coalesces requests ... one
/// child serves them all" — the async waiter queue built into the mutex
/// plays the same role without a child process).
pub struct LockCoordinator {
    keys: DashMap<Vec<u8>, Arc<Mutex<()>>>,
}

impl LockCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self { keys: DashMap::new() }
    }

    fn entry_for(&self, key: &[u8]) -> Arc<Mutex<()>> {
        self.keys.entry(key.to_vec()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Acquires the chain lock for `key`, suspending the caller. Every
    /// [`LOCK_DIAGNOSTIC_INTERVAL`] the wait is still unsatisfied, logs a
    /// diagnostic and keeps waiting indefinitely, matching "the system
    /// self-reports hangs indefinitely without failing the request."
    pub async fn acquire(&self, key: &[u8]) -> LockGuard {
        let mutex = self.entry_for(key);
        let start = Instant::now();
        let mut waited = Duration::ZERO;
        loop {
            match tokio::time::timeout(LOCK_DIAGNOSTIC_INTERVAL, mutex.clone().lock_owned()).await {
                Ok(guard) => {
                    record_acquire_latency(start.elapsed());
                    return LockGuard { _guard: guard };
                }
                Err(_) => {
                    waited += LOCK_DIAGNOSTIC_INTERVAL;
                    tracing::warn!(
                        key = %String::from_utf8_lossy(key),
                        waited_secs = waited.as_secs(),
                        "lock diagnostic: still waiting on chain lock"
                    );
                }
            }
        }
    }

    /// Non-blocking acquisition; returns `None` if the key is already
    /// locked (spec §4.6 step 3's "would block" branch).
    #[must_use]
    pub fn try_acquire(&self, key: &[u8]) -> Option<LockGuard> {
        let mutex = self.entry_for(key);
        let start = Instant::now();
        let guard = mutex.try_lock_owned().ok()?;
        record_acquire_latency(start.elapsed());
        Some(LockGuard { _guard: guard })
    }
}

impl Default for LockCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

fn record_acquire_latency(elapsed: Duration) {
    metrics::histogram!("ctdb_lock_acquire_seconds").record(elapsed.as_secs_f64());
}

/// Holds a key's chain lock until dropped.
pub struct LockGuard {
    _guard: OwnedMutexGuard<()>,
}

impl LockGuard {
    /// Produces a cheap, cloneable marker proving the lock is logically
    /// held, to pass into nested call machinery without re-locking — the
    /// async analogue of `lock_mark` (spec §4.4, §4.5 "auto_mark").
    #[must_use]
    pub fn mark(&self) -> LockMark {
        LockMark(())
    }
}

/// A marker token indicating the caller already holds the corresponding
/// chain lock. Carries no data; its only purpose is to make "I already
/// hold this lock" a type-level fact passed across an await boundary.
#[derive(Debug, Clone, Copy)]
pub struct LockMark(());

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn try_acquire_fails_while_held() {
        let coord = LockCoordinator::new();
        let guard = coord.acquire(b"k").await;
        assert!(coord.try_acquire(b"k").is_none());
        let _mark = guard.mark();
        drop(guard);
        assert!(coord.try_acquire(b"k").is_some());
    }

    #[tokio::test]
    async fn distinct_keys_do_not_contend() {
        let coord = LockCoordinator::new();
        let _a = coord.acquire(b"a").await;
        assert!(coord.try_acquire(b"b").is_some());
    }

    #[tokio::test]
    async fn acquire_waits_for_release() {
        let coord = Arc::new(LockCoordinator::new());
        let first = coord.acquire(b"k").await;
        let coord2 = coord.clone();
        let handle = tokio::spawn(async move {
            let _second = coord2.acquire(b"k").await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(first);
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    /// Uncontended acquisitions stay well under the diagnostic interval
    /// (spec §4.5): recorded here with `hdrhistogram` rather than a bare
    /// average, since the diagnostic-logging behavior cares about the tail,
    /// not the mean.
    #[tokio::test]
    async fn uncontended_acquire_latency_tail_is_bounded() {
        let mut histogram = hdrhistogram::Histogram::<u64>::new(3).unwrap();
        let coord = LockCoordinator::new();
        for i in 0..500u32 {
            let key = i.to_ne_bytes();
            let start = Instant::now();
            let _guard = coord.acquire(&key).await;
            histogram.record(start.elapsed().as_micros() as u64).unwrap();
        }
        assert!(histogram.value_at_quantile(0.99) < LOCK_DIAGNOSTIC_INTERVAL.as_micros() as u64);
    }
}
