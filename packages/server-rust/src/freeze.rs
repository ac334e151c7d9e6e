//! Per-priority whole-database freeze/thaw (spec §4.7).
//!
//! Freezing a priority level blocks every call against any database at
//! that priority until thawed. Realized as a write lock held for the
//! duration of the freeze: the call path takes a read guard before
//! touching a database, so an open write guard (the freeze) excludes all
//! of them without the daemon needing to track in-flight calls itself.
//! Recovery freezes every priority before pulling records (spec §4.8 step
//! 1) and thaws them all once the new vnn_map is installed (step 7).

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Holds the write guard for one frozen priority level. Dropping it thaws.
pub struct FreezeHandle {
    _guard: OwnedRwLockWriteGuard<()>,
}

pub struct FreezeManager {
    locks: Vec<Arc<RwLock<()>>>,
    frozen: DashMap<u32, FreezeHandle>,
}

impl FreezeManager {
    #[must_use]
    pub fn new(num_priorities: u32) -> Self {
        let locks = (0..num_priorities).map(|_| Arc::new(RwLock::new(()))).collect();
        Self { locks, frozen: DashMap::new() }
    }

    fn lock_for(&self, priority: u32) -> Arc<RwLock<()>> {
        self.locks[(priority - 1) as usize].clone()
    }

    /// Blocks until `priority` is not frozen, then holds a read guard for
    /// the duration of one call (spec §4.7 "calls against a frozen
    /// priority are queued, not failed").
    pub async fn guard_call(&self, priority: u32) -> OwnedRwLockReadGuard<()> {
        self.lock_for(priority).read_owned().await
    }

    /// Freezes `priority`. Idempotent: freezing an already-frozen priority
    /// is a no-op and returns `false` (spec §4.7 "freeze is idempotent").
    pub async fn freeze(&self, priority: u32) -> bool {
        if self.frozen.contains_key(&priority) {
            return false;
        }
        let guard = self.lock_for(priority).write_owned().await;
        match self.frozen.entry(priority) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(FreezeHandle { _guard: guard });
                true
            }
        }
    }

    /// Thaws `priority`. Returns `false` if it was not frozen.
    pub fn thaw(&self, priority: u32) -> bool {
        self.frozen.remove(&priority).is_some()
    }

    #[must_use]
    pub fn is_frozen(&self, priority: u32) -> bool {
        self.frozen.contains_key(&priority)
    }

    /// Freezes every priority level, for cluster-wide recovery.
    pub async fn freeze_all(&self) {
        for priority in 1..=self.locks.len() as u32 {
            self.freeze(priority).await;
        }
    }

    pub fn thaw_all(&self) {
        self.frozen.clear();
    }
}
