//! Local store façade: per-database chain-locked fetch/store, transactions,
//! and traversal (spec §4.4).
//!
//! The backing byte-keyed store itself is an external collaborator per the
//! spec's own non-goals ("the local record store ... the core consumes
//! only its documented operations"); this module is that documented
//! surface, realized here as an in-memory map since the on-disk engine is
//! out of scope.

pub mod lock;

use std::sync::Mutex as StdMutex;

use ctdb_core::node::INVALID_PNN;
use ctdb_core::record::RecordHeader;
use dashmap::DashMap;

pub use lock::{LockCoordinator, LockGuard};

/// A single database's local records, keyed by raw byte key.
pub struct LocalStore {
    records: DashMap<Vec<u8>, (RecordHeader, Vec<u8>)>,
    locks: LockCoordinator,
    /// `Some(generation)` while a cluster-wide transaction is open on this
    /// database (spec §4.8 step 3, §4.9 "single database transaction").
    transaction: StdMutex<Option<u32>>,
}

impl LocalStore {
    #[must_use]
    pub fn new() -> Self {
        Self { records: DashMap::new(), locks: LockCoordinator::new(), transaction: StdMutex::new(None) }
    }

    /// Chain-locks `key`. Per spec §4.5, this is realized as an async
    /// suspension point rather than a blocking syscall.
    pub async fn lock(&self, key: &[u8]) -> LockGuard {
        self.locks.acquire(key).await
    }

    /// Non-blocking variant: returns `None` immediately if the key is
    /// already locked, for the REQ_CALL "would block → defer" branch
    /// (spec §4.6 step 3) when the caller prefers to requeue explicitly
    /// rather than await.
    #[must_use]
    pub fn try_lock(&self, key: &[u8]) -> Option<LockGuard> {
        self.locks.try_acquire(key)
    }

    /// Fetch of a missing key returns an empty value and an invalid header,
    /// so "absent" and "present" share one code path (spec §4.4).
    #[must_use]
    pub fn fetch(&self, key: &[u8]) -> (RecordHeader, Vec<u8>) {
        self.records
            .get(key)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| (RecordHeader::invalid(), Vec::new()))
    }

    /// Stores `(header, value)`. An empty value is not deleted outright —
    /// its header is preserved for migration purposes and the key is left
    /// for vacuum to reclaim later (spec §4.4).
    pub fn store(&self, key: &[u8], header: RecordHeader, value: Vec<u8>) {
        self.records.insert(key.to_vec(), (header, value));
    }

    /// Unconditional local delete, used by vacuum after re-verification
    /// (spec §4.9) and by recovery's wipe step.
    pub fn delete(&self, key: &[u8]) {
        self.records.remove(key);
    }

    pub fn wipe_all(&self) {
        self.records.clear();
    }

    /// A full point-in-time copy of every (key, header, value) triple, for
    /// recovery's pull step and vacuum's traversal.
    #[must_use]
    pub fn traverse(&self) -> Vec<(Vec<u8>, RecordHeader, Vec<u8>)> {
        self.records.iter().map(|e| (e.key().clone(), e.value().0, e.value().1.clone())).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn transaction_start(&self, generation: u32) {
        *self.transaction.lock().unwrap() = Some(generation);
    }

    pub fn transaction_cancel(&self) {
        *self.transaction.lock().unwrap() = None;
    }

    /// Commits only if the transaction is still open under `generation`; a
    /// stale wipe/commit after a further recovery is rejected (spec §4.8
    /// step 4c).
    #[must_use]
    pub fn transaction_commit(&self, generation: u32) -> bool {
        let mut guard = self.transaction.lock().unwrap();
        if *guard == Some(generation) {
            *guard = None;
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.transaction.lock().unwrap().is_some()
    }

    /// Whether a record is a vacuum candidate: a bare header (empty value,
    /// dmaster known) (spec §4.9).
    #[must_use]
    pub fn is_vacuum_candidate(key_value: &(RecordHeader, Vec<u8>)) -> bool {
        key_value.1.is_empty() && key_value.0.dmaster != INVALID_PNN
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}
