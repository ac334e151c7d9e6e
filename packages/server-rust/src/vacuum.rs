//! Background vacuum: finds bare-header records this node is dmaster for
//! and reclaims them once every connected node agrees none of them holds a
//! conflicting claim (spec §4.9 "broadcast-verify-delete").
//!
//! The broadcast-verify round trip is abstracted behind [`VacuumTransport`],
//! mirroring [`crate::recovery::RecoverySource`]: [`LocalVacuumTransport`] is
//! the single-node reference, since a lone node can never be contradicted by
//! a peer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ctdb_core::node::Pnn;
use ctdb_core::tunables::Tunables;
use tracing::{debug, info};

use crate::db::Databases;

#[async_trait]
pub trait VacuumTransport: Send + Sync {
    /// Asks every connected node whether `key` in `db_id` is safe to delete.
    /// Returns `true` only if no node objects.
    async fn broadcast_verify_delete(&self, db_id: u32, key: &[u8]) -> bool;
}

/// Single-node reference transport: nothing can contradict deletion.
pub struct LocalVacuumTransport;

#[async_trait]
impl VacuumTransport for LocalVacuumTransport {
    async fn broadcast_verify_delete(&self, _db_id: u32, _key: &[u8]) -> bool {
        true
    }
}

pub struct VacuumWorker {
    databases: Arc<Databases>,
    transport: Arc<dyn VacuumTransport>,
    tunables: Tunables,
    self_pnn: Pnn,
}

impl VacuumWorker {
    #[must_use]
    pub fn new(databases: Arc<Databases>, transport: Arc<dyn VacuumTransport>, tunables: Tunables, self_pnn: Pnn) -> Self {
        Self { databases, transport, tunables, self_pnn }
    }

    /// Runs forever on `interval`, driven by the daemon's own task set.
    pub async fn run_loop(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.run_once().await;
        }
    }

    /// One traversal/reclaim pass over every attached database.
    pub async fn run_once(&self) {
        for db in self.databases.all() {
            let candidates: Vec<Vec<u8>> = db
                .store
                .traverse()
                .into_iter()
                .filter(|(_, header, value)| header.dmaster == self.self_pnn && value.is_empty() && !header.is_invalid())
                .map(|(key, _, _)| key)
                .collect();

            if candidates.len() as u64 > self.tunables.vacuum_repack_threshold {
                info!(db = db.id, candidates = candidates.len(), "vacuum freelist over repack threshold");
                metrics::counter!("ctdb_vacuum_repack_triggered_total").increment(1);
            }

            let mut reclaimed = 0u64;
            for key in candidates {
                if self.transport.broadcast_verify_delete(db.id, &key).await {
                    db.store.delete(&key);
                    reclaimed += 1;
                } else {
                    debug!(db = db.id, "vacuum candidate vetoed by a peer");
                }
            }
            if reclaimed > 0 {
                metrics::counter!("ctdb_vacuum_reclaimed_total").increment(reclaimed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use ctdb_core::record::RecordHeader;

    use super::*;
    use crate::db::Database;

    struct VetoTransport(AtomicBool);

    #[async_trait]
    impl VacuumTransport for VetoTransport {
        async fn broadcast_verify_delete(&self, _db_id: u32, _key: &[u8]) -> bool {
            !self.0.load(Ordering::SeqCst)
        }
    }

    fn databases_with_candidate() -> Arc<Databases> {
        let dbs = Arc::new(Databases::new());
        let db = Database::new(1, "test.tdb", false, 1, "/tmp/test.tdb".into());
        db.store.store(b"k", RecordHeader { dmaster: 0, rsn: 1, ..RecordHeader::invalid() }, Vec::new());
        dbs.attach(db);
        dbs
    }

    #[tokio::test]
    async fn reclaims_bare_header_owned_by_self() {
        let dbs = databases_with_candidate();
        let worker = VacuumWorker::new(dbs.clone(), Arc::new(LocalVacuumTransport), Tunables::default(), 0);
        worker.run_once().await;
        assert!(dbs.get(1).unwrap().store.fetch(b"k").0.is_invalid());
    }

    #[tokio::test]
    async fn a_peer_veto_preserves_the_record() {
        let dbs = databases_with_candidate();
        let transport = Arc::new(VetoTransport(AtomicBool::new(true)));
        let worker = VacuumWorker::new(dbs.clone(), transport, Tunables::default(), 0);
        worker.run_once().await;
        assert!(!dbs.get(1).unwrap().store.fetch(b"k").0.is_invalid());
    }

    #[tokio::test]
    async fn records_owned_by_another_dmaster_are_left_alone() {
        let dbs = Arc::new(Databases::new());
        let db = Database::new(1, "test.tdb", false, 1, "/tmp/test.tdb".into());
        db.store.store(b"k", RecordHeader { dmaster: 7, rsn: 1, ..RecordHeader::invalid() }, Vec::new());
        dbs.attach(db);

        let worker = VacuumWorker::new(dbs.clone(), Arc::new(LocalVacuumTransport), Tunables::default(), 0);
        worker.run_once().await;
        assert_eq!(dbs.get(1).unwrap().store.fetch(b"k").0.dmaster, 7);
    }
}
