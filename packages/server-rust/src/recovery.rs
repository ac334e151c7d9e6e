//! Cluster-wide recovery (spec §4.8): freeze, elect a generation, pull every
//! node's copy of each database, merge by highest rsn, push the merged set
//! back out, install the new vnn_map, thaw.
//!
//! Step 3 ("pull") and step 5 ("push") are the only steps that genuinely
//! need the network; they are abstracted behind [`RecoverySource`] so this
//! module owns the merge/transaction/install sequencing regardless of how
//! peer databases are actually fetched. [`LocalRecoverySource`] is the
//! single-node-cluster implementation: every "pull" is just this node's own
//! store, since there is no peer to disagree with.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ctdb_core::record::RecordHeader;
use ctdb_core::vnn::VnnMap;
use ctdb_core::CtdbError;
use tracing::info;

use crate::call::CallEngine;
use crate::db::Databases;
use crate::freeze::FreezeManager;
use crate::node_table::NodeTable;
use crate::vnn_state::VnnMapState;

const MODE_NORMAL: u32 = 0;
const MODE_RECOVERY: u32 = 1;

/// `RECMODE` as surfaced by the `getrecmode`/`setrecmode` controls (spec
/// §4.8, §4.10).
pub struct RecoveryModeFlag(AtomicU32);

impl RecoveryModeFlag {
    #[must_use]
    pub fn new() -> Self {
        Self(AtomicU32::new(MODE_NORMAL))
    }

    #[must_use]
    pub fn is_recovery(&self) -> bool {
        self.0.load(Ordering::Acquire) == MODE_RECOVERY
    }

    fn set_recovery(&self) {
        self.0.store(MODE_RECOVERY, Ordering::Release);
    }

    fn set_normal(&self) {
        self.0.store(MODE_NORMAL, Ordering::Release);
    }
}

impl Default for RecoveryModeFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Pulls and pushes one database's full record set during recovery.
#[async_trait]
pub trait RecoverySource: Send + Sync {
    async fn pull(&self, db_id: u32) -> Vec<(Vec<u8>, RecordHeader, Vec<u8>)>;
    async fn push(&self, db_id: u32, records: &[(Vec<u8>, RecordHeader, Vec<u8>)]);
}

/// The single-node reference source: pulls from and pushes to this node's
/// own store only. A multi-node deployment replaces this with an
/// implementation that fans the same calls out over the `PullDb`/`PushDb`
/// controls to every connected peer.
pub struct LocalRecoverySource {
    databases: Arc<Databases>,
}

impl LocalRecoverySource {
    #[must_use]
    pub fn new(databases: Arc<Databases>) -> Self {
        Self { databases }
    }
}

#[async_trait]
impl RecoverySource for LocalRecoverySource {
    async fn pull(&self, db_id: u32) -> Vec<(Vec<u8>, RecordHeader, Vec<u8>)> {
        self.databases.get(db_id).map(|db| db.store.traverse()).unwrap_or_default()
    }

    async fn push(&self, db_id: u32, records: &[(Vec<u8>, RecordHeader, Vec<u8>)]) {
        if let Some(db) = self.databases.get(db_id) {
            db.store.wipe_all();
            for (key, header, value) in records {
                db.store.store(key, *header, value.clone());
            }
        }
    }
}

/// Notified once recovery completes, standing in for the `recovered`
/// eventscript (spec §4.8 step 7, §9 "eventscripts are out of core scope
/// but recovery completion is an observable event").
pub trait RecoveryObserver: Send + Sync {
    fn on_recovered(&self, generation: u32);
}

/// Keeps the highest-rsn copy of each key across every node's pulled
/// records, ties broken by dmaster, and a deleted (empty-value) copy
/// forgotten whenever any other copy of the key is still live (spec §4.8
/// step 3 "merge by highest rsn").
#[must_use]
pub fn merge_by_highest_rsn(
    records: Vec<(Vec<u8>, RecordHeader, Vec<u8>)>,
) -> Vec<(Vec<u8>, RecordHeader, Vec<u8>)> {
    let mut by_key: HashMap<Vec<u8>, Vec<(RecordHeader, Vec<u8>)>> = HashMap::new();
    for (key, header, value) in records {
        by_key.entry(key).or_default().push((header, value));
    }

    by_key
        .into_iter()
        .map(|(key, mut copies)| {
            let any_live = copies.iter().any(|(_, value)| !value.is_empty());
            if any_live {
                copies.retain(|(_, value)| !value.is_empty());
            }
            let (header, value) = copies
                .into_iter()
                .max_by(|(a, _), (b, _)| a.rsn.cmp(&b.rsn).then(a.dmaster.cmp(&b.dmaster)))
                .expect("at least one copy per key");
            (key, header, value)
        })
        .collect()
}

pub struct RecoveryCoordinator {
    vnn: Arc<VnnMapState>,
    nodes: Arc<NodeTable>,
    databases: Arc<Databases>,
    freeze: Arc<FreezeManager>,
    call_engine: Arc<CallEngine>,
    source: Arc<dyn RecoverySource>,
    observer: Option<Arc<dyn RecoveryObserver>>,
    mode: RecoveryModeFlag,
}

impl RecoveryCoordinator {
    #[must_use]
    pub fn new(
        vnn: Arc<VnnMapState>,
        nodes: Arc<NodeTable>,
        databases: Arc<Databases>,
        freeze: Arc<FreezeManager>,
        call_engine: Arc<CallEngine>,
        source: Arc<dyn RecoverySource>,
        observer: Option<Arc<dyn RecoveryObserver>>,
    ) -> Self {
        Self { vnn, nodes, databases, freeze, call_engine, source, observer, mode: RecoveryModeFlag::new() }
    }

    #[must_use]
    pub fn is_recovery_active(&self) -> bool {
        self.mode.is_recovery()
    }

    /// Runs one full recovery pass (spec §4.8 steps 1–7) and returns the
    /// newly elected generation.
    pub async fn run_recovery(&self) -> Result<u32, CtdbError> {
        info!("recovery starting");
        self.mode.set_recovery();
        self.freeze.freeze_all().await;

        let current_generation = self.vnn.generation();
        let new_generation = VnnMap::next_generation(current_generation);
        let connected = self.nodes.connected_pnns();
        if connected.is_empty() {
            self.mode.set_normal();
            self.freeze.thaw_all();
            return Err(CtdbError::Transient("no connected nodes to elect a vnn_map over".into()));
        }
        let new_map = VnnMap::new(new_generation, (*connected).clone());

        for db in self.databases.all() {
            db.store.transaction_start(new_generation);

            let pulled = self.source.pull(db.id).await;
            let merged = merge_by_highest_rsn(pulled);
            let assigned: Vec<_> = merged
                .into_iter()
                .map(|(key, mut header, value)| {
                    if let Some(lmaster) = new_map.lmaster_for_key(&key) {
                        header.dmaster = lmaster;
                    }
                    (key, header, value)
                })
                .collect();

            self.source.push(db.id, &assigned).await;

            if !db.store.transaction_commit(new_generation) {
                return Err(CtdbError::Transient(format!(
                    "recovery transaction for db {} superseded before commit",
                    db.id
                )));
            }
        }

        self.vnn.install(new_map);
        self.freeze.thaw_all();
        self.mode.set_normal();
        self.call_engine.resend_all_on_recovery();

        if let Some(observer) = &self.observer {
            observer.on_recovered(new_generation);
        }
        info!(generation = new_generation, "recovery complete");
        Ok(new_generation)
    }
}

#[cfg(test)]
mod tests {
    use ctdb_core::node::Node;
    use ctdb_core::tunables::Tunables;

    use super::*;
    use crate::db::Database;
    use crate::transport::PeerLinks;

    fn coordinator() -> (Arc<RecoveryCoordinator>, Arc<Databases>) {
        let databases = Arc::new(Databases::new());
        let db = Database::new(1, "test.tdb", false, 1, "/tmp/test.tdb".into());
        databases.attach(db);

        let nodes = Arc::new(NodeTable::new());
        nodes.insert(Node::new(0, "a"));

        let vnn = Arc::new(VnnMapState::new(VnnMap::uninitialized()));
        let freeze = Arc::new(FreezeManager::new(3));
        let links = Arc::new(PeerLinks::new(100));
        let call_engine = Arc::new(CallEngine::new(databases.clone(), vnn.clone(), links, Tunables::default(), 0, freeze.clone()));
        let source: Arc<dyn RecoverySource> = Arc::new(LocalRecoverySource::new(databases.clone()));

        let coordinator =
            Arc::new(RecoveryCoordinator::new(vnn, nodes, databases.clone(), freeze, call_engine, source, None));
        (coordinator, databases)
    }

    #[tokio::test]
    async fn recovery_elects_a_generation_and_installs_the_map() {
        let (coordinator, databases) = coordinator();
        let db = databases.get(1).unwrap();
        db.store.store(b"k", RecordHeader { rsn: 1, dmaster: 0, ..RecordHeader::invalid() }, b"v".to_vec());

        let generation = coordinator.run_recovery().await.unwrap();
        assert_eq!(generation, 1);
        assert!(!coordinator.is_recovery_active());

        let (header, value) = db.store.fetch(b"k");
        assert_eq!(value, b"v");
        assert_eq!(header.dmaster, 0);
    }

    #[test]
    fn merge_keeps_highest_rsn_copy() {
        let low = RecordHeader { rsn: 1, dmaster: 0, ..RecordHeader::invalid() };
        let high = RecordHeader { rsn: 5, dmaster: 1, ..RecordHeader::invalid() };
        let merged = merge_by_highest_rsn(vec![
            (b"k".to_vec(), low, b"old".to_vec()),
            (b"k".to_vec(), high, b"new".to_vec()),
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].1.rsn, 5);
        assert_eq!(merged[0].2, b"new");
    }

    #[test]
    fn merge_breaks_rsn_tie_by_dmaster() {
        let from_node_0 = RecordHeader { rsn: 3, dmaster: 0, ..RecordHeader::invalid() };
        let from_node_2 = RecordHeader { rsn: 3, dmaster: 2, ..RecordHeader::invalid() };
        let merged = merge_by_highest_rsn(vec![
            (b"k".to_vec(), from_node_0, b"a".to_vec()),
            (b"k".to_vec(), from_node_2, b"b".to_vec()),
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].1.dmaster, 2);
        assert_eq!(merged[0].2, b"b");
    }

    #[test]
    fn merge_forgets_deleted_copy_when_a_live_copy_exists() {
        let deleted_high_rsn = RecordHeader { rsn: 9, dmaster: 0, ..RecordHeader::invalid() };
        let live_low_rsn = RecordHeader { rsn: 2, dmaster: 1, ..RecordHeader::invalid() };
        let merged = merge_by_highest_rsn(vec![
            (b"k".to_vec(), deleted_high_rsn, Vec::new()),
            (b"k".to_vec(), live_low_rsn, b"v".to_vec()),
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].1.rsn, 2);
        assert_eq!(merged[0].2, b"v");
    }

    #[test]
    fn merge_keeps_deleted_copy_when_no_live_copy_exists() {
        let low = RecordHeader { rsn: 1, dmaster: 0, ..RecordHeader::invalid() };
        let high = RecordHeader { rsn: 4, dmaster: 1, ..RecordHeader::invalid() };
        let merged = merge_by_highest_rsn(vec![
            (b"k".to_vec(), low, Vec::new()),
            (b"k".to_vec(), high, Vec::new()),
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].1.rsn, 4);
        assert!(merged[0].2.is_empty());
    }

    #[tokio::test]
    async fn recovery_with_no_connected_nodes_fails_and_thaws() {
        let databases = Arc::new(Databases::new());
        let nodes = Arc::new(NodeTable::new());
        let vnn = Arc::new(VnnMapState::new(VnnMap::uninitialized()));
        let freeze = Arc::new(FreezeManager::new(3));
        let links = Arc::new(PeerLinks::new(100));
        let call_engine = Arc::new(CallEngine::new(databases.clone(), vnn.clone(), links, Tunables::default(), 0, freeze.clone()));
        let source: Arc<dyn RecoverySource> = Arc::new(LocalRecoverySource::new(databases.clone()));
        let coordinator = RecoveryCoordinator::new(vnn, nodes, databases, freeze.clone(), call_engine, source, None);

        assert!(coordinator.run_recovery().await.is_err());
        assert!(!freeze.is_frozen(1));
    }
}
