//! Atomically-swapped holder for the cluster's vnn_map (spec §3 "Cluster
//! map (vnn_map)").
//!
//! Reads (looking up an lmaster for every inbound `REQ_CALL`) vastly
//! outnumber writes (one per recovery), so the vnn_map is read through
//! `arc-swap` rather than a `RwLock`, matching the base repository's own
//! `ClusterState` membership snapshot.

use std::sync::Arc;

use arc_swap::ArcSwap;
use ctdb_core::node::Pnn;
use ctdb_core::vnn::VnnMap;

pub struct VnnMapState {
    inner: ArcSwap<VnnMap>,
}

impl VnnMapState {
    #[must_use]
    pub fn new(map: VnnMap) -> Self {
        Self { inner: ArcSwap::from_pointee(map) }
    }

    #[must_use]
    pub fn current(&self) -> Arc<VnnMap> {
        self.inner.load_full()
    }

    /// Installs a freshly regenerated vnn_map, as the final step of
    /// recovery (spec §4.8 step 6).
    pub fn install(&self, map: VnnMap) {
        self.inner.store(Arc::new(map));
    }

    #[must_use]
    pub fn generation(&self) -> u32 {
        self.inner.load().generation
    }

    #[must_use]
    pub fn lmaster_for_key(&self, key: &[u8]) -> Option<Pnn> {
        self.inner.load().lmaster_for_key(key)
    }
}

impl Default for VnnMapState {
    fn default() -> Self {
        Self::new(VnnMap::uninitialized())
    }
}
