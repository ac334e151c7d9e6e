//! The daemon's view of cluster membership (spec §3 "Node", §5
//! "Process-wide state").
//!
//! Mirrors the base repository's own `ClusterPartitionTable` /
//! `ClusterState` shape: a lock-free map for per-node state plus an
//! atomically-swapped snapshot for the common read path.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use ctdb_core::node::{Node, NodeFlags, Pnn};
use dashmap::DashMap;

/// Cluster membership: one `Node` per line of the node list file, indexed
/// by its line number (the pnn). Flags are the only thing that mutates at
/// runtime (spec §3 "only flags mutate at runtime").
pub struct NodeTable {
    nodes: DashMap<Pnn, Node>,
    connected: ArcSwap<Vec<Pnn>>,
}

impl NodeTable {
    #[must_use]
    pub fn new() -> Self {
        Self { nodes: DashMap::new(), connected: ArcSwap::from_pointee(Vec::new()) }
    }

    /// Loads the node list from disk: one `host:port` per line, pnn assigned
    /// by line order (spec §6.3: the node list is configuration, not
    /// authoritative persisted cluster state).
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let table = Self::new();
        for (pnn, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            table.nodes.insert(pnn as Pnn, Node::new(pnn as Pnn, line.to_string()));
        }
        table.refresh_connected();
        Ok(table)
    }

    pub fn insert(&self, node: Node) {
        self.nodes.insert(node.pnn, node);
        self.refresh_connected();
    }

    #[must_use]
    pub fn get(&self, pnn: Pnn) -> Option<Node> {
        self.nodes.get(&pnn).map(|n| n.clone())
    }

    pub fn set_flags(&self, pnn: Pnn, flags: NodeFlags) {
        if let Some(mut n) = self.nodes.get_mut(&pnn) {
            n.flags = flags;
        }
        self.refresh_connected();
    }

    #[must_use]
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Snapshot of every node, ordered by pnn (for `getnodemap`).
    #[must_use]
    pub fn all_sorted(&self) -> Vec<Node> {
        let mut v: Vec<Node> = self.nodes.iter().map(|e| e.value().clone()).collect();
        v.sort_by_key(|n| n.pnn);
        v
    }

    /// The current set of healthy, connected pnns, used for broadcast
    /// destnodes and for computing which nodes participate in recovery.
    #[must_use]
    pub fn connected_pnns(&self) -> Arc<Vec<Pnn>> {
        self.connected.load_full()
    }

    fn refresh_connected(&self) {
        let mut v: Vec<Pnn> =
            self.nodes.iter().filter(|e| e.value().is_healthy()).map(|e| *e.key()).collect();
        v.sort_unstable();
        self.connected.store(Arc::new(v));
    }
}

impl Default for NodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get() {
        let t = NodeTable::new();
        t.insert(Node::new(0, "10.0.0.1:4379"));
        assert!(t.get(0).is_some());
        assert_eq!(t.num_nodes(), 1);
    }

    #[test]
    fn unhealthy_node_excluded_from_connected() {
        let t = NodeTable::new();
        t.insert(Node::new(0, "a"));
        t.insert(Node::new(1, "b"));
        t.set_flags(1, NodeFlags::DISCONNECTED);
        assert_eq!(&*t.connected_pnns(), &vec![0]);
    }

    #[test]
    fn load_from_file_assigns_pnn_by_line_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes");
        std::fs::write(&path, "10.0.0.1:4379\n10.0.0.2:4379\n").unwrap();
        let t = NodeTable::load_from_file(&path).unwrap();
        assert_eq!(t.get(0).unwrap().address, "10.0.0.1:4379");
        assert_eq!(t.get(1).unwrap().address, "10.0.0.2:4379");
    }
}
