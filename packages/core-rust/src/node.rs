//! Node identity and flags (spec §3 "Node").

use std::fmt;

use bitflags::bitflags;

/// Physical node number: a stable, 0-based small integer identifying a
/// cluster member.
pub type Pnn = u32;

/// Sentinel meaning "no node" / "not yet known" — used in record headers
/// before any dmaster has been assigned.
pub const INVALID_PNN: Pnn = 0xFFFF_FFFF;

/// Pseudo-destnode meaning "local daemon", used on the client socket.
pub const CURRENT_NODE: Pnn = 0xF000_0001;

/// Pseudo-destnode meaning "every connected or disconnected node".
pub const BROADCAST_ALL: Pnn = 0xF000_0002;

/// Pseudo-destnode meaning "every node that is currently an lmaster
/// somewhere in the vnn_map".
pub const BROADCAST_VNNMAP: Pnn = 0xF000_0003;

/// Pseudo-destnode meaning "every currently connected node".
pub const BROADCAST_CONNECTED: Pnn = 0xF000_0004;

/// Returns true if `pnn` is one of the reserved broadcast/current-node
/// sentinels rather than a real node number.
#[must_use]
pub fn is_special_destnode(pnn: Pnn) -> bool {
    matches!(
        pnn,
        CURRENT_NODE | BROADCAST_ALL | BROADCAST_VNNMAP | BROADCAST_CONNECTED
    )
}

bitflags! {
    /// Runtime health/membership flags for a node, matching the original's
    /// `NODE_FLAGS_*` bitset.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
    pub struct NodeFlags: u32 {
        /// No live connection to this node.
        const DISCONNECTED = 0x0000_0001;
        /// Node reports itself (or is reported) as unhealthy; excluded from
        /// new dmaster assignment during recovery.
        const UNHEALTHY = 0x0000_0002;
        /// Administratively disabled and will not be re-enabled automatically.
        const PERMANENTLY_DISABLED = 0x0000_0004;
        /// Banned for a cooldown period after repeated failures.
        const BANNED = 0x0000_0008;
        /// Administratively stopped; does not run public services.
        const STOPPED = 0x0000_0010;
        /// Present in the node list but not yet connected.
        const INACTIVE = 0x0000_0020;
        /// Marked for removal from the node list at the next recovery.
        const DELETED = 0x0000_0040;
    }
}

/// A cluster member. `flags` is empty (all-zero, i.e. `CONNECTED`) for a
/// healthy, reachable node.
#[derive(Debug, Clone)]
pub struct Node {
    pub pnn: Pnn,
    pub address: String,
    pub flags: NodeFlags,
}

impl Node {
    #[must_use]
    pub fn new(pnn: Pnn, address: impl Into<String>) -> Self {
        Self { pnn, address: address.into(), flags: NodeFlags::empty() }
    }

    /// A node is eligible to hold dmaster/lmaster roles only when connected
    /// and not excluded by an administrative or health flag.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        !self.flags.intersects(
            NodeFlags::DISCONNECTED
                | NodeFlags::UNHEALTHY
                | NodeFlags::PERMANENTLY_DISABLED
                | NodeFlags::BANNED
                | NodeFlags::STOPPED
                | NodeFlags::DELETED,
        )
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node({}@{})", self.pnn, self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_node_default_flags() {
        let n = Node::new(1, "10.0.0.1:4379");
        assert!(n.is_healthy());
    }

    #[test]
    fn unhealthy_flag_excludes_node() {
        let mut n = Node::new(1, "10.0.0.1:4379");
        n.flags.insert(NodeFlags::UNHEALTHY);
        assert!(!n.is_healthy());
    }

    #[test]
    fn flags_intersects_and_contains() {
        let combo = NodeFlags::BANNED | NodeFlags::STOPPED;
        assert!(combo.contains(NodeFlags::BANNED));
        assert!(combo.intersects(NodeFlags::STOPPED));
        assert!(!combo.intersects(NodeFlags::UNHEALTHY));
    }

    #[test]
    fn special_destnodes_are_recognized() {
        assert!(is_special_destnode(CURRENT_NODE));
        assert!(is_special_destnode(BROADCAST_ALL));
        assert!(!is_special_destnode(3));
    }
}
