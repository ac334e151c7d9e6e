//! `ctdb-core` — wire protocol, record header, vnn_map, and node/error types
//! shared between the daemon and the administrative CLI.
//!
//! - **Wire** ([`wire`]): the fixed packet header, per-operation bodies, the
//!   framed codec, and the control-plane opcode space.
//! - **Node** ([`node`]): physical node numbers, flags, broadcast sentinels.
//! - **Record** ([`record`]): the header prefixed to every stored value.
//! - **Vnn** ([`vnn`]): the hash→lmaster cluster map.
//! - **Error** ([`error`]): the seven-category error taxonomy.
//! - **Hash** ([`hash`]): FNV-1a hashing used to route keys to buckets.
//! - **Tunables** ([`tunables`]): compiled-in defaults for the daemon.

pub mod error;
pub mod hash;
pub mod node;
pub mod record;
pub mod tunables;
pub mod vnn;
pub mod wire;

pub use error::CtdbError;
pub use hash::{combine_hashes, fnv1a_hash};
pub use node::{
    is_special_destnode, Node, NodeFlags, Pnn, BROADCAST_ALL, BROADCAST_CONNECTED,
    BROADCAST_VNNMAP, CURRENT_NODE, INVALID_PNN,
};
pub use record::{RecordFlags, RecordHeader};
pub use tunables::Tunables;
pub use vnn::{VnnMap, INVALID_GENERATION};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {}

    #[test]
    fn reexports_accessible() {
        let _ = RecordHeader::invalid();
        let _ = VnnMap::uninitialized();
        let _ = Node::new(0, "127.0.0.1:4379");
        let _ = Tunables::default();
        let _ = fnv1a_hash(b"x");
        let _ = CtdbError::Timeout;
        assert!(is_special_destnode(CURRENT_NODE));
    }
}
