//! The cluster map: hash bucket → lmaster pnn, versioned by generation
//! (spec §3 "Cluster map (vnn_map)").

use serde::{Deserialize, Serialize};

use crate::hash::fnv1a_hash;
use crate::node::Pnn;

/// Reserved generation meaning "uninitialized or mid-recovery map". A node
/// observing this generation must not act on the four migration opcodes
/// that carry a generation fence (spec §4.1, §8 invariant 3).
pub const INVALID_GENERATION: u32 = 0;

/// The cluster-wide hash→lmaster table. Between recoveries every node
/// holds a byte-identical copy (spec §3 invariant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VnnMap {
    pub generation: u32,
    pub map: Vec<Pnn>,
}

impl VnnMap {
    /// An empty, not-yet-initialized map.
    #[must_use]
    pub fn uninitialized() -> Self {
        Self { generation: INVALID_GENERATION, map: Vec::new() }
    }

    #[must_use]
    pub fn new(generation: u32, map: Vec<Pnn>) -> Self {
        Self { generation, map }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.generation != INVALID_GENERATION && !self.map.is_empty()
    }

    /// Computes the hash bucket a key falls into.
    #[must_use]
    pub fn bucket_for_key(&self, key: &[u8]) -> Option<usize> {
        if self.map.is_empty() {
            return None;
        }
        Some((fnv1a_hash(key) as usize) % self.map.len())
    }

    /// The lmaster pnn for a key: the node responsible for tracking who
    /// currently holds dmaster for that key.
    #[must_use]
    pub fn lmaster_for_key(&self, key: &[u8]) -> Option<Pnn> {
        self.bucket_for_key(key).map(|bucket| self.map[bucket])
    }

    /// A new generation strictly greater than `current_max`, skipping the
    /// reserved `INVALID_GENERATION` value (spec §4.8 step 2).
    #[must_use]
    pub fn next_generation(current_max: u32) -> u32 {
        let next = current_max.wrapping_add(1);
        if next == INVALID_GENERATION {
            next.wrapping_add(1)
        } else {
            next
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uninitialized_map_is_invalid() {
        let m = VnnMap::uninitialized();
        assert!(!m.is_valid());
        assert_eq!(m.lmaster_for_key(b"k"), None);
    }

    #[test]
    fn lmaster_lookup_is_deterministic() {
        let m = VnnMap::new(1, vec![0, 1, 2, 3]);
        let a = m.lmaster_for_key(b"hello");
        let b = m.lmaster_for_key(b"hello");
        assert_eq!(a, b);
        assert!(a.unwrap() < 4);
    }

    #[test]
    fn next_generation_skips_invalid() {
        assert_eq!(VnnMap::next_generation(0), 1);
        assert_eq!(VnnMap::next_generation(u32::MAX), 1);
    }

    #[test]
    fn next_generation_is_monotone_increasing_normally() {
        assert_eq!(VnnMap::next_generation(5), 6);
    }
}
