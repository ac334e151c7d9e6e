//! The record header prefixed to every stored value (spec §3 "Record header").

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::node::{Pnn, INVALID_PNN};

bitflags! {
    /// Per-record flag bits, distinct from [`NodeFlags`](crate::node::NodeFlags).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct RecordFlags: u32 {
        /// Set when a record was migrated carrying its value (as opposed to
        /// a bare header migration of an already-empty record).
        const MIGRATED_WITH_DATA = 0x0000_0001;
        /// Set by the vacuum process on a record it migrated for deletion
        /// bookkeeping purposes.
        const VACUUM_MIGRATED = 0x0000_0002;
    }
}

/// Fixed header stored immediately before every record's value.
///
/// Invariants (spec §3): at most one node has `dmaster == self` for a given
/// (db, key); rsn never decreases on a node for a key unless a recovery
/// assigns a fresh header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordHeader {
    /// Record sequence number: strictly increasing on the dmaster.
    pub rsn: u64,
    /// Node currently authoritative for this key.
    pub dmaster: Pnn,
    pub flags: RecordFlags,
    /// Last node that called into this record remotely.
    pub laccessor: Pnn,
    /// Consecutive calls from `laccessor` with no intervening other caller.
    pub lacount: u32,
}

impl RecordHeader {
    /// The header synthesized for a key that has never been written: no
    /// dmaster, rsn zero. `fetch` of a missing key returns this header
    /// paired with an empty value (spec §4.4), so callers can treat
    /// "absent" and "present" uniformly.
    #[must_use]
    pub const fn invalid() -> Self {
        Self {
            rsn: 0,
            dmaster: INVALID_PNN,
            flags: RecordFlags::empty(),
            laccessor: INVALID_PNN,
            lacount: 0,
        }
    }

    #[must_use]
    pub fn is_invalid(&self) -> bool {
        self.dmaster == INVALID_PNN
    }

    /// Updates laccessor/lacount after a remote call from `caller` (spec
    /// §4.6 step 7): the counter resets on a change of accessor, otherwise
    /// increments (saturating, since it is only ever compared against a
    /// small threshold).
    pub fn record_access(&mut self, caller: Pnn) {
        if self.laccessor == caller {
            self.lacount = self.lacount.saturating_add(1);
        } else {
            self.laccessor = caller;
            self.lacount = 1;
        }
    }

    /// Advances rsn for a write made while this node is dmaster. Panics in
    /// debug builds if called without first confirming dmaster ownership,
    /// since that would silently violate the monotone-rsn invariant.
    pub fn advance_rsn(&mut self, self_pnn: Pnn) {
        debug_assert_eq!(self.dmaster, self_pnn, "advance_rsn called while not dmaster");
        self.rsn += 1;
    }
}

impl Default for RecordHeader {
    fn default() -> Self {
        Self::invalid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_header_has_no_dmaster() {
        let h = RecordHeader::invalid();
        assert!(h.is_invalid());
        assert_eq!(h.rsn, 0);
    }

    #[test]
    fn record_access_resets_on_new_accessor() {
        let mut h = RecordHeader::invalid();
        h.record_access(1);
        assert_eq!(h.laccessor, 1);
        assert_eq!(h.lacount, 1);
        h.record_access(1);
        assert_eq!(h.lacount, 2);
        h.record_access(2);
        assert_eq!(h.laccessor, 2);
        assert_eq!(h.lacount, 1);
    }

    #[test]
    fn advance_rsn_is_monotone() {
        let mut h = RecordHeader { dmaster: 1, ..RecordHeader::invalid() };
        h.advance_rsn(1);
        h.advance_rsn(1);
        assert_eq!(h.rsn, 2);
    }

    #[test]
    #[should_panic(expected = "advance_rsn called while not dmaster")]
    fn advance_rsn_panics_in_debug_when_not_dmaster() {
        let mut h = RecordHeader { dmaster: 1, ..RecordHeader::invalid() };
        h.advance_rsn(2);
    }

    #[test]
    fn header_roundtrips_through_msgpack() {
        let mut h = RecordHeader::invalid();
        h.dmaster = 3;
        h.rsn = 42;
        h.flags.insert(RecordFlags::MIGRATED_WITH_DATA);
        let bytes = rmp_serde::to_vec(&h).unwrap();
        let decoded: RecordHeader = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(h, decoded);
    }
}
