//! Bidirectional request-id ↔ in-flight-state registry (spec §4.3).
//!
//! A reqid is 32 bits: the low 16 bits index a slot, the high 16 bits are a
//! wrapping per-slot generation counter. Reusing a slot bumps its
//! generation, so a reply carrying a stale reqid (slot reused since) is
//! detected and dropped without a lookup collision.

use dashmap::DashMap;
use parking_lot::Mutex;

const SLOT_BITS: u32 = 16;
const SLOT_MASK: u32 = (1 << SLOT_BITS) - 1;
const MAX_SLOTS: usize = 1 << SLOT_BITS;

struct SlotAllocator {
    free: Vec<u16>,
    next_fresh: u32,
    generation: Vec<u16>,
}

impl SlotAllocator {
    fn new() -> Self {
        Self { free: Vec::new(), next_fresh: 0, generation: Vec::new() }
    }

    /// Allocates a slot, returns `None` if the 65536-slot space is
    /// exhausted (spec §4.3 "up to ~65k simultaneously in-flight").
    fn alloc(&mut self) -> Option<(u16, u16)> {
        if let Some(slot) = self.free.pop() {
            let gen = self.generation[slot as usize];
            return Some((slot, gen));
        }
        if self.next_fresh as usize >= MAX_SLOTS {
            return None;
        }
        let slot = self.next_fresh as u16;
        self.next_fresh += 1;
        self.generation.push(0);
        Some((slot, 0))
    }

    fn free_slot(&mut self, slot: u16) {
        self.generation[slot as usize] = self.generation[slot as usize].wrapping_add(1);
        self.free.push(slot);
    }
}

/// Combines a slot and generation into the wire `reqid`.
#[must_use]
pub fn make_reqid(slot: u16, generation: u16) -> u32 {
    (u32::from(generation) << SLOT_BITS) | u32::from(slot)
}

#[must_use]
fn split_reqid(reqid: u32) -> (u16, u16) {
    ((reqid & SLOT_MASK) as u16, (reqid >> SLOT_BITS) as u16)
}

/// Registry of in-flight state `T` keyed by reqid.
pub struct ReqidRegistry<T> {
    allocator: Mutex<SlotAllocator>,
    states: DashMap<u16, (u16, T)>,
}

impl<T> ReqidRegistry<T> {
    #[must_use]
    pub fn new() -> Self {
        Self { allocator: Mutex::new(SlotAllocator::new()), states: DashMap::new() }
    }

    /// Allocates a fresh reqid and stores `state` under it. Returns `None`
    /// if the reqid space is exhausted (a resource-exhaustion condition,
    /// spec §7).
    pub fn insert(&self, state: T) -> Option<u32> {
        let (slot, generation) = self.allocator.lock().alloc()?;
        self.states.insert(slot, (generation, state));
        Some(make_reqid(slot, generation))
    }

    /// Looks up state by reqid without removing it. Returns `None` if the
    /// reqid is stale (wrong generation) or unknown — the stale-id check of
    /// spec §4.3/§4.6.
    pub fn get(&self, reqid: u32) -> Option<dashmap::mapref::one::Ref<'_, u16, (u16, T)>> {
        let (slot, generation) = split_reqid(reqid);
        self.states.get(&slot).filter(|entry| entry.0 == generation)
    }

    /// Mutates state in place without recycling the slot or reqid — used by
    /// `REPLY_REDIRECT` handling, which per spec §4.6 "is not given a new
    /// reqid" even though it updates redirect bookkeeping. Returns `false`
    /// if the reqid is stale or unknown.
    pub fn update(&self, reqid: u32, f: impl FnOnce(&mut T)) -> bool {
        let (slot, generation) = split_reqid(reqid);
        match self.states.get_mut(&slot) {
            Some(mut entry) if entry.0 == generation => {
                f(&mut entry.1);
                true
            }
            _ => false,
        }
    }

    /// Removes and returns state by reqid, recycling the slot. Used on
    /// `REPLY_CALL` (done), timeout (error), or recovery resend.
    pub fn take(&self, reqid: u32) -> Option<T> {
        let (slot, generation) = split_reqid(reqid);
        let (_, (stored_gen, state)) = self.states.remove_if(&slot, |_, v| v.0 == generation)?;
        debug_assert_eq!(stored_gen, generation);
        self.allocator.lock().free_slot(slot);
        Some(state)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Drains every in-flight entry, for recovery's "re-stamp and reissue"
    /// step (spec §4.6 "On recovery").
    pub fn drain(&self) -> Vec<(u32, T)> {
        let keys: Vec<u16> = self.states.iter().map(|e| *e.key()).collect();
        let mut out = Vec::with_capacity(keys.len());
        for slot in keys {
            if let Some((_, (generation, state))) = self.states.remove(&slot) {
                out.push((make_reqid(slot, generation), state));
                self.allocator.lock().free_slot(slot);
            }
        }
        out
    }
}

impl<T> Default for ReqidRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
