//! Handle Types and Allocation
//!
//! Instances are addressed by generation-checked slot handles so that a
//! handle kept after `remove` can never resolve to a later instance that
//! happens to reuse the same slot. Connections use plain recycled integers
//! that only return to the pool once the connection has been reaped.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Bits of an instance handle that carry the slot index
const SLOT_BITS: u32 = 8;
const SLOT_MASK: u32 = (1 << SLOT_BITS) - 1;
/// Generations wrap below this so the packed handle stays non-negative as an `i32`
const GENERATION_LIMIT: u32 = 1 << (31 - SLOT_BITS);

/// Handle of a short-range instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceHandle(u32);

impl InstanceHandle {
    fn new(slot: usize, generation: u32) -> Self {
        Self((generation << SLOT_BITS) | slot as u32)
    }

    /// Slot index in the instance table
    pub fn slot(&self) -> usize {
        (self.0 & SLOT_MASK) as usize
    }

    /// Generation the slot had when this handle was issued
    pub fn generation(&self) -> u32 {
        self.0 >> SLOT_BITS
    }

    /// Raw integer value
    pub fn as_i32(&self) -> i32 {
        self.0 as i32
    }
}

impl fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle of an SPS connection, unique within its instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnHandle(pub i32);

impl fmt::Display for ConnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an AT client / transport channel, issued by the AT client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransportHandle(pub u32);

impl fmt::Display for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at#{}", self.0)
    }
}

/// Fixed-capacity slot table issuing [`InstanceHandle`]s
#[derive(Debug)]
pub struct SlotAllocator {
    /// Current generation and occupancy per slot
    slots: Vec<(u32, bool)>,
}

impl SlotAllocator {
    /// Create an allocator with `capacity` slots (at most 256)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(SLOT_MASK as usize + 1);
        Self {
            slots: vec![(0, false); capacity],
        }
    }

    /// Claim the lowest free slot
    pub fn allocate(&mut self) -> Option<InstanceHandle> {
        let (slot, entry) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, (_, used))| !*used)?;
        entry.1 = true;
        Some(InstanceHandle::new(slot, entry.0))
    }

    /// Release a slot, bumping its generation so the old handle goes stale.
    /// Returns `false` if `handle` was not live.
    pub fn release(&mut self, handle: InstanceHandle) -> bool {
        if !self.is_live(handle) {
            return false;
        }
        let entry = &mut self.slots[handle.slot()];
        entry.0 = (entry.0 + 1) % GENERATION_LIMIT;
        entry.1 = false;
        true
    }

    /// Check that `handle` refers to a currently occupied slot of the same generation
    pub fn is_live(&self, handle: InstanceHandle) -> bool {
        self.slots
            .get(handle.slot())
            .map(|&(generation, used)| used && generation == handle.generation())
            .unwrap_or(false)
    }

    /// Number of occupied slots
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|(_, used)| *used).count()
    }
}

/// Pool of small connection handles, lowest free value first
#[derive(Debug, Clone)]
pub struct ConnHandlePool {
    free: BTreeSet<i32>,
    capacity: usize,
}

impl ConnHandlePool {
    /// Create a pool of handles `0..capacity`
    pub fn new(capacity: usize) -> Self {
        Self {
            free: (0..capacity as i32).collect(),
            capacity,
        }
    }

    /// Take the lowest free handle
    pub fn allocate(&mut self) -> Option<ConnHandle> {
        let value = *self.free.iter().next()?;
        self.free.remove(&value);
        Some(ConnHandle(value))
    }

    /// Return a reaped handle to the pool
    pub fn release(&mut self, handle: ConnHandle) {
        if (handle.0 as usize) < self.capacity {
            self.free.insert(handle.0);
        }
    }

    /// Number of handles still available
    pub fn available(&self) -> usize {
        self.free.len()
    }
}
