//! Mutex-protected transfer cache
//!
//! The lock covers index bookkeeping and the slot move only. Calls into the
//! central free list and the manager happen with the lock released, so a
//! spill never holds up other inserts and removes on the same cache.

use super::{CacheCore, CacheSettings, TransferCache};
use crate::batch::Batch;
use crate::central_freelist::CentralFreeList;
use crate::manager::TransferCacheManager;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Transfer cache whose ring is guarded by a single mutex
pub struct LockedTransferCache {
    core: CacheCore,
    ring: Mutex<Ring>,
}

/// Slot ring addressed by monotonically increasing head/tail counters
#[derive(Debug)]
struct Ring {
    /// One slot per batch of maximum capacity
    slots: Box<[Option<Batch>]>,
    /// Next batch to remove
    head: u64,
    /// Next free slot
    tail: u64,
    /// Current capacity (batches)
    capacity: usize,
    /// Capacity reserved for grants in flight
    pending_growth: usize,
}

impl Ring {
    fn occupied(&self) -> usize {
        (self.tail - self.head) as usize
    }

    fn slot_index(&self, position: u64) -> usize {
        (position % self.slots.len() as u64) as usize
    }

    fn headroom(&self) -> usize {
        self.slots.len() - self.capacity - self.pending_growth
    }

    fn check_invariants(&self) {
        debug_assert!(
            self.occupied() <= self.capacity,
            "occupied {} exceeds capacity {}",
            self.occupied(),
            self.capacity
        );
        debug_assert!(
            self.capacity + self.pending_growth <= self.slots.len(),
            "capacity {} + pending {} exceeds max {}",
            self.capacity,
            self.pending_growth,
            self.slots.len()
        );
    }
}

impl TransferCache for LockedTransferCache {
    fn new(
        settings: CacheSettings,
        central: Arc<dyn CentralFreeList>,
        manager: Weak<dyn TransferCacheManager>,
    ) -> Self {
        let core = CacheCore::new(settings, central, manager);
        let settings = *core.settings();
        let slots = (0..settings.max_capacity).map(|_| None).collect();

        Self {
            core,
            ring: Mutex::new(Ring {
                slots,
                head: 0,
                tail: 0,
                capacity: settings.initial_capacity,
                pending_growth: 0,
            }),
        }
    }

    fn core(&self) -> &CacheCore {
        &self.core
    }

    fn try_push(&self, batch: Batch) -> std::result::Result<(), Batch> {
        let mut ring = self.ring.lock();
        if ring.occupied() >= ring.capacity {
            return Err(batch);
        }

        let index = ring.slot_index(ring.tail);
        debug_assert!(ring.slots[index].is_none(), "slot {} still occupied", index);
        ring.slots[index] = Some(batch);
        ring.tail += 1;
        ring.check_invariants();
        Ok(())
    }

    fn try_pop(&self) -> Option<Batch> {
        let mut ring = self.ring.lock();
        if ring.occupied() == 0 {
            return None;
        }

        let index = ring.slot_index(ring.head);
        let batch = ring.slots[index].take();
        debug_assert!(batch.is_some(), "slot {} lost its batch", index);
        ring.head += 1;
        ring.check_invariants();
        batch
    }

    fn capacity(&self) -> usize {
        self.ring.lock().capacity
    }

    fn occupied(&self) -> usize {
        self.ring.lock().occupied()
    }

    fn has_spare_capacity(&self) -> bool {
        let ring = self.ring.lock();
        ring.occupied() < ring.capacity
    }

    fn grow(&self) -> bool {
        let mut ring = self.ring.lock();
        if ring.headroom() == 0 {
            return false;
        }
        ring.capacity += 1;
        ring.check_invariants();
        true
    }

    fn shrink(&self) -> bool {
        let mut ring = self.ring.lock();
        if ring.capacity <= ring.occupied() {
            return false;
        }
        ring.capacity -= 1;
        ring.check_invariants();
        true
    }

    fn reserve_growth(&self) -> bool {
        let mut ring = self.ring.lock();
        if ring.headroom() == 0 {
            return false;
        }
        ring.pending_growth += 1;
        true
    }

    fn finish_growth(&self, granted: bool) {
        let mut ring = self.ring.lock();
        debug_assert!(ring.pending_growth > 0, "growth settled without a reservation");
        ring.pending_growth -= 1;
        if granted {
            ring.capacity += 1;
        }
        ring.check_invariants();
    }
}
