//! Lock-free transfer cache
//!
//! The ring is a power-of-two array of slots, each tagged with a sequence
//! number (a bounded MPMC queue in the style of Vyukov). Producers reserve a
//! position by advancing `tail`; consumers reserve one by advancing `head`.
//!
//! `tail`, the current capacity and the capacity reserved for pending grants
//! share one 64-bit state word:
//!
//! ```text
//!  63        48 47        32 31                      0
//! ┌────────────┬────────────┬─────────────────────────┐
//! │  pending   │  capacity  │          tail           │
//! └────────────┴────────────┴─────────────────────────┘
//! ```
//!
//! An insert claims position `tail` with a compare-and-swap of the whole
//! word, so the claim is checked against the live capacity in the same
//! atomic step. A concurrent grow or shrink changes the word, the claim
//! fails, and the insert retries from scratch. Shrink uses the same word and
//! only retracts capacity above `tail - head`, which counts reserved slots,
//! so a slot that has been claimed is always published.

use super::{CacheCore, CacheSettings, TransferCache};
use crate::batch::Batch;
use crate::central_freelist::CentralFreeList;
use crate::manager::TransferCacheManager;
use std::cell::UnsafeCell;
use std::hint;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Unpacked view of the state word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RingState {
    tail: u32,
    capacity: u16,
    pending: u16,
}

impl RingState {
    fn pack(self) -> u64 {
        u64::from(self.tail) | (u64::from(self.capacity) << 32) | (u64::from(self.pending) << 48)
    }

    fn unpack(word: u64) -> Self {
        Self {
            tail: word as u32,
            capacity: (word >> 32) as u16,
            pending: (word >> 48) as u16,
        }
    }
}

/// One ring slot
///
/// `seq == pos` means the slot is free for the producer of position `pos`;
/// `seq == pos + 1` means it holds the batch published at `pos`.
struct Slot {
    seq: AtomicU32,
    batch: UnsafeCell<Option<Batch>>,
}

// SAFETY: `batch` is only touched by the single thread that won the
// head/tail CAS for the slot's current position, and the Acquire/Release
// pair on `seq` orders that access against the previous and next owner.
unsafe impl Sync for Slot {}

#[repr(align(64))]
struct CacheAligned<T>(T);

/// Transfer cache with a lock-free ring
pub struct LockFreeTransferCache {
    core: CacheCore,
    slots: Box<[Slot]>,
    mask: u32,
    /// Capacity ceiling; fits the 16-bit capacity field
    max_capacity: u16,
    head: CacheAligned<AtomicU32>,
    state: CacheAligned<AtomicU64>,
}

impl LockFreeTransferCache {
    fn ring_len(&self) -> u32 {
        self.mask + 1
    }

    fn max_capacity(&self) -> u32 {
        u32::from(self.max_capacity)
    }

    /// Load `head` before the state word so that `tail - head` never underflows
    fn snapshot(&self) -> (u32, u64, RingState) {
        let head = self.head.0.load(Ordering::Acquire);
        let word = self.state.0.load(Ordering::Acquire);
        (head, word, RingState::unpack(word))
    }

    /// Retry `update` on the state word until it succeeds or declines
    fn update_state(&self, update: impl Fn(u32, RingState) -> Option<RingState>) -> bool {
        loop {
            let (head, word, state) = self.snapshot();
            let Some(next) = update(head, state) else {
                return false;
            };
            if self
                .state
                .0
                .compare_exchange_weak(word, next.pack(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
            hint::spin_loop();
        }
    }
}

impl TransferCache for LockFreeTransferCache {
    fn new(
        settings: CacheSettings,
        central: Arc<dyn CentralFreeList>,
        manager: Weak<dyn TransferCacheManager>,
    ) -> Self {
        let core = CacheCore::new(settings, central, manager);
        let settings = *core.settings();
        // CacheCore clamps to MAX_SUPPORTED_CAPACITY, well inside u16
        let max_capacity = u16::try_from(settings.max_capacity).unwrap_or(u16::MAX);
        let initial_capacity = u16::try_from(settings.initial_capacity)
            .unwrap_or(u16::MAX)
            .min(max_capacity);

        let ring_len = usize::from(max_capacity).max(1).next_power_of_two();
        let slots = (0..ring_len)
            .map(|i| Slot {
                seq: AtomicU32::new(i as u32),
                batch: UnsafeCell::new(None),
            })
            .collect();

        let state = RingState {
            tail: 0,
            capacity: initial_capacity,
            pending: 0,
        };

        Self {
            core,
            slots,
            mask: (ring_len - 1) as u32,
            max_capacity,
            head: CacheAligned(AtomicU32::new(0)),
            state: CacheAligned(AtomicU64::new(state.pack())),
        }
    }

    fn core(&self) -> &CacheCore {
        &self.core
    }

    fn try_push(&self, batch: Batch) -> std::result::Result<(), Batch> {
        loop {
            let (head, word, state) = self.snapshot();
            if state.tail.wrapping_sub(head) >= u32::from(state.capacity) {
                return Err(batch);
            }

            let slot = &self.slots[(state.tail & self.mask) as usize];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(state.tail) as i32;
            if diff < 0 {
                // A consumer from the previous lap is still draining this slot
                return Err(batch);
            }
            if diff > 0 {
                // Another producer already claimed this position
                hint::spin_loop();
                continue;
            }

            let next = RingState {
                tail: state.tail.wrapping_add(1),
                ..state
            };
            if self
                .state
                .0
                .compare_exchange_weak(word, next.pack(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // SAFETY: winning the CAS for `state.tail` with `seq == tail`
                // makes this thread the slot's only owner until `seq` is bumped.
                unsafe {
                    let cell = &mut *slot.batch.get();
                    debug_assert!(cell.is_none(), "claimed slot still holds a batch");
                    *cell = Some(batch);
                }
                slot.seq.store(state.tail.wrapping_add(1), Ordering::Release);
                return Ok(());
            }
            hint::spin_loop();
        }
    }

    fn try_pop(&self) -> Option<Batch> {
        loop {
            let head = self.head.0.load(Ordering::Acquire);
            let slot = &self.slots[(head & self.mask) as usize];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(head.wrapping_add(1)) as i32;
            if diff < 0 {
                // Empty, or the producer of this position has not published yet
                return None;
            }
            if diff > 0 {
                hint::spin_loop();
                continue;
            }

            if self
                .head
                .0
                .compare_exchange_weak(head, head.wrapping_add(1), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // SAFETY: winning the CAS for `head` with `seq == head + 1`
                // makes this thread the slot's only owner until `seq` is bumped.
                let batch = unsafe { (*slot.batch.get()).take() };
                debug_assert!(batch.is_some(), "published slot lost its batch");
                slot.seq
                    .store(head.wrapping_add(self.ring_len()), Ordering::Release);
                return batch;
            }
            hint::spin_loop();
        }
    }

    fn capacity(&self) -> usize {
        usize::from(RingState::unpack(self.state.0.load(Ordering::Acquire)).capacity)
    }

    fn occupied(&self) -> usize {
        let (head, _, state) = self.snapshot();
        state.tail.wrapping_sub(head) as usize
    }

    fn has_spare_capacity(&self) -> bool {
        let (head, _, state) = self.snapshot();
        state.tail.wrapping_sub(head) < u32::from(state.capacity)
    }

    fn grow(&self) -> bool {
        let max = self.max_capacity();
        self.update_state(|_, state| {
            (u32::from(state.capacity) + u32::from(state.pending) < max).then(|| RingState {
                capacity: state.capacity + 1,
                ..state
            })
        })
    }

    fn shrink(&self) -> bool {
        self.update_state(|head, state| {
            let occupied = state.tail.wrapping_sub(head);
            (occupied < u32::from(state.capacity)).then(|| RingState {
                capacity: state.capacity - 1,
                ..state
            })
        })
    }

    fn reserve_growth(&self) -> bool {
        let max = self.max_capacity();
        self.update_state(|_, state| {
            (u32::from(state.capacity) + u32::from(state.pending) < max).then(|| RingState {
                pending: state.pending + 1,
                ..state
            })
        })
    }

    fn finish_growth(&self, granted: bool) {
        let settled = self.update_state(|_, state| {
            debug_assert!(state.pending > 0, "growth settled without a reservation");
            Some(RingState {
                capacity: state.capacity + u16::from(granted),
                pending: state.pending.saturating_sub(1),
                ..state
            })
        });
        debug_assert!(settled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_SUPPORTED_CAPACITY;
    use crate::mock::{MockCentralFreeList, MockTransferCacheManager};
    use crate::ObjectPtr;
    use std::thread;

    fn make_cache(initial: usize, max: usize) -> LockFreeTransferCache {
        let central = Arc::new(MockCentralFreeList::new(0));
        let manager = Arc::new(MockTransferCacheManager::new(2));
        let weak: Weak<MockTransferCacheManager> = Arc::downgrade(&manager);
        LockFreeTransferCache::new(
            CacheSettings {
                size_class: 0,
                batch_size: 2,
                initial_capacity: initial,
                max_capacity: max,
            },
            central,
            weak,
        )
    }

    fn batch(id: usize) -> Batch {
        Batch::from_ptrs(vec![ObjectPtr::new(id * 16), ObjectPtr::new(id * 16 + 8)])
    }

    #[test]
    fn test_state_word_packing() {
        let state = RingState {
            tail: u32::MAX - 1,
            capacity: 300,
            pending: 7,
        };
        assert_eq!(RingState::unpack(state.pack()), state);
    }

    #[test]
    fn test_ring_rounds_up_to_power_of_two() {
        let cache = make_cache(4, 20);
        assert_eq!(cache.ring_len(), 32);
        assert_eq!(cache.capacity(), 4);
    }

    #[test]
    fn test_fifo_and_capacity() {
        let cache = make_cache(2, 4);

        assert!(cache.try_push(batch(1)).is_ok());
        assert!(cache.try_push(batch(2)).is_ok());
        assert_eq!(cache.try_push(batch(3)), Err(batch(3)));
        assert!(!cache.has_spare_capacity());

        assert_eq!(cache.try_pop(), Some(batch(1)));
        assert_eq!(cache.try_pop(), Some(batch(2)));
        assert_eq!(cache.try_pop(), None);
    }

    #[test]
    fn test_shrink_never_retracts_occupied_slots() {
        let cache = make_cache(2, 4);

        cache.try_push(batch(1)).unwrap();
        cache.try_push(batch(2)).unwrap();
        assert!(!cache.shrink());

        cache.try_pop().unwrap();
        assert!(cache.shrink());
        assert_eq!(cache.capacity(), 1);
        assert_eq!(cache.occupied(), 1);
    }

    #[test]
    fn test_growth_reservation() {
        let cache = make_cache(3, 4);

        assert!(cache.reserve_growth());
        assert!(!cache.grow());
        cache.finish_growth(false);
        assert_eq!(cache.capacity(), 3);

        assert!(cache.reserve_growth());
        cache.finish_growth(true);
        assert_eq!(cache.capacity(), 4);
        assert!(!cache.reserve_growth());
    }

    #[test]
    fn test_oversized_capacity_is_clamped() {
        let cache = make_cache(70_000, 70_000);
        assert_eq!(cache.capacity(), MAX_SUPPORTED_CAPACITY);
        assert_eq!(cache.core().max_capacity(), MAX_SUPPORTED_CAPACITY);

        // No wrap of the 16-bit field: growth simply stops at the ceiling
        assert!(!cache.grow());
        assert!(!cache.reserve_growth());
        assert!(cache.shrink());
        assert!(cache.grow());
        assert_eq!(cache.capacity(), MAX_SUPPORTED_CAPACITY);
    }

    #[test]
    fn test_tail_wraps_u32() {
        let cache = make_cache(2, 2);
        let start = u32::MAX - 3;
        cache.head.0.store(start, Ordering::Relaxed);
        cache.state.0.store(
            RingState {
                tail: start,
                capacity: 2,
                pending: 0,
            }
            .pack(),
            Ordering::Relaxed,
        );
        for (i, slot) in cache.slots.iter().enumerate() {
            // Re-seed sequence numbers for the new starting lap
            let pos = start.wrapping_add(((i as u32).wrapping_sub(start)) & cache.mask);
            slot.seq.store(pos, Ordering::Relaxed);
        }

        for i in 0..10 {
            cache.try_push(batch(i)).unwrap();
            assert_eq!(cache.occupied(), 1);
            assert_eq!(cache.try_pop(), Some(batch(i)));
        }
    }

    #[test]
    fn test_concurrent_push_pop_conserves_batches() {
        let cache = Arc::new(make_cache(8, 16));
        let mut handles = Vec::new();

        for t in 0..4 {
            let cache = cache.clone();
            handles.push(thread::spawn(move || {
                let mut popped = Vec::new();
                for i in 0..2000 {
                    let b = batch(t * 10_000 + i);
                    if cache.try_push(b.clone()).is_err() {
                        popped.push(b);
                    }
                    if let Some(b) = cache.try_pop() {
                        popped.push(b);
                    }
                    if i % 64 == 0 {
                        cache.shrink();
                        cache.grow();
                    }
                }
                popped
            }));
        }

        let mut seen: Vec<usize> = Vec::new();
        for handle in handles {
            for b in handle.join().unwrap() {
                seen.push(b.as_slice()[0].addr());
            }
        }
        while let Some(b) = cache.try_pop() {
            seen.push(b.as_slice()[0].addr());
        }

        seen.sort_unstable();
        let len = seen.len();
        seen.dedup();
        assert_eq!(seen.len(), len, "a batch was duplicated");
        assert_eq!(len, 4 * 2000, "a batch was lost");
        assert!(cache.occupied() <= cache.capacity());
    }
}
