//! Transfer caches
//!
//! A transfer cache buffers whole batches of free objects for one size
//! class, between the per-thread caches and the central free list.
//!
//! # Architecture
//!
//! ```text
//! free()  → insert(batch) ─┬─→ ring has room          → buffered
//!                          ├─→ manager.shrink_cache() → capacity borrowed, buffered
//!                          └─→ otherwise              → central.insert_range()
//!
//! malloc() → remove(n) ────┬─→ ring non-empty         → oldest batch
//!                          └─→ otherwise              → central.remove_range()
//! ```
//!
//! Two ring implementations share the policy above:
//! - [`LockedTransferCache`]: ring guarded by a `parking_lot::Mutex`
//! - [`LockFreeTransferCache`]: ring driven by atomic counters

pub mod lock_free;
pub mod locked;

pub use lock_free::LockFreeTransferCache;
pub use locked::LockedTransferCache;

use crate::batch::Batch;
use crate::central_freelist::CentralFreeList;
use crate::config::MAX_SUPPORTED_CAPACITY;
use crate::error::{Error, Result};
use crate::manager::TransferCacheManager;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// Construction parameters for one cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    pub size_class: usize,
    /// Objects per batch
    pub batch_size: usize,
    /// Capacity at creation (batches)
    pub initial_capacity: usize,
    /// Capacity ceiling (batches), clamped to `MAX_SUPPORTED_CAPACITY`
    pub max_capacity: usize,
}

/// State shared by every cache implementation: identity, collaborators
/// and counters
pub struct CacheCore {
    settings: CacheSettings,
    central: Arc<dyn CentralFreeList>,
    manager: Weak<dyn TransferCacheManager>,
    counters: CacheCounters,
}

impl CacheCore {
    pub fn new(
        settings: CacheSettings,
        central: Arc<dyn CentralFreeList>,
        manager: Weak<dyn TransferCacheManager>,
    ) -> Self {
        let max_capacity = settings.max_capacity.min(MAX_SUPPORTED_CAPACITY);
        let settings = CacheSettings {
            initial_capacity: settings.initial_capacity.min(max_capacity),
            max_capacity,
            ..settings
        };
        Self {
            settings,
            central,
            manager,
            counters: CacheCounters::default(),
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn size_class(&self) -> usize {
        self.settings.size_class
    }

    pub fn batch_size(&self) -> usize {
        self.settings.batch_size
    }

    pub fn max_capacity(&self) -> usize {
        self.settings.max_capacity
    }

    pub fn central(&self) -> &Arc<dyn CentralFreeList> {
        &self.central
    }

    /// The coordinating manager, if it is still alive
    pub fn manager(&self) -> Option<Arc<dyn TransferCacheManager>> {
        self.manager.upgrade()
    }

    pub fn counters(&self) -> &CacheCounters {
        &self.counters
    }
}

/// Event counters, updated with relaxed atomics
#[derive(Debug, Default)]
pub struct CacheCounters {
    pub insert_hits: AtomicU64,
    pub insert_misses: AtomicU64,
    pub remove_hits: AtomicU64,
    pub remove_misses: AtomicU64,
    pub spills: AtomicU64,
    pub capacity_grants: AtomicU64,
    pub capacity_denials: AtomicU64,
    pub bypassed: AtomicU64,
}

impl CacheCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub size_class: usize,
    pub batch_size: usize,
    pub capacity: usize,
    pub occupied: usize,
    pub max_capacity: usize,
    pub insert_hits: u64,
    pub insert_misses: u64,
    pub remove_hits: u64,
    pub remove_misses: u64,
    pub spills: u64,
    pub capacity_grants: u64,
    pub capacity_denials: u64,
    pub bypassed: u64,
    pub hit_rate: f64,
}

/// A bounded buffer of batches for one size class
///
/// Implementations provide the ring primitives; the overflow and underflow
/// policy (`insert`/`remove`) is shared.
pub trait TransferCache: Send + Sync {
    /// Create a cache holding `settings.initial_capacity` batches of capacity
    fn new(
        settings: CacheSettings,
        central: Arc<dyn CentralFreeList>,
        manager: Weak<dyn TransferCacheManager>,
    ) -> Self
    where
        Self: Sized;

    fn core(&self) -> &CacheCore;

    /// Store a batch if there is room, otherwise hand it back
    fn try_push(&self, batch: Batch) -> std::result::Result<(), Batch>;

    /// Take the oldest batch, if any
    fn try_pop(&self) -> Option<Batch>;

    /// Current capacity (batches)
    fn capacity(&self) -> usize;

    /// Batches currently stored or being stored
    fn occupied(&self) -> usize;

    /// Snapshot of `occupied < capacity`
    fn has_spare_capacity(&self) -> bool;

    /// Add one batch of capacity, up to the maximum
    fn grow(&self) -> bool;

    /// Retract one batch of unoccupied capacity
    fn shrink(&self) -> bool;

    /// Set aside headroom for one batch of capacity about to be granted.
    /// Every successful reservation must be settled with `finish_growth`.
    fn reserve_growth(&self) -> bool;

    /// Settle a reservation, absorbing the unit if it was granted
    fn finish_growth(&self, granted: bool);

    fn size_class(&self) -> usize {
        self.core().size_class()
    }

    fn batch_size(&self) -> usize {
        self.core().batch_size()
    }

    /// Accept a batch of freed objects
    ///
    /// Never fails: a batch the cache cannot hold goes to the central free list.
    fn insert(&self, batch: Batch) {
        let core = self.core();
        let counters = core.counters();

        if batch.len() != core.batch_size() {
            CacheCounters::bump(&counters.bypassed);
            core.central().insert_range(batch);
            return;
        }

        let batch = match self.try_push(batch) {
            Ok(()) => {
                CacheCounters::bump(&counters.insert_hits);
                return;
            }
            Err(batch) => batch,
        };
        CacheCounters::bump(&counters.insert_misses);

        let batch = if self.make_space() {
            match self.try_push(batch) {
                Ok(()) => return,
                Err(batch) => batch,
            }
        } else {
            batch
        };

        CacheCounters::bump(&counters.spills);
        trace!(size_class = core.size_class(), len = batch.len(), "Spilling batch to central free list");
        core.central().insert_range(batch);
    }

    /// Hand out `n` objects
    ///
    /// Only an exhausted central free list is an error; the objects it did
    /// return are carried by the error.
    fn remove(&self, n: usize) -> Result<Batch> {
        let core = self.core();
        let counters = core.counters();

        if n == core.batch_size() {
            if let Some(batch) = self.try_pop() {
                CacheCounters::bump(&counters.remove_hits);
                return Ok(batch);
            }
            CacheCounters::bump(&counters.remove_misses);
        } else {
            CacheCounters::bump(&counters.bypassed);
        }

        let batch = core.central().remove_range(n);
        if batch.len() < n {
            return Err(Error::CentralFreeListExhausted {
                size_class: core.size_class(),
                requested: n,
                partial: batch,
            });
        }
        Ok(batch)
    }

    /// Borrow one batch of capacity from another size class
    fn make_space(&self) -> bool {
        let core = self.core();
        if !self.reserve_growth() {
            return false;
        }

        let granted = core
            .manager()
            .is_some_and(|manager| manager.shrink_cache(core.size_class()));
        self.finish_growth(granted);

        if granted {
            CacheCounters::bump(&core.counters().capacity_grants);
            debug!(size_class = core.size_class(), capacity = self.capacity(), "Borrowed cache capacity");
        } else {
            CacheCounters::bump(&core.counters().capacity_denials);
        }
        granted
    }

    /// Get cache statistics
    fn stats(&self) -> CacheStats {
        let core = self.core();
        let c = core.counters();
        let insert_hits = c.insert_hits.load(Ordering::Relaxed);
        let insert_misses = c.insert_misses.load(Ordering::Relaxed);
        let remove_hits = c.remove_hits.load(Ordering::Relaxed);
        let remove_misses = c.remove_misses.load(Ordering::Relaxed);

        let hits = insert_hits + remove_hits;
        let total = hits + insert_misses + remove_misses;
        let hit_rate = if total > 0 {
            hits as f64 / total as f64
        } else {
            0.0
        };

        CacheStats {
            size_class: core.size_class(),
            batch_size: core.batch_size(),
            capacity: self.capacity(),
            occupied: self.occupied(),
            max_capacity: core.max_capacity(),
            insert_hits,
            insert_misses,
            remove_hits,
            remove_misses,
            spills: c.spills.load(Ordering::Relaxed),
            capacity_grants: c.capacity_grants.load(Ordering::Relaxed),
            capacity_denials: c.capacity_denials.load(Ordering::Relaxed),
            bypassed: c.bypassed.load(Ordering::Relaxed),
            hit_rate,
        }
    }
}
