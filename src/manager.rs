//! Capacity manager
//!
//! Owns one transfer cache per size class and moves buffering capacity
//! between them under a fleet-wide budget.
//!
//! # Architecture
//!
//! ```text
//! CapacityManager (Arc, owned by the allocator)
//!   ├─→ cache[0] ─┐
//!   ├─→ cache[1]  ├─ each holds a Weak back-reference for shrink_cache()
//!   ├─→ cache[N] ─┘
//!   └─→ rebalance lock: unassigned pool + victim policy
//! ```
//!
//! Capacity is conserved: `Σ cache capacity + unassigned == budget`
//! whenever no grant is in flight. A unit reclaimed from a donor has exactly
//! one owner at every step.

use crate::batch::Batch;
use crate::cache::{CacheSettings, CacheStats, TransferCache};
use crate::central_freelist::CentralFreeList;
use crate::config::TransferCacheConfig;
use crate::error::{Error, Result};
use crate::policy::{self, VictimPolicy};
use crate::size_class::SizeMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace};

/// What a cache may ask of its coordinator
pub trait TransferCacheManager: Send + Sync {
    /// Objects per batch for `size_class`
    fn num_objects_to_move(&self, size_class: usize) -> usize;

    /// Reclaim one batch of unused capacity from another size class on
    /// behalf of `size_class`. On `true` the unit belongs to the caller,
    /// which absorbs it into its own capacity.
    fn shrink_cache(&self, size_class: usize) -> bool;

    /// Grow `size_class` by one batch directly from the unassigned pool
    fn grow_cache(&self, size_class: usize) -> bool;
}

struct Rebalance {
    /// Capacity owned by no cache
    unassigned: usize,
    policy: Box<dyn VictimPolicy>,
}

/// Coordinates the transfer caches of every size class
pub struct CapacityManager<C> {
    size_map: SizeMap,
    caches: Vec<C>,
    budget: usize,
    rebalance: Mutex<Rebalance>,
}

impl<C: TransferCache + 'static> CapacityManager<C> {
    /// Create one cache per size class, each backed by its central free list
    ///
    /// # Arguments
    /// * `config` - capacity bounds, budget and victim policy
    /// * `size_map` - the size classes
    /// * `centrals` - one central free list per size class, in class order
    pub fn new(
        config: &TransferCacheConfig,
        size_map: SizeMap,
        centrals: Vec<Arc<dyn CentralFreeList>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        if centrals.len() != size_map.len() {
            return Err(Error::InvalidConfig(format!(
                "{} central free lists for {} size classes",
                centrals.len(),
                size_map.len()
            )));
        }

        let initial: Vec<usize> = size_map
            .iter()
            .map(|info| config.initial_capacity_in_batches.min(info.max_capacity))
            .collect();
        let assigned: usize = initial.iter().sum();
        let budget = config.capacity_budget_in_batches.unwrap_or(assigned);
        if budget < assigned {
            return Err(Error::InvalidConfig(format!(
                "capacity budget {} is below the {} batches assigned at start",
                budget, assigned
            )));
        }

        info!(
            size_classes = size_map.len(),
            budget,
            unassigned = budget - assigned,
            victim_policy = ?config.victim_policy,
            "Initializing transfer cache manager"
        );

        let victim_policy = policy::from_kind(config.victim_policy);
        let manager = Arc::new_cyclic(|weak: &Weak<Self>| {
            let handle: Weak<dyn TransferCacheManager> = weak.clone();
            let caches = size_map
                .iter()
                .zip(initial.iter())
                .zip(centrals)
                .map(|((info, &initial_capacity), central)| {
                    C::new(
                        CacheSettings {
                            size_class: info.index,
                            batch_size: info.batch_size,
                            initial_capacity,
                            max_capacity: info.max_capacity,
                        },
                        central,
                        handle.clone(),
                    )
                })
                .collect();

            Self {
                size_map,
                caches,
                budget,
                rebalance: Mutex::new(Rebalance {
                    unassigned: budget - assigned,
                    policy: victim_policy,
                }),
            }
        });

        Ok(manager)
    }

    /// The cache for `size_class`
    pub fn cache(&self, size_class: usize) -> Result<&C> {
        self.caches
            .get(size_class)
            .ok_or(Error::InvalidSizeClass(size_class))
    }

    pub fn num_size_classes(&self) -> usize {
        self.caches.len()
    }

    pub fn size_map(&self) -> &SizeMap {
        &self.size_map
    }

    /// Deallocation path: hand a batch of freed objects to the class's cache
    pub fn insert_range(&self, size_class: usize, batch: Batch) -> Result<()> {
        self.cache(size_class)?.insert(batch);
        Ok(())
    }

    /// Allocation path: take `n` objects of `size_class`
    pub fn remove_range(&self, size_class: usize, n: usize) -> Result<Batch> {
        self.cache(size_class)?.remove(n)
    }

    /// Move one unused batch of capacity from `size_class` into the
    /// unassigned pool
    pub fn release_capacity(&self, size_class: usize) -> bool {
        let Some(cache) = self.caches.get(size_class) else {
            return false;
        };
        let mut rebalance = self.rebalance.lock();
        if !cache.shrink() {
            return false;
        }
        rebalance.unassigned += 1;
        debug!(size_class, unassigned = rebalance.unassigned, "Released cache capacity to pool");
        true
    }

    /// Fleet-wide capacity budget (batches)
    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Capacity currently owned by no cache (batches)
    pub fn unassigned(&self) -> usize {
        self.rebalance.lock().unassigned
    }

    /// Get manager statistics
    pub fn stats(&self) -> ManagerStats {
        let caches: Vec<CacheStats> = self.caches.iter().map(|c| c.stats()).collect();
        let total_capacity = caches.iter().map(|c| c.capacity).sum();
        let total_occupied = caches.iter().map(|c| c.occupied).sum();
        ManagerStats {
            budget: self.budget,
            unassigned: self.unassigned(),
            total_capacity,
            total_occupied,
            caches,
        }
    }
}

impl<C: TransferCache + 'static> TransferCacheManager for CapacityManager<C> {
    fn num_objects_to_move(&self, size_class: usize) -> usize {
        // Caches only ask about their own class; 0 moves nothing otherwise
        self.size_map.num_objects_to_move(size_class).unwrap_or(0)
    }

    fn shrink_cache(&self, size_class: usize) -> bool {
        if size_class >= self.caches.len() {
            return false;
        }

        let mut rebalance = self.rebalance.lock();
        if rebalance.unassigned > 0 {
            rebalance.unassigned -= 1;
            trace!(size_class, "Granted capacity from unassigned pool");
            return true;
        }

        let spare = |i: usize| {
            let cache = &self.caches[i];
            cache.capacity().saturating_sub(cache.occupied())
        };
        let candidates = rebalance
            .policy
            .candidates(size_class, self.caches.len(), &spare);

        for donor in candidates {
            if self.caches[donor].shrink() {
                debug!(recipient = size_class, donor, "Reclaimed capacity from donor cache");
                return true;
            }
        }

        trace!(size_class, "No donor had spare capacity");
        false
    }

    fn grow_cache(&self, size_class: usize) -> bool {
        let Some(cache) = self.caches.get(size_class) else {
            return false;
        };

        let mut rebalance = self.rebalance.lock();
        if rebalance.unassigned == 0 || !cache.grow() {
            return false;
        }
        rebalance.unassigned -= 1;
        debug!(size_class, unassigned = rebalance.unassigned, "Grew cache from pool");
        true
    }
}

/// Statistics for the whole manager
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub budget: usize,
    pub unassigned: usize,
    pub total_capacity: usize,
    pub total_occupied: usize,
    pub caches: Vec<CacheStats>,
}
