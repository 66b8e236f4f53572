//! Transfer cache system: a manager with the cache implementation picked
//! by configuration

use crate::batch::Batch;
use crate::cache::{LockFreeTransferCache, LockedTransferCache, TransferCache};
use crate::central_freelist::{ArenaFreeList, CentralFreeList};
use crate::config::{CacheImplementation, TransferCacheConfig};
use crate::error::Result;
use crate::manager::{CapacityManager, ManagerStats, TransferCacheManager};
use crate::size_class::SizeMap;
use std::sync::Arc;
use tracing::info;

/// Address space reserved per size class by [`TransferCacheSystem::from_config`]
const ARENA_SPAN_SHIFT: u32 = 36;

/// Transfer caches for every size class, backed by either implementation
#[derive(Clone)]
pub enum TransferCacheSystem {
    Locked(Arc<CapacityManager<LockedTransferCache>>),
    LockFree(Arc<CapacityManager<LockFreeTransferCache>>),
}

macro_rules! with_manager {
    ($self:expr, $m:ident => $body:expr) => {
        match $self {
            TransferCacheSystem::Locked($m) => $body,
            TransferCacheSystem::LockFree($m) => $body,
        }
    };
}

impl TransferCacheSystem {
    /// Build the size map and one in-memory central free list per class
    pub fn from_config(config: &TransferCacheConfig) -> Result<Self> {
        let size_map = SizeMap::from_config(config)?;
        let centrals = size_map
            .iter()
            .map(|info| {
                Arc::new(ArenaFreeList::new(
                    info.index,
                    info.object_size,
                    (info.index + 1) << ARENA_SPAN_SHIFT,
                    config.central_object_limit,
                )) as Arc<dyn CentralFreeList>
            })
            .collect();
        Self::with_central_lists(config, size_map, centrals)
    }

    /// Build on caller-supplied central free lists
    pub fn with_central_lists(
        config: &TransferCacheConfig,
        size_map: SizeMap,
        centrals: Vec<Arc<dyn CentralFreeList>>,
    ) -> Result<Self> {
        info!(implementation = ?config.implementation, "Building transfer cache system");
        Ok(match config.implementation {
            CacheImplementation::Locked => {
                Self::Locked(CapacityManager::new(config, size_map, centrals)?)
            }
            CacheImplementation::LockFree => {
                Self::LockFree(CapacityManager::new(config, size_map, centrals)?)
            }
        })
    }

    pub fn implementation(&self) -> CacheImplementation {
        match self {
            Self::Locked(_) => CacheImplementation::Locked,
            Self::LockFree(_) => CacheImplementation::LockFree,
        }
    }

    pub fn insert_range(&self, size_class: usize, batch: Batch) -> Result<()> {
        with_manager!(self, m => m.insert_range(size_class, batch))
    }

    pub fn remove_range(&self, size_class: usize, n: usize) -> Result<Batch> {
        with_manager!(self, m => m.remove_range(size_class, n))
    }

    /// Objects per batch for `size_class`
    pub fn num_objects_to_move(&self, size_class: usize) -> Result<usize> {
        with_manager!(self, m => m.size_map().num_objects_to_move(size_class))
    }

    /// Borrow one batch of capacity for `size_class` from the pool or
    /// another class, absorbed by that class's cache
    pub fn make_space(&self, size_class: usize) -> bool {
        with_manager!(self, m => m.cache(size_class).is_ok_and(|cache| cache.make_space()))
    }

    pub fn grow_cache(&self, size_class: usize) -> bool {
        with_manager!(self, m => m.grow_cache(size_class))
    }

    pub fn release_capacity(&self, size_class: usize) -> bool {
        with_manager!(self, m => m.release_capacity(size_class))
    }

    pub fn num_size_classes(&self) -> usize {
        with_manager!(self, m => m.num_size_classes())
    }

    pub fn stats(&self) -> ManagerStats {
        with_manager!(self, m => m.stats())
    }
}
