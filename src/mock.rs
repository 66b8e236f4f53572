//! Mock collaborators for testing
//!
//! This module provides call-counting stand-ins for the central free list
//! and the capacity manager, plus a small environment that drives one
//! cache the way an allocator would and audits that no object is lost or
//! duplicated.

use crate::batch::{Batch, ObjectPtr};
use crate::cache::{CacheSettings, TransferCache};
use crate::central_freelist::CentralFreeList;
use crate::error::Error;
use crate::manager::TransferCacheManager;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Objects per batch reported by [`MockTransferCacheManager`] by default
pub const MOCK_BATCH_SIZE: usize = 32;

/// Initial capacity of caches built by [`FakeTransferCacheEnvironment`]
pub const INITIAL_CAPACITY_IN_BATCHES: usize = 16;

/// Capacity ceiling of caches built by [`FakeTransferCacheEnvironment`]
pub const MAX_CAPACITY_IN_BATCHES: usize = 64;

const CENTRAL_BASE: usize = 1 << 40;
const ENVIRONMENT_BASE: usize = 1 << 20;
const OBJECT_STRIDE: usize = 16;

/// In-memory central free list that counts calls
pub struct MockCentralFreeList {
    size_class: usize,
    stash: Mutex<Vec<ObjectPtr>>,
    next_addr: AtomicUsize,
    fabricated: AtomicUsize,
    insert_calls: AtomicUsize,
    remove_calls: AtomicUsize,
    exhausted: AtomicBool,
}

impl MockCentralFreeList {
    pub fn new(size_class: usize) -> Self {
        Self {
            size_class,
            stash: Mutex::new(Vec::new()),
            next_addr: AtomicUsize::new(CENTRAL_BASE),
            fabricated: AtomicUsize::new(0),
            insert_calls: AtomicUsize::new(0),
            remove_calls: AtomicUsize::new(0),
            exhausted: AtomicBool::new(false),
        }
    }

    /// When set, `remove_range` only hands back objects previously inserted
    pub fn set_exhausted(&self, exhausted: bool) {
        self.exhausted.store(exhausted, Ordering::SeqCst);
    }

    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    pub fn remove_calls(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }

    /// Objects this list created out of thin air
    pub fn fabricated(&self) -> usize {
        self.fabricated.load(Ordering::SeqCst)
    }

    /// Objects currently held
    pub fn stashed(&self) -> Vec<ObjectPtr> {
        self.stash.lock().clone()
    }
}

impl CentralFreeList for MockCentralFreeList {
    fn size_class(&self) -> usize {
        self.size_class
    }

    fn remove_range(&self, n: usize) -> Batch {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        let mut batch = Batch::with_capacity(n);
        {
            let mut stash = self.stash.lock();
            while batch.len() < n {
                match stash.pop() {
                    Some(ptr) => batch.push(ptr),
                    None => break,
                }
            }
        }
        if !self.exhausted.load(Ordering::SeqCst) {
            while batch.len() < n {
                let addr = self.next_addr.fetch_add(OBJECT_STRIDE, Ordering::SeqCst);
                self.fabricated.fetch_add(1, Ordering::SeqCst);
                batch.push(ObjectPtr::new(addr));
            }
        }
        batch
    }

    fn insert_range(&self, batch: Batch) {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        self.stash.lock().extend(batch);
    }
}

/// Capacity manager whose `shrink_cache` answers come from a script
pub struct MockTransferCacheManager {
    batch_size: usize,
    shrink_script: Mutex<VecDeque<bool>>,
    shrink_default: AtomicBool,
    grow_default: AtomicBool,
    shrink_calls: AtomicUsize,
    grow_calls: AtomicUsize,
}

impl MockTransferCacheManager {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            shrink_script: Mutex::new(VecDeque::new()),
            shrink_default: AtomicBool::new(false),
            grow_default: AtomicBool::new(false),
            shrink_calls: AtomicUsize::new(0),
            grow_calls: AtomicUsize::new(0),
        }
    }

    /// Queue answers for upcoming `shrink_cache` calls
    pub fn expect_shrink(&self, answers: impl IntoIterator<Item = bool>) {
        self.shrink_script.lock().extend(answers);
    }

    /// Answer for `shrink_cache` once the script runs out
    pub fn set_shrink_default(&self, answer: bool) {
        self.shrink_default.store(answer, Ordering::SeqCst);
    }

    pub fn set_grow_default(&self, answer: bool) {
        self.grow_default.store(answer, Ordering::SeqCst);
    }

    pub fn shrink_calls(&self) -> usize {
        self.shrink_calls.load(Ordering::SeqCst)
    }

    pub fn grow_calls(&self) -> usize {
        self.grow_calls.load(Ordering::SeqCst)
    }
}

impl TransferCacheManager for MockTransferCacheManager {
    fn num_objects_to_move(&self, _size_class: usize) -> usize {
        self.batch_size
    }

    fn shrink_cache(&self, _size_class: usize) -> bool {
        self.shrink_calls.fetch_add(1, Ordering::SeqCst);
        self.shrink_script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.shrink_default.load(Ordering::SeqCst))
    }

    fn grow_cache(&self, _size_class: usize) -> bool {
        self.grow_calls.fetch_add(1, Ordering::SeqCst);
        self.grow_default.load(Ordering::SeqCst)
    }
}

/// Result of [`FakeTransferCacheEnvironment::drain_and_audit`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Audit {
    /// Objects ever created (by the environment or the central list)
    pub expected: usize,
    /// Objects found in the cache, the central list and the caller's hands
    pub found: usize,
    /// Objects found more than once
    pub duplicates: usize,
}

impl Audit {
    pub fn is_consistent(&self) -> bool {
        self.duplicates == 0 && self.expected == self.found
    }
}

/// Drives one cache the way an allocator would
///
/// `insert` frees objects (recycling previously removed ones first),
/// `remove` allocates objects and keeps them until they are freed again.
pub struct FakeTransferCacheEnvironment<C> {
    central: Arc<MockCentralFreeList>,
    manager: Arc<MockTransferCacheManager>,
    cache: C,
    held: Mutex<Vec<ObjectPtr>>,
    next_addr: AtomicUsize,
    fabricated: AtomicUsize,
}

impl<C: TransferCache> FakeTransferCacheEnvironment<C> {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY_IN_BATCHES, MAX_CAPACITY_IN_BATCHES)
    }

    pub fn with_capacity(initial_capacity: usize, max_capacity: usize) -> Self {
        let central = Arc::new(MockCentralFreeList::new(1));
        let manager = Arc::new(MockTransferCacheManager::new(MOCK_BATCH_SIZE));
        let handle: Weak<MockTransferCacheManager> = Arc::downgrade(&manager);
        let cache = C::new(
            CacheSettings {
                size_class: 1,
                batch_size: manager.num_objects_to_move(1),
                initial_capacity,
                max_capacity,
            },
            central.clone(),
            handle,
        );

        Self {
            central,
            manager,
            cache,
            held: Mutex::new(Vec::new()),
            next_addr: AtomicUsize::new(ENVIRONMENT_BASE),
            fabricated: AtomicUsize::new(0),
        }
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    pub fn central_freelist(&self) -> &MockCentralFreeList {
        &self.central
    }

    pub fn transfer_cache_manager(&self) -> &MockTransferCacheManager {
        &self.manager
    }

    pub fn batch_size(&self) -> usize {
        self.cache.batch_size()
    }

    /// Free `n` objects through the cache
    pub fn insert(&self, n: usize) {
        let mut batch = Batch::with_capacity(n);
        {
            let mut held = self.held.lock();
            while batch.len() < n {
                match held.pop() {
                    Some(ptr) => batch.push(ptr),
                    None => break,
                }
            }
        }
        while batch.len() < n {
            let addr = self.next_addr.fetch_add(OBJECT_STRIDE, Ordering::SeqCst);
            self.fabricated.fetch_add(1, Ordering::SeqCst);
            batch.push(ObjectPtr::new(addr));
        }
        self.cache.insert(batch);
    }

    /// Allocate `n` objects through the cache
    pub fn remove(&self, n: usize) {
        let batch = match self.cache.remove(n) {
            Ok(batch) => batch,
            Err(Error::CentralFreeListExhausted { partial, .. }) => partial,
            Err(e) => unreachable!("cache remove failed outside exhaustion: {}", e),
        };
        self.held.lock().extend(batch);
    }

    pub fn grow(&self) {
        self.cache.grow();
    }

    pub fn shrink(&self) {
        self.cache.shrink();
    }

    /// One random operation: mostly inserts and removes, sometimes a resize
    pub fn randomly_poke(&self) {
        let mut rng = rand::thread_rng();
        let batch_size = self.batch_size();
        let n = if rng.gen_bool(0.75) {
            batch_size
        } else {
            rng.gen_range(1..=batch_size)
        };

        let choice: f64 = rng.gen();
        if choice < 0.1 {
            self.shrink();
        } else if choice < 0.2 {
            self.grow();
        } else if choice < 0.6 {
            self.insert(n);
        } else {
            self.remove(n);
        }
    }

    /// Empty the cache into the caller's hands and check conservation.
    /// Only meaningful once no other thread is using the environment.
    pub fn drain_and_audit(&self) -> Audit {
        {
            let mut held = self.held.lock();
            while let Some(batch) = self.cache.try_pop() {
                held.extend(batch);
            }
        }

        let held = self.held.lock();
        let stashed = self.central.stashed();
        let found = held.len() + stashed.len();

        let mut seen = HashSet::with_capacity(found);
        let duplicates = held
            .iter()
            .chain(stashed.iter())
            .filter(|ptr| !seen.insert(**ptr))
            .count();

        Audit {
            expected: self.fabricated.load(Ordering::SeqCst) + self.central.fabricated(),
            found,
            duplicates,
        }
    }
}

impl<C: TransferCache> Default for FakeTransferCacheEnvironment<C> {
    fn default() -> Self {
        Self::new()
    }
}
