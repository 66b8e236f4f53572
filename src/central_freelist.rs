//! Central free list interface and an in-memory implementation
//!
//! The transfer cache only ever talks to the central free list through
//! [`CentralFreeList`]: bulk removal of up to `n` objects and an infallible
//! bulk insert. [`ArenaFreeList`] backs that contract with a min-heap of
//! free addresses and bump allocation of fresh ones.

use crate::batch::{Batch, ObjectPtr};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use tracing::{debug, warn};

/// Backing store of free objects for one size class
pub trait CentralFreeList: Send + Sync {
    /// Size class served by this list
    fn size_class(&self) -> usize;

    /// Hand out up to `n` objects. Fewer than `n` means the list is exhausted.
    fn remove_range(&self, n: usize) -> Batch;

    /// Take back objects. Never refuses.
    fn insert_range(&self, batch: Batch);
}

/// In-memory central free list for one size class
///
/// Reuses freed objects lowest-address-first (better locality), and carves
/// new objects from a contiguous region once the free heap is empty.
pub struct ArenaFreeList {
    size_class: usize,
    object_size: usize,
    /// Objects this list may carve in total (None = unlimited)
    object_limit: Option<usize>,
    inner: Mutex<ArenaInner>,
}

#[derive(Debug)]
struct ArenaInner {
    /// Free objects (stored as addresses)
    free_objects: BinaryHeap<Reverse<usize>>,
    /// Next address to carve if no free objects remain
    next_offset: usize,
    /// Objects carved so far
    carved: usize,
}

impl ArenaFreeList {
    /// Create a list whose objects start at `base`
    pub fn new(size_class: usize, object_size: usize, base: usize, object_limit: Option<usize>) -> Self {
        Self {
            size_class,
            object_size: object_size.max(1),
            object_limit,
            inner: Mutex::new(ArenaInner {
                free_objects: BinaryHeap::new(),
                next_offset: base,
                carved: 0,
            }),
        }
    }

    /// Get the number of free objects held
    pub fn free_count(&self) -> usize {
        self.inner.lock().free_objects.len()
    }

    /// Get the total number of objects carved (free or handed out)
    pub fn total_objects(&self) -> usize {
        self.inner.lock().carved
    }

    pub fn object_size(&self) -> usize {
        self.object_size
    }

    /// Snapshot of the free objects, lowest address first
    pub fn free_objects(&self) -> Vec<ObjectPtr> {
        let inner = self.inner.lock();
        let mut addrs: Vec<usize> = inner.free_objects.iter().map(|Reverse(a)| *a).collect();
        addrs.sort_unstable();
        addrs.into_iter().map(ObjectPtr::new).collect()
    }
}

impl CentralFreeList for ArenaFreeList {
    fn size_class(&self) -> usize {
        self.size_class
    }

    fn remove_range(&self, n: usize) -> Batch {
        let mut batch = Batch::with_capacity(n);
        let mut inner = self.inner.lock();

        while batch.len() < n {
            // Try to reuse a free object first
            if let Some(Reverse(addr)) = inner.free_objects.pop() {
                batch.push(ObjectPtr::new(addr));
                continue;
            }

            if self.object_limit.is_some_and(|limit| inner.carved >= limit) {
                break;
            }

            // Otherwise, carve a new object at the end
            let addr = inner.next_offset;
            inner.next_offset += self.object_size;
            inner.carved += 1;
            batch.push(ObjectPtr::new(addr));
        }

        if batch.len() < n {
            warn!(
                size_class = self.size_class,
                requested = n,
                returned = batch.len(),
                "Central free list exhausted"
            );
        }
        batch
    }

    fn insert_range(&self, batch: Batch) {
        let count = batch.len();
        let mut inner = self.inner.lock();
        inner
            .free_objects
            .extend(batch.into_iter().map(|ptr| Reverse(ptr.addr())));
        debug!(size_class = self.size_class, count, "Returned objects to central free list");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_carves_sequential_objects() {
        let list = ArenaFreeList::new(0, 64, 0x1000, None);

        let batch = list.remove_range(3);
        let addrs: Vec<usize> = batch.iter().map(|p| p.addr()).collect();
        assert_eq!(addrs, vec![0x1000, 0x1040, 0x1080]);

        assert_eq!(list.total_objects(), 3);
        assert_eq!(list.free_count(), 0);
    }

    #[test]
    fn test_reuses_lowest_address_first() {
        let list = ArenaFreeList::new(0, 64, 0, None);

        let batch = list.remove_range(4);
        let mut ptrs = batch.into_ptrs();
        ptrs.reverse();
        list.insert_range(Batch::from_ptrs(ptrs));
        assert_eq!(list.free_count(), 4);

        let again = list.remove_range(2);
        assert_eq!(again.as_slice(), &[ObjectPtr::new(0), ObjectPtr::new(64)]);

        // New carving continues from where we left off
        let more = list.remove_range(3);
        assert_eq!(more.as_slice()[2], ObjectPtr::new(256));
    }

    #[test]
    fn test_limit_reports_exhaustion() {
        let list = ArenaFreeList::new(2, 32, 0, Some(5));

        assert_eq!(list.remove_range(4).len(), 4);
        let short = list.remove_range(4);
        assert_eq!(short.len(), 1);
        assert!(list.remove_range(1).is_empty());

        list.insert_range(short);
        assert_eq!(list.remove_range(1).len(), 1);
    }

    #[test]
    fn test_free_objects_sorted() {
        let list = ArenaFreeList::new(0, 16, 0, None);
        list.insert_range(Batch::from_ptrs(vec![ObjectPtr::new(48), ObjectPtr::new(16)]));
        assert_eq!(list.free_objects(), vec![ObjectPtr::new(16), ObjectPtr::new(48)]);
    }
}
