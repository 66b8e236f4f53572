//! Object pointers and the batches they travel in

use serde::{Deserialize, Serialize};
use std::fmt;

/// Address of a free object owned by the allocator
///
/// The cache never dereferences it; it is an opaque token moved between
/// the thread caches, the transfer cache and the central free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectPtr(usize);

impl ObjectPtr {
    /// Wrap a raw object address
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Get the raw address
    pub const fn addr(self) -> usize {
        self.0
    }
}

impl fmt::Display for ObjectPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Object({:#x})", self.0)
    }
}

/// A group of object pointers moved as one unit
///
/// A full batch holds exactly `num_objects_to_move(size_class)` pointers.
/// The transfer cache stores and returns batches whole; it never splits one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    ptrs: Vec<ObjectPtr>,
}

impl Batch {
    /// Create an empty batch with room for `capacity` pointers
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ptrs: Vec::with_capacity(capacity),
        }
    }

    /// Build a batch from a list of pointers
    pub fn from_ptrs(ptrs: Vec<ObjectPtr>) -> Self {
        Self { ptrs }
    }

    /// Append a pointer
    pub fn push(&mut self, ptr: ObjectPtr) {
        self.ptrs.push(ptr);
    }

    pub fn len(&self) -> usize {
        self.ptrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ptrs.is_empty()
    }

    pub fn as_slice(&self) -> &[ObjectPtr] {
        &self.ptrs
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ObjectPtr> {
        self.ptrs.iter()
    }

    /// Take the pointers out of the batch
    pub fn into_ptrs(self) -> Vec<ObjectPtr> {
        self.ptrs
    }
}

impl FromIterator<ObjectPtr> for Batch {
    fn from_iter<I: IntoIterator<Item = ObjectPtr>>(iter: I) -> Self {
        Self {
            ptrs: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Batch {
    type Item = ObjectPtr;
    type IntoIter = std::vec::IntoIter<ObjectPtr>;

    fn into_iter(self) -> Self::IntoIter {
        self.ptrs.into_iter()
    }
}

impl fmt::Display for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.ptrs.first(), self.ptrs.last()) {
            (Some(first), Some(last)) => {
                write!(f, "Batch(len={}, first={}, last={})", self.len(), first, last)
            }
            _ => write!(f, "Batch(len=0)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_ptr_display() {
        let ptr = ObjectPtr::new(0x1040);
        assert_eq!(ptr.addr(), 0x1040);
        assert_eq!(ptr.to_string(), "Object(0x1040)");
    }

    #[test]
    fn test_batch_lifecycle() {
        let mut batch = Batch::with_capacity(4);
        assert!(batch.is_empty());

        batch.push(ObjectPtr::new(64));
        batch.push(ObjectPtr::new(128));
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.as_slice()[1], ObjectPtr::new(128));

        let ptrs = batch.into_ptrs();
        assert_eq!(ptrs, vec![ObjectPtr::new(64), ObjectPtr::new(128)]);
    }

    #[test]
    fn test_batch_display() {
        let batch: Batch = (1..=3).map(|i| ObjectPtr::new(i * 16)).collect();
        assert_eq!(
            batch.to_string(),
            "Batch(len=3, first=Object(0x10), last=Object(0x30))"
        );
        assert_eq!(Batch::default().to_string(), "Batch(len=0)");
    }
}
