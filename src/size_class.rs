//! Size class table for the transfer caches

use crate::config::{TransferCacheConfig, MAX_SUPPORTED_CAPACITY};
use crate::error::{Error, Result};

/// Static description of one size class
///
/// Every transfer between a thread cache, the transfer cache and the
/// central free list for this class moves `batch_size` objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClassInfo {
    /// Index of this size class
    pub index: usize,
    /// Size of objects in this class (bytes)
    pub object_size: usize,
    /// Objects per batch
    pub batch_size: usize,
    /// Upper bound on cache capacity (batches)
    pub max_capacity: usize,
}

impl SizeClassInfo {
    /// Check if a given size fits in this size class
    pub fn can_fit(&self, size: usize) -> bool {
        size <= self.object_size
    }
}

/// All size classes, sorted by object size
#[derive(Debug, Clone)]
pub struct SizeMap {
    classes: Vec<SizeClassInfo>,
}

impl SizeMap {
    /// Build the table described by `config`
    pub fn from_config(config: &TransferCacheConfig) -> Result<Self> {
        config.validate()?;

        let classes = calculate_size_classes(
            config.min_object_size,
            config.max_object_size,
            config.growth_factor,
        )
        .into_iter()
        .enumerate()
        .map(|(index, object_size)| SizeClassInfo {
            index,
            object_size,
            batch_size: batch_size_for(object_size, config.target_batch_bytes, config.max_batch_size),
            max_capacity: config.max_capacity_in_batches,
        })
        .collect();

        Ok(Self { classes })
    }

    /// Build a table from explicit class descriptions
    pub fn from_classes(classes: Vec<SizeClassInfo>) -> Result<Self> {
        for (i, class) in classes.iter().enumerate() {
            if class.index != i {
                return Err(Error::InvalidConfig(format!(
                    "size class at position {} carries index {}",
                    i, class.index
                )));
            }
            if class.batch_size == 0 {
                return Err(Error::InvalidConfig(format!(
                    "size class {} has a zero batch size",
                    i
                )));
            }
            if class.max_capacity > MAX_SUPPORTED_CAPACITY {
                return Err(Error::InvalidConfig(format!(
                    "size class {} max capacity {} exceeds {}",
                    i, class.max_capacity, MAX_SUPPORTED_CAPACITY
                )));
            }
        }
        Ok(Self { classes })
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Look up one class
    pub fn get(&self, size_class: usize) -> Result<&SizeClassInfo> {
        self.classes
            .get(size_class)
            .ok_or(Error::InvalidSizeClass(size_class))
    }

    /// Objects moved per transfer for `size_class`
    pub fn num_objects_to_move(&self, size_class: usize) -> Result<usize> {
        self.get(size_class).map(|c| c.batch_size)
    }

    /// Smallest class whose objects can hold `size` bytes
    pub fn class_for_size(&self, size: usize) -> Option<usize> {
        self.classes.iter().position(|c| c.can_fit(size))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SizeClassInfo> {
        self.classes.iter()
    }
}

/// Calculate size classes with a geometric growth factor (Sled-style)
///
/// With `growth = 1.2` this yields `[min, min*1.2, ...]` up to `max`,
/// rounded up to 8-byte alignment.
pub fn calculate_size_classes(min_size: usize, max_size: usize, growth: f64) -> Vec<usize> {
    let mut classes = Vec::new();
    let Some(mut current) = align8(min_size.max(8)) else {
        return classes;
    };

    while current <= max_size {
        classes.push(current);
        // Always make progress, even for tiny growth factors. Stop at the
        // top of the address range.
        let grown = align8((current as f64 * growth).ceil() as usize);
        match (grown, current.checked_add(8)) {
            (Some(grown), Some(step)) => current = grown.max(step),
            _ => break,
        }
    }

    classes
}

/// Objects per batch: about `target_bytes` worth, clamped to `[2, max_batch]`
pub fn batch_size_for(object_size: usize, target_bytes: usize, max_batch: usize) -> usize {
    let fit = target_bytes / object_size.max(1);
    fit.clamp(2, max_batch.max(2))
}

fn align8(n: usize) -> Option<usize> {
    n.checked_add(7).map(|n| n & !7)
}
