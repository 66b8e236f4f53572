// Transfer Cache - Rust Implementation
// Batched middle-tier caches between per-thread caches and central free lists

#![warn(rust_2018_idioms)]

pub mod batch;
pub mod cache;
pub mod central_freelist;
pub mod config;
pub mod manager;
pub mod metrics;
pub mod mock;
pub mod policy;
pub mod size_class;
pub mod system;

// Re-exports for convenience
pub use batch::{Batch, ObjectPtr};
pub use cache::{CacheSettings, CacheStats, LockFreeTransferCache, LockedTransferCache, TransferCache};
pub use central_freelist::{ArenaFreeList, CentralFreeList};
pub use config::{CacheImplementation, TransferCacheConfig, VictimPolicyKind};
pub use manager::{CapacityManager, ManagerStats, TransferCacheManager};
pub use size_class::{SizeClassInfo, SizeMap};
pub use system::TransferCacheSystem;

/// Transfer cache error types
pub mod error {
    use crate::batch::Batch;
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        /// The central free list handed back fewer objects than requested.
        /// The objects it did return travel with the error.
        #[error(
            "Central free list exhausted for size class {size_class}: requested {requested}, got {}",
            partial.len()
        )]
        CentralFreeListExhausted {
            size_class: usize,
            requested: usize,
            partial: Batch,
        },

        #[error("Invalid size class: {0}")]
        InvalidSizeClass(usize),

        #[error("Invalid configuration: {0}")]
        InvalidConfig(String),

        #[error("Configuration error: {0}")]
        Config(#[from] ::config::ConfigError),

        #[error("TOML error: {0}")]
        Toml(#[from] toml::de::Error),

        #[error("Metrics error: {0}")]
        Metrics(#[from] prometheus::Error),
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
