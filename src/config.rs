//! Transfer cache configuration
//!
//! Values are layered: built-in defaults, then an optional TOML file,
//! then `TCACHE_*` environment variables (e.g. `TCACHE_IMPLEMENTATION=lock_free`).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "TCACHE";

/// Largest per-class capacity the lock-free ring can address
pub const MAX_SUPPORTED_CAPACITY: usize = 1 << 14;

/// Largest object size a size class may serve (1 GiB)
pub const MAX_OBJECT_SIZE: usize = 1 << 30;

/// Which cache implementation backs every size class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheImplementation {
    /// Ring guarded by a mutex
    #[default]
    Locked,
    /// Ring driven by atomic head/tail counters
    LockFree,
}

/// How the manager picks a donor when a cache asks for capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VictimPolicyKind {
    /// Walk the size classes in order, resuming where the last search stopped
    #[default]
    RoundRobin,
    /// Prefer the cache with the most unused capacity
    MostSpare,
}

/// Transfer cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferCacheConfig {
    /// Smallest object size (bytes)
    pub min_object_size: usize,
    /// Largest object size (bytes)
    pub max_object_size: usize,
    /// Ratio between consecutive size classes
    pub growth_factor: f64,
    /// Bytes moved per batch before clamping
    pub target_batch_bytes: usize,
    /// Upper bound on objects per batch
    pub max_batch_size: usize,
    /// Capacity each cache starts with (batches)
    pub initial_capacity_in_batches: usize,
    /// Capacity ceiling per cache (batches)
    pub max_capacity_in_batches: usize,
    /// Fleet-wide capacity budget (batches). Defaults to the sum of the
    /// initial capacities; anything above that starts in the unassigned pool.
    pub capacity_budget_in_batches: Option<usize>,
    /// Cache implementation
    pub implementation: CacheImplementation,
    /// Donor selection policy
    pub victim_policy: VictimPolicyKind,
    /// Objects each in-memory central free list may carve before it
    /// reports exhaustion. Unlimited when unset.
    pub central_object_limit: Option<usize>,
}

impl Default for TransferCacheConfig {
    fn default() -> Self {
        Self {
            min_object_size: 8,
            max_object_size: 64 * 1024,
            growth_factor: 1.2,
            target_batch_bytes: 64 * 1024,
            max_batch_size: 32,
            initial_capacity_in_batches: 16,
            max_capacity_in_batches: 64,
            capacity_budget_in_batches: None,
            implementation: CacheImplementation::Locked,
            victim_policy: VictimPolicyKind::RoundRobin,
            central_object_limit: None,
        }
    }
}

impl TransferCacheConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            ::config::Config::builder().add_source(::config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        let config: Self = builder
            .add_source(::config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML document; missing keys take defaults
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<()> {
        if self.min_object_size == 0 || self.min_object_size > self.max_object_size {
            return Err(Error::InvalidConfig(format!(
                "object size range {}..={} is empty",
                self.min_object_size, self.max_object_size
            )));
        }
        if self.max_object_size > MAX_OBJECT_SIZE {
            return Err(Error::InvalidConfig(format!(
                "max_object_size must be at most {}, got {}",
                MAX_OBJECT_SIZE, self.max_object_size
            )));
        }
        if !(self.growth_factor > 1.0) {
            return Err(Error::InvalidConfig(format!(
                "growth_factor must exceed 1.0, got {}",
                self.growth_factor
            )));
        }
        if self.max_batch_size < 2 {
            return Err(Error::InvalidConfig(format!(
                "max_batch_size must be at least 2, got {}",
                self.max_batch_size
            )));
        }
        if self.max_capacity_in_batches == 0
            || self.max_capacity_in_batches > MAX_SUPPORTED_CAPACITY
        {
            return Err(Error::InvalidConfig(format!(
                "max_capacity_in_batches must be in 1..={}, got {}",
                MAX_SUPPORTED_CAPACITY, self.max_capacity_in_batches
            )));
        }
        if self.initial_capacity_in_batches > self.max_capacity_in_batches {
            return Err(Error::InvalidConfig(format!(
                "initial capacity {} exceeds max capacity {}",
                self.initial_capacity_in_batches, self.max_capacity_in_batches
            )));
        }
        Ok(())
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::InvalidConfig(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = TransferCacheConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.initial_capacity_in_batches, 16);
        assert_eq!(config.implementation, CacheImplementation::Locked);
    }

    #[test]
    fn test_from_toml_partial() -> Result<()> {
        let config = TransferCacheConfig::from_toml_str(
            r#"
            implementation = "lock_free"
            victim_policy = "most_spare"
            max_capacity_in_batches = 128
            capacity_budget_in_batches = 4096
            "#,
        )?;

        assert_eq!(config.implementation, CacheImplementation::LockFree);
        assert_eq!(config.victim_policy, VictimPolicyKind::MostSpare);
        assert_eq!(config.max_capacity_in_batches, 128);
        assert_eq!(config.capacity_budget_in_batches, Some(4096));
        assert_eq!(config.min_object_size, 8);
        Ok(())
    }

    #[test]
    fn test_rejects_initial_above_max() {
        let result = TransferCacheConfig::from_toml_str(
            "initial_capacity_in_batches = 10\nmax_capacity_in_batches = 4\n",
        );
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_flat_growth() {
        let config = TransferCacheConfig {
            growth_factor: 1.0,
            ..TransferCacheConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_huge_object_size() {
        let config = TransferCacheConfig {
            max_object_size: usize::MAX,
            ..TransferCacheConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
        assert!(matches!(
            TransferCacheConfig::from_toml_str("max_object_size = 1099511627776\n"),
            Err(Error::InvalidConfig(_))
        ));

        let at_limit = TransferCacheConfig {
            max_object_size: MAX_OBJECT_SIZE,
            ..TransferCacheConfig::default()
        };
        assert!(at_limit.validate().is_ok());
    }

    #[test]
    fn test_rejects_oversized_ring() {
        let config = TransferCacheConfig {
            max_capacity_in_batches: MAX_SUPPORTED_CAPACITY + 1,
            ..TransferCacheConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() -> Result<()> {
        let path = std::env::temp_dir().join(format!("tcache_config_{}.toml", std::process::id()));
        std::fs::write(&path, "initial_capacity_in_batches = 4\nmax_capacity_in_batches = 8\n")
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;

        let config = TransferCacheConfig::load(Some(&path))?;
        assert_eq!(config.initial_capacity_in_batches, 4);
        assert_eq!(config.max_capacity_in_batches, 8);

        std::fs::remove_file(path).ok();
        Ok(())
    }

    #[test]
    fn test_toml_round_trip_of_defaults() -> Result<()> {
        let rendered = TransferCacheConfig::default().to_toml_string()?;
        let parsed = TransferCacheConfig::from_toml_str(&rendered)?;
        assert_eq!(parsed, TransferCacheConfig::default());
        Ok(())
    }
}
