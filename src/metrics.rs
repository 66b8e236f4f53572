//! Prometheus metrics exporter for the transfer caches
//!
//! Gauges are refreshed from a [`ManagerStats`] snapshot on demand, so the
//! insert/remove paths never touch the registry.

use crate::error::{Error, Result};
use crate::manager::ManagerStats;
use prometheus::{Encoder, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use tracing::info;

lazy_static::lazy_static! {
    /// Metrics registry for this crate
    pub static ref METRICS_REGISTRY: Registry = Registry::new();

    // Capacity metrics
    pub static ref CAPACITY_BUDGET: IntGauge = IntGauge::new(
        "tcache_capacity_budget_batches",
        "Fleet-wide transfer cache capacity budget in batches"
    ).expect("valid metric definition");

    pub static ref CAPACITY_UNASSIGNED: IntGauge = IntGauge::new(
        "tcache_capacity_unassigned_batches",
        "Capacity owned by no cache in batches"
    ).expect("valid metric definition");

    pub static ref CACHE_CAPACITY: IntGaugeVec = IntGaugeVec::new(
        Opts::new("tcache_cache_capacity_batches", "Cache capacity in batches"),
        &["size_class"]
    ).expect("valid metric definition");

    pub static ref CACHE_OCCUPIED: IntGaugeVec = IntGaugeVec::new(
        Opts::new("tcache_cache_occupied_batches", "Batches held by the cache"),
        &["size_class"]
    ).expect("valid metric definition");

    // Traffic metrics (cumulative, copied from the cache counters)
    pub static ref CACHE_EVENTS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("tcache_cache_events_total", "Transfer cache events by kind"),
        &["size_class", "event"]
    ).expect("valid metric definition");
}

/// Register all metrics with the registry
pub fn init_metrics() -> Result<()> {
    info!("Initializing Prometheus metrics");

    for collector in [
        Box::new(CAPACITY_BUDGET.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(CAPACITY_UNASSIGNED.clone()),
        Box::new(CACHE_CAPACITY.clone()),
        Box::new(CACHE_OCCUPIED.clone()),
        Box::new(CACHE_EVENTS.clone()),
    ] {
        match METRICS_REGISTRY.register(collector) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(Error::Metrics(e)),
        }
    }
    Ok(())
}

/// Copy a manager snapshot into the gauges
pub fn record_stats(stats: &ManagerStats) {
    CAPACITY_BUDGET.set(stats.budget as i64);
    CAPACITY_UNASSIGNED.set(stats.unassigned as i64);

    for cache in &stats.caches {
        let class = cache.size_class.to_string();
        CACHE_CAPACITY
            .with_label_values(&[class.as_str()])
            .set(cache.capacity as i64);
        CACHE_OCCUPIED
            .with_label_values(&[class.as_str()])
            .set(cache.occupied as i64);

        for (event, value) in [
            ("insert_hit", cache.insert_hits),
            ("insert_miss", cache.insert_misses),
            ("remove_hit", cache.remove_hits),
            ("remove_miss", cache.remove_misses),
            ("spill", cache.spills),
            ("capacity_grant", cache.capacity_grants),
            ("capacity_denial", cache.capacity_denials),
            ("bypass", cache.bypassed),
        ] {
            CACHE_EVENTS
                .with_label_values(&[class.as_str(), event])
                .set(value as i64);
        }
    }
}

/// Export all metrics in Prometheus text format
pub fn export_metrics() -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = METRICS_REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;

    String::from_utf8(buffer)
        .map_err(|e| Error::Metrics(prometheus::Error::Msg(format!("UTF-8 conversion error: {}", e))))
}
