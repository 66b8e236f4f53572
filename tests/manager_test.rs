//! Capacity manager end to end: real caches over arena free lists, shared
//! by many threads

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use transfer_cache::error::Error;
use transfer_cache::{
    ArenaFreeList, Batch, CacheImplementation, CapacityManager, CentralFreeList,
    LockFreeTransferCache, LockedTransferCache, SizeClassInfo, SizeMap, TransferCache,
    TransferCacheConfig, TransferCacheManager, TransferCacheSystem, VictimPolicyKind,
};

const BATCH: usize = 8;

struct Fixture<C> {
    manager: Arc<CapacityManager<C>>,
    arenas: Vec<Arc<ArenaFreeList>>,
}

fn fixture<C: TransferCache + 'static>(
    classes: usize,
    initial: usize,
    max: usize,
    budget: Option<usize>,
    victim_policy: VictimPolicyKind,
) -> Fixture<C> {
    let size_map = SizeMap::from_classes(
        (0..classes)
            .map(|index| SizeClassInfo {
                index,
                object_size: 32 * (index + 1),
                batch_size: BATCH,
                max_capacity: max,
            })
            .collect(),
    )
    .expect("valid size map");
    let arenas: Vec<Arc<ArenaFreeList>> = size_map
        .iter()
        .map(|info| Arc::new(ArenaFreeList::new(info.index, info.object_size, (info.index + 1) << 32, None)))
        .collect();
    let centrals = arenas
        .iter()
        .map(|a| a.clone() as Arc<dyn CentralFreeList>)
        .collect();
    let config = TransferCacheConfig {
        initial_capacity_in_batches: initial,
        max_capacity_in_batches: max,
        capacity_budget_in_batches: budget,
        victim_policy,
        ..TransferCacheConfig::default()
    };
    let manager = CapacityManager::new(&config, size_map, centrals).expect("manager");
    Fixture { manager, arenas }
}

/// Return everything cached to the arenas and check that each arena got back
/// every object it ever carved, once
fn audit<C: TransferCache + 'static>(fixture: &Fixture<C>) {
    for (size_class, arena) in fixture.arenas.iter().enumerate() {
        let cache = fixture.manager.cache(size_class).expect("cache");
        while let Some(batch) = cache.try_pop() {
            arena.insert_range(batch);
        }

        let free = arena.free_objects();
        let unique: HashSet<_> = free.iter().collect();
        assert_eq!(unique.len(), free.len(), "size class {} has duplicates", size_class);
        assert_eq!(
            free.len(),
            arena.total_objects(),
            "size class {} lost objects",
            size_class
        );
    }
}

fn assert_budget_conserved<C: TransferCache + 'static>(manager: &CapacityManager<C>) {
    let stats = manager.stats();
    assert_eq!(
        stats.total_capacity + stats.unassigned,
        stats.budget,
        "capacity leaked: {:?}",
        stats
    );
    for cache in &stats.caches {
        assert!(cache.occupied <= cache.capacity);
        assert!(cache.capacity <= cache.max_capacity);
    }
}

fn concurrent_reclaim_never_double_grants<C: TransferCache + 'static>() {
    let fx = fixture::<C>(4, 1, 8, None, VictimPolicyKind::RoundRobin);
    let manager = &fx.manager;

    let granted: usize = thread::scope(|scope| {
        let workers: Vec<_> = (0..8)
            .map(|_| {
                scope.spawn(move || {
                    let cache = manager.cache(0).expect("cache");
                    (0..16).filter(|_| cache.make_space()).count()
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().expect("worker")).sum()
    });

    // Only the three donors had anything to give
    assert_eq!(granted, 3);
    assert_eq!(manager.cache(0).expect("cache").capacity(), 4);
    assert_budget_conserved(manager);
}

fn traffic_conserves_objects_and_budget<C: TransferCache + 'static>(policy: VictimPolicyKind) {
    let fx = fixture::<C>(3, 2, 6, Some(12), policy);
    let manager = &fx.manager;

    thread::scope(|scope| {
        for worker in 0..6usize {
            scope.spawn(move || {
                let mut held: Vec<(usize, Batch)> = Vec::new();
                for i in 0..3000usize {
                    let size_class = (worker + i) % 3;
                    match (worker + i / 7) % 4 {
                        0 | 1 => {
                            let n = if i % 5 == 0 { BATCH / 2 } else { BATCH };
                            let batch = manager.remove_range(size_class, n).expect("unlimited arena");
                            held.push((size_class, batch));
                        }
                        2 => {
                            if let Some((sc, batch)) = held.pop() {
                                manager.insert_range(sc, batch).expect("valid class");
                            }
                        }
                        _ => {
                            if i % 2 == 0 {
                                manager.release_capacity(size_class);
                            } else {
                                manager.grow_cache(size_class);
                            }
                        }
                    }
                }
                for (sc, batch) in held {
                    manager.insert_range(sc, batch).expect("valid class");
                }
            });
        }
    });

    assert_budget_conserved(manager);
    audit(&fx);
}

#[test]
fn locked_concurrent_reclaim_never_double_grants() {
    concurrent_reclaim_never_double_grants::<LockedTransferCache>();
}

#[test]
fn lock_free_concurrent_reclaim_never_double_grants() {
    concurrent_reclaim_never_double_grants::<LockFreeTransferCache>();
}

#[test]
fn locked_traffic_conserves_objects_and_budget() {
    traffic_conserves_objects_and_budget::<LockedTransferCache>(VictimPolicyKind::RoundRobin);
}

#[test]
fn lock_free_traffic_conserves_objects_and_budget() {
    traffic_conserves_objects_and_budget::<LockFreeTransferCache>(VictimPolicyKind::MostSpare);
}

#[test]
fn shrink_cache_prefers_unassigned_pool() {
    let fx = fixture::<LockedTransferCache>(2, 1, 4, Some(3), VictimPolicyKind::RoundRobin);
    let manager = &fx.manager;

    let cache = manager.cache(0).expect("cache");
    assert!(cache.make_space());
    assert_eq!(manager.unassigned(), 0);
    assert_eq!(manager.cache(1).expect("cache").capacity(), 1);

    assert!(cache.make_space());
    assert_eq!(manager.cache(1).expect("cache").capacity(), 0);
    assert_eq!(cache.capacity(), 3);

    // Nothing left anywhere
    assert!(!manager.shrink_cache(0));
    assert_budget_conserved(manager);
}

#[test]
fn occupied_donor_is_not_shrunk() {
    let fx = fixture::<LockFreeTransferCache>(2, 1, 4, None, VictimPolicyKind::MostSpare);
    let manager = &fx.manager;

    let batch = manager.remove_range(1, BATCH).expect("carve");
    manager.insert_range(1, batch).expect("valid class");
    assert_eq!(manager.cache(1).expect("cache").occupied(), 1);

    assert!(!manager.cache(0).expect("cache").make_space());
    assert_eq!(manager.cache(1).expect("cache").capacity(), 1);
    assert_eq!(manager.num_objects_to_move(1), BATCH);
}

#[test]
fn system_from_config_runs_both_implementations() {
    for implementation in [CacheImplementation::Locked, CacheImplementation::LockFree] {
        let config = TransferCacheConfig {
            max_object_size: 1024,
            central_object_limit: Some(256),
            implementation,
            ..TransferCacheConfig::default()
        };
        let system = TransferCacheSystem::from_config(&config).expect("system");

        let last = system.num_size_classes() - 1;
        let n = system.num_objects_to_move(last).expect("valid class");
        let mut held = Vec::new();
        let exhausted = loop {
            match system.remove_range(last, n) {
                Ok(batch) => held.push(batch),
                Err(Error::CentralFreeListExhausted { partial, .. }) => break partial,
                Err(e) => panic!("unexpected error: {}", e),
            }
        };
        assert_eq!(held.len() * n + exhausted.len(), 256);

        for batch in held {
            system.insert_range(last, batch).expect("valid class");
        }
        system.insert_range(last, exhausted).expect("valid class");

        let stats = system.stats();
        assert_eq!(stats.total_capacity + stats.unassigned, stats.budget);
        assert!(stats.caches[last].occupied > 0);
        assert!(matches!(
            system.remove_range(last + 1, n),
            Err(Error::InvalidSizeClass(_))
        ));
        assert!(matches!(
            system.num_objects_to_move(last + 1),
            Err(Error::InvalidSizeClass(_))
        ));
    }
}

#[test]
fn oversized_class_capacity_rejected() {
    let classes = vec![SizeClassInfo {
        index: 0,
        object_size: 64,
        batch_size: BATCH,
        max_capacity: 70_000,
    }];
    match SizeMap::from_classes(classes) {
        Err(Error::InvalidConfig(msg)) => assert!(msg.contains("70000"), "{}", msg),
        other => panic!("expected InvalidConfig, got {:?}", other.map(|m| m.len())),
    }
}
