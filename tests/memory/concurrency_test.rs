/*!
 * Router Concurrency Tests
 * Parallel request/return churn against one router
 */

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use render_memory::device::{MemoryPropertyFlags, SimulatedDevice};
use render_memory::memory::{AllocationRecord, AllocationRouter, ChunkStrategy, RouterConfig};
use std::sync::{Arc, Barrier};
use std::thread;

const KB: u64 = 1024;
const THREADS: usize = 8;
const OPS_PER_THREAD: usize = 500;

fn shared_router(config: RouterConfig) -> (Arc<SimulatedDevice>, Arc<AllocationRouter>) {
    let device = Arc::new(SimulatedDevice::discrete(16 << 30, 4 << 30));
    let router = Arc::new(AllocationRouter::with_config(device.clone(), config).unwrap());
    (device, router)
}

fn assert_disjoint(records: &[AllocationRecord]) {
    for (i, a) in records.iter().enumerate() {
        for b in &records[i + 1..] {
            assert!(!a.handle.overlaps(&b.handle), "{:?} overlaps {:?}", a, b);
        }
    }
}

#[test]
fn test_parallel_churn_keeps_allocations_disjoint() {
    let config = RouterConfig::default().with_strategy_for(1, ChunkStrategy::Segment);
    let (_device, router) = shared_router(config);
    let survivors = Arc::new(Mutex::new(Vec::new()));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let router = Arc::clone(&router);
            let survivors = Arc::clone(&survivors);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(t as u64);
                let mut live: Vec<AllocationRecord> = Vec::new();
                barrier.wait();

                for _ in 0..OPS_PER_THREAD {
                    if live.is_empty() || rng.gen_bool(0.55) {
                        let size = rng.gen_range(1..=1024 * KB);
                        let flags = if rng.gen_bool(0.8) {
                            MemoryPropertyFlags::DEVICE_LOCAL
                        } else {
                            MemoryPropertyFlags::HOST_VISIBLE
                        };
                        live.push(router.request_memory(size, !0, flags).unwrap());
                    } else {
                        let index = rng.gen_range(0..live.len());
                        router.return_memory(live.swap_remove(index)).unwrap();
                    }
                }
                survivors.lock().extend(live);
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let survivors = std::mem::take(&mut *survivors.lock());
    assert_disjoint(&survivors);

    let stats = router.stats();
    assert_eq!(stats.live_allocations, survivors.len() as u64);
    assert_eq!(
        stats.allocated_bytes,
        survivors.iter().map(|r| r.size()).sum::<u64>()
    );

    for record in survivors {
        router.return_memory(record).unwrap();
    }
    for region in router.region_stats() {
        assert_eq!(region.free_bytes, region.capacity);
    }
}

#[test]
fn test_racing_first_requests_create_one_chunk() {
    let (device, router) = shared_router(RouterConfig::default());
    let barrier = Arc::new(Barrier::new(THREADS));

    // Eight 64KB requests fit one 1MB class 0 chunk
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let router = Arc::clone(&router);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                router
                    .request_memory(64 * KB, !0, MemoryPropertyFlags::DEVICE_LOCAL)
                    .unwrap()
            })
        })
        .collect();

    let records: Vec<AllocationRecord> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_disjoint(&records);
    assert!(records.iter().all(|r| r.chunk_index == 0));
    assert_eq!(device.live_allocations(), 1);
    assert_eq!(router.stats().regions, 1);
}

#[test]
fn test_cleanup_after_parallel_use() {
    let (device, router) = shared_router(RouterConfig::default().with_chunk_element_count(4));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let router = Arc::clone(&router);
            thread::spawn(move || {
                (0..20)
                    .map(|i| {
                        router
                            .request_memory(
                                ((t * 20 + i) as u64 + 1) * 16 * KB,
                                !0,
                                MemoryPropertyFlags::DEVICE_LOCAL,
                            )
                            .unwrap()
                    })
                    .count()
            })
        })
        .collect();

    let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(total, THREADS * 20);
    assert!(device.live_allocations() > 0);

    router.cleanup_memory();
    assert_eq!(device.live_allocations(), 0);
    assert_eq!(device.heap_usage(0), 0);
}
