/*!
 * Allocation Router Tests
 * Routing, growth, error paths and teardown
 */

use pretty_assertions::assert_eq;
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use render_memory::core::types::region_key;
use render_memory::device::{MemoryPropertyFlags, SimulatedDevice};
use render_memory::memory::{
    AllocationRecord, AllocationRouter, ChunkStrategy, MemoryError, RouterConfig, SizeClasses,
};
use std::sync::Arc;

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;
const ANY_TYPE: u32 = !0;

fn device() -> Arc<SimulatedDevice> {
    Arc::new(SimulatedDevice::discrete(16 << 30, 1 << 30))
}

fn router_with(device: &Arc<SimulatedDevice>, config: RouterConfig) -> AllocationRouter {
    AllocationRouter::with_config(device.clone(), config).expect("valid config")
}

fn request(router: &AllocationRouter, size: u64) -> AllocationRecord {
    router
        .request_memory(size, ANY_TYPE, MemoryPropertyFlags::DEVICE_LOCAL)
        .expect("request should succeed")
}

#[test]
fn test_requests_share_first_chunk() {
    let device = device();
    let router = router_with(&device, RouterConfig::default());

    let a = request(&router, 100 * KB);
    let b = request(&router, 100 * KB);

    assert_eq!(router.get_range_index(100 * KB), 0);
    assert_eq!(a.region_key, region_key(0, 0));
    assert_eq!((a.chunk_index, b.chunk_index), (0, 0));
    assert_eq!(a.offset(), 0);
    assert_eq!(b.offset(), 128 * KB);
    assert_eq!(a.size(), 128 * KB);
    assert_eq!(a.memory(), b.memory());
    assert_eq!(device.live_allocations(), 1);
    assert_eq!(device.block_size(a.memory()), Some(MB));
}

#[test]
fn test_size_classes_use_separate_regions() {
    let device = device();
    let router = router_with(&device, RouterConfig::default());

    let small = request(&router, 100 * KB);
    let large = request(&router, 300 * KB);

    assert_eq!(router.get_range_index(300 * KB), 1);
    assert_eq!(large.size_class(), 1);
    assert_eq!(large.memory_type_index(), 0);
    assert_ne!(small.region_key, large.region_key);
    assert_ne!(small.memory(), large.memory());
    assert_eq!(large.chunk_index, 0);
    // Class 1 leaves are 512KB
    assert_eq!(large.size(), 512 * KB);
    assert_eq!(device.live_allocations(), 2);
}

#[test]
fn test_memory_types_use_separate_regions() {
    let device = device();
    let router = router_with(&device, RouterConfig::default());

    let local = request(&router, 100 * KB);
    let host = router
        .request_memory(100 * KB, ANY_TYPE, MemoryPropertyFlags::HOST_VISIBLE)
        .unwrap();

    assert_eq!(local.memory_type_index(), 0);
    assert_eq!(host.memory_type_index(), 1);
    assert_eq!(local.size_class(), host.size_class());
    assert_ne!(local.region_key, host.region_key);
    assert_eq!(host.offset(), 0);
}

#[test]
fn test_region_grows_when_full() {
    let device = device();
    let router = router_with(&device, RouterConfig::default().with_chunk_element_count(4));

    // 256KB chunks hold two 128KB blocks
    let a = request(&router, 100 * KB);
    let b = request(&router, 100 * KB);
    let c = request(&router, 100 * KB);

    assert_eq!((a.chunk_index, b.chunk_index, c.chunk_index), (0, 0, 1));
    assert_eq!(c.offset(), 0);
    assert_ne!(a.memory(), c.memory());
    assert_eq!(device.live_allocations(), 2);

    // Freed space in chunk 0 is reused before any further growth
    router.return_memory(a).unwrap();
    let d = request(&router, 100 * KB);
    assert_eq!((d.chunk_index, d.offset()), (0, 0));
    assert_eq!(device.live_allocations(), 2);
}

#[test]
fn test_empty_chunks_are_kept() {
    let device = device();
    let router = router_with(&device, RouterConfig::default());

    let record = request(&router, 4 * KB);
    router.return_memory(record).unwrap();

    assert_eq!(device.live_allocations(), 1);
    let stats = router.stats();
    assert_eq!(stats.chunks, 1);
    assert_eq!(stats.live_allocations, 0);
    assert_eq!(stats.allocated_bytes, 0);
}

#[test]
fn test_zero_sized_request_rejected() {
    let device = device();
    let router = router_with(&device, RouterConfig::default());
    assert!(matches!(
        router.request_memory(0, ANY_TYPE, MemoryPropertyFlags::DEVICE_LOCAL),
        Err(MemoryError::ZeroSizedRequest)
    ));
    assert_eq!(device.live_allocations(), 0);
}

#[test]
fn test_oversized_request_rejected() {
    let device = device();
    let router = router_with(&device, RouterConfig::default());
    let max = router.size_classes().max_request();
    assert_eq!(max, 128 * MB);

    let err = router
        .request_memory(max, ANY_TYPE, MemoryPropertyFlags::DEVICE_LOCAL)
        .unwrap_err();
    assert!(matches!(err, MemoryError::RequestTooLarge { requested, .. } if requested == max));
    assert_eq!(device.live_allocations(), 0);

    // One byte below the limit lands in the last class
    let record = request(&router, max - 1);
    assert_eq!(record.size_class(), 3);
}

#[test]
fn test_no_suitable_memory_type() {
    let device = device();
    let router = router_with(&device, RouterConfig::default());

    // Only type 1 (host visible) is allowed
    let err = router
        .request_memory(4 * KB, 0b0010, MemoryPropertyFlags::DEVICE_LOCAL)
        .unwrap_err();
    assert!(matches!(err, MemoryError::NoSuitableMemoryType { type_mask: 0b0010, .. }));
}

#[test]
fn test_device_out_of_memory() {
    let device = Arc::new(SimulatedDevice::discrete(512 * KB, 1 << 30));
    let router = router_with(&device, RouterConfig::default());

    let err = router
        .request_memory(100 * KB, ANY_TYPE, MemoryPropertyFlags::DEVICE_LOCAL)
        .unwrap_err();
    assert!(matches!(
        err,
        MemoryError::DeviceAllocationFailed {
            size,
            memory_type_index: 0,
            ..
        } if size == MB
    ));
    assert_eq!(device.live_allocations(), 0);
    assert_eq!(router.stats().chunks, 0);
}

#[test]
fn test_unknown_chunk_rejected() {
    let device = device();
    let router = router_with(&device, RouterConfig::default());
    let record = request(&router, 4 * KB);

    let mut stale = record;
    stale.chunk_index = 7;
    assert!(matches!(
        router.return_memory(stale),
        Err(MemoryError::UnknownChunk { chunk_index: 7, .. })
    ));

    let mut foreign = record;
    foreign.region_key = region_key(2, 3);
    assert!(matches!(
        router.return_memory(foreign),
        Err(MemoryError::UnknownChunk { .. })
    ));

    router.return_memory(record).unwrap();
}

#[test]
fn test_tampered_record_leaves_counters_alone() {
    let device = device();
    let router = router_with(&device, RouterConfig::default());
    let record = request(&router, 100 * KB);

    let mut inflated = record;
    inflated.handle.size = 4 * MB;
    assert!(matches!(
        router.return_memory(inflated),
        Err(MemoryError::ForeignHandle { .. })
    ));
    assert_eq!(router.stats().allocated_bytes, 128 * KB);
    assert_eq!(router.stats().live_allocations, 1);

    router.return_memory(record).unwrap();
    assert_eq!(router.stats().allocated_bytes, 0);
}

#[test]
fn test_segment_geometry_past_u32_rejected_up_front() {
    let device = Arc::new(SimulatedDevice::discrete(1 << 40, 1 << 30));
    let config = RouterConfig::default()
        .with_base_segment_size(1)
        .with_max_ranges(11)
        .with_default_strategy(ChunkStrategy::Segment);

    assert!(matches!(
        AllocationRouter::with_config(device.clone(), config),
        Err(MemoryError::InvalidConfig(_))
    ));
    assert_eq!(device.live_allocations(), 0);
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "double free")]
fn test_double_return_asserts() {
    let device = device();
    let router = router_with(&device, RouterConfig::default());
    let record = request(&router, 4 * KB);
    router.return_memory(record).unwrap();
    let _ = router.return_memory(record);
}

#[test]
fn test_cleanup_frees_every_chunk() {
    let device = device();
    let router = router_with(&device, RouterConfig::default().with_chunk_element_count(4));

    let records: Vec<_> = (0..6).map(|i| request(&router, (i + 1) * 90 * KB)).collect();
    assert!(device.live_allocations() > 1);
    assert!(device.heap_usage(0) > 0);

    router.cleanup_memory();
    assert!(router.is_shut_down());
    assert_eq!(device.live_allocations(), 0);
    assert_eq!(device.heap_usage(0), 0);
    assert_eq!(router.stats().regions, 0);

    assert!(matches!(
        router.return_memory(records[0]),
        Err(MemoryError::ShutDown)
    ));
    assert!(matches!(
        router.request_memory(4 * KB, ANY_TYPE, MemoryPropertyFlags::DEVICE_LOCAL),
        Err(MemoryError::ShutDown)
    ));

    // Second cleanup is a no-op
    router.cleanup_memory();
    assert_eq!(device.live_allocations(), 0);
}

#[test]
fn test_drop_cleans_up() {
    let device = device();
    {
        let router = router_with(&device, RouterConfig::default());
        let _record = request(&router, 4 * KB);
        assert_eq!(device.live_allocations(), 1);
    }
    assert_eq!(device.live_allocations(), 0);
}

#[test]
fn test_segment_strategy_packs_by_base_segment() {
    let device = device();
    let config = RouterConfig::default().with_strategy_for(0, ChunkStrategy::Segment);
    let router = router_with(&device, config);

    let a = request(&router, 100 * KB);
    let b = request(&router, 10 * KB);
    let c = request(&router, 200 * KB);

    assert_eq!((a.offset(), a.size()), (0, 128 * KB));
    assert_eq!((b.offset(), b.size()), (128 * KB, 64 * KB));
    assert_eq!((c.offset(), c.size()), (192 * KB, 256 * KB));

    let regions = router.region_stats();
    assert_eq!(regions.len(), 1);
    assert_eq!(regions[0].strategy, ChunkStrategy::Segment);
    assert_eq!(regions[0].capacity, MB);
    assert_eq!(regions[0].free_bytes, MB - 448 * KB);

    router.return_memory(b).unwrap();
    let d = request(&router, 64 * KB);
    assert_eq!(d.offset(), 128 * KB);
}

#[test]
fn test_stats_track_requests() {
    let device = device();
    let router = router_with(&device, RouterConfig::default());

    let a = request(&router, 100 * KB);
    let _b = request(&router, 100 * KB);
    let _c = request(&router, 300 * KB);
    router.return_memory(a).unwrap();

    let stats = router.stats();
    assert_eq!(stats.regions, 2);
    assert_eq!(stats.chunks, 2);
    // 1MB for class 0, 16 * 512KB for class 1
    assert_eq!(stats.reserved_bytes, MB + 8 * MB);
    assert_eq!(stats.allocated_bytes, 128 * KB + 512 * KB);
    assert_eq!(stats.live_allocations, 2);
    assert_eq!(stats.requests, 3);
    assert_eq!(stats.returns, 1);

    let json = serde_json::to_value(&stats).unwrap();
    assert_eq!(json["live_allocations"], 2);
    assert_eq!(json["regions"], 2);

    let regions = router.region_stats();
    assert_eq!(regions[0].size_class, 0);
    assert_eq!(regions[0].free_bytes, MB - 128 * KB);
    assert_eq!(regions[1].size_class, 1);
}

#[test]
fn test_guarded_request_returns_on_drop() {
    let device = device();
    let router = Arc::new(router_with(&device, RouterConfig::default()));

    let kept = {
        let guard = router
            .request_guarded(4 * KB, ANY_TYPE, MemoryPropertyFlags::DEVICE_LOCAL)
            .unwrap();
        let kept = router
            .request_guarded(4 * KB, ANY_TYPE, MemoryPropertyFlags::DEVICE_LOCAL)
            .unwrap()
            .into_record();
        assert_eq!(guard.offset(), 0);
        kept
    };

    let stats = router.stats();
    assert_eq!(stats.live_allocations, 1);
    assert_eq!(stats.returns, 1);
    router.return_memory(kept).unwrap();
}

#[test]
fn test_random_churn_never_overlaps() {
    let device = device();
    let config = RouterConfig::default()
        .with_chunk_element_count(8)
        .with_strategy_for(1, ChunkStrategy::Segment);
    let router = router_with(&device, config);
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut live: Vec<AllocationRecord> = Vec::new();

    for _ in 0..2_000 {
        if live.is_empty() || rng.gen_bool(0.6) {
            let size = rng.gen_range(1..=3 * MB);
            let record = request(&router, size);
            assert!(record.size() >= size);
            for other in &live {
                assert!(
                    !record.handle.overlaps(&other.handle),
                    "{:?} overlaps {:?}",
                    record,
                    other
                );
            }
            live.push(record);
        } else {
            let index = rng.gen_range(0..live.len());
            router.return_memory(live.swap_remove(index)).unwrap();
        }
    }

    let chunks_before = router.stats().chunks;
    for record in live.drain(..) {
        router.return_memory(record).unwrap();
    }

    let stats = router.stats();
    assert_eq!(stats.live_allocations, 0);
    assert_eq!(stats.allocated_bytes, 0);
    assert_eq!(stats.chunks, chunks_before);
    for region in router.region_stats() {
        assert_eq!(region.free_bytes, region.capacity);
    }
}

proptest! {
    #[test]
    fn prop_range_index_is_monotone(a in 1u64..(128 * MB), b in 1u64..(128 * MB)) {
        let classes = SizeClasses::new(&RouterConfig::default());
        let (small, large) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(classes.range_index(small) <= classes.range_index(large));
    }

    #[test]
    fn prop_range_index_picks_smallest_fitting_class(size in 1u64..(128 * MB)) {
        let classes = SizeClasses::new(&RouterConfig::default());
        let class = classes.range_index(size);
        prop_assert!(size < classes.range_max(class));
        if class > 0 {
            prop_assert!(size >= classes.range_max(class - 1));
        }
    }
}
