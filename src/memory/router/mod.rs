/*!
 * Allocation Router
 *
 * Entry point for every device-memory request made by buffer and image
 * wrappers.
 *
 * ## Routing
 *
 * - Requests are bucketed into a **region** keyed by
 *   `size_class | (memory_type_index << 32)`
 * - Each region owns an ordered list of chunks; the first chunk with room
 *   serves the request
 * - A region grows by one chunk when every existing chunk is full
 *
 * ## Lifetime
 *
 * Chunks are never handed back to the driver while the router is live,
 * even when they become empty. `cleanup_memory` frees every chunk once, at
 * device teardown.
 */

mod allocator;
mod guard;
mod ranges;
mod region;

pub use guard::AllocationGuard;
pub use ranges::SizeClasses;

use super::config::RouterConfig;
use super::types::{MemoryResult, RegionStats, RouterStats};
use crate::core::types::{DeviceSize, RegionKey, SizeClass};
use crate::device::MemoryDevice;
use ahash::RandomState;
use dashmap::DashMap;
use region::Region;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Process-lifetime sub-allocator over device memory
pub struct AllocationRouter {
    config: RouterConfig,
    classes: SizeClasses,
    device: Arc<dyn MemoryDevice>,
    regions: DashMap<RegionKey, Arc<Region>, RandomState>,
    shut_down: AtomicBool,
    requests: AtomicU64,
    returns: AtomicU64,
    live_allocations: AtomicU64,
    allocated_bytes: AtomicU64,
}

impl AllocationRouter {
    /// Router with the default configuration
    pub fn new(device: Arc<dyn MemoryDevice>) -> MemoryResult<Self> {
        Self::with_config(device, RouterConfig::default())
    }

    pub fn with_config(device: Arc<dyn MemoryDevice>, config: RouterConfig) -> MemoryResult<Self> {
        config.validate()?;
        let classes = SizeClasses::new(&config);

        info!(
            base_segment_size = config.base_segment_size,
            range_shift = config.range_shift,
            max_ranges = config.max_ranges,
            chunk_element_count = config.chunk_element_count,
            default_strategy = %config.default_strategy,
            max_request = classes.max_request(),
            "Allocation router initialized"
        );

        Ok(Self {
            config,
            classes,
            device,
            regions: DashMap::with_hasher(RandomState::new()),
            shut_down: AtomicBool::new(false),
            requests: AtomicU64::new(0),
            returns: AtomicU64::new(0),
            live_allocations: AtomicU64::new(0),
            allocated_bytes: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn size_classes(&self) -> &SizeClasses {
        &self.classes
    }

    /// Size class a request of `size` bytes lands in
    pub fn get_range_index(&self, size: DeviceSize) -> SizeClass {
        self.classes.range_index(size)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Free every chunk in every region.
    ///
    /// Called once at device teardown. Records handed out earlier must not
    /// be returned afterwards; the router rejects them with `ShutDown`.
    pub fn cleanup_memory(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let regions: Vec<Arc<Region>> = self
            .regions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let chunks: usize = regions
            .iter()
            .map(|region| region.teardown(self.device.as_ref()))
            .sum();
        self.regions.clear();

        let outstanding = self.live_allocations.load(Ordering::Acquire);
        if outstanding > 0 {
            warn!(outstanding, "Router torn down with live allocations");
        }
        info!(regions = regions.len(), chunks, "Router cleaned up");
    }

    /// Router-wide statistics
    pub fn stats(&self) -> RouterStats {
        let mut stats = RouterStats {
            allocated_bytes: self.allocated_bytes.load(Ordering::Relaxed),
            live_allocations: self.live_allocations.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            returns: self.returns.load(Ordering::Relaxed),
            ..RouterStats::default()
        };
        for region in self.region_stats() {
            stats.regions += 1;
            stats.chunks += region.chunks;
            stats.reserved_bytes += region.capacity;
        }
        stats
    }

    /// Statistics for each region, ordered by region key
    pub fn region_stats(&self) -> Vec<RegionStats> {
        let regions: Vec<Arc<Region>> = self
            .regions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut stats: Vec<RegionStats> = regions.iter().map(|r| r.stats()).collect();
        stats.sort_by_key(|s| s.region_key);
        stats
    }
}

impl Drop for AllocationRouter {
    fn drop(&mut self) {
        if !self.is_shut_down() {
            warn!("Allocation router dropped without cleanup_memory, freeing chunks");
            self.cleanup_memory();
        }
    }
}
