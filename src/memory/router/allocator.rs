/*!
 * Router Allocation Paths
 * Request and return routing between callers and chunks
 */

use super::region::{Region, RegionLayout};
use super::AllocationRouter;
use crate::core::types::{region_key, DeviceSize, MemoryTypeIndex, MemoryTypeMask, SizeClass};
use crate::device::MemoryPropertyFlags;
use crate::memory::types::{AllocationRecord, ChunkStrategy, MemoryError, MemoryResult};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

impl AllocationRouter {
    /// Hand out `size_bytes` of device memory compatible with `type_mask`
    /// and `flags`.
    ///
    /// Never blocks on anything but the target region's lock. Grows the
    /// region by one chunk when no existing chunk can serve the request.
    #[instrument(level = "trace", skip(self))]
    pub fn request_memory(
        &self,
        size_bytes: DeviceSize,
        type_mask: MemoryTypeMask,
        flags: MemoryPropertyFlags,
    ) -> MemoryResult<AllocationRecord> {
        if self.is_shut_down() {
            warn!(size_bytes, "Memory requested after cleanup");
            return Err(MemoryError::ShutDown);
        }
        if size_bytes == 0 {
            warn!("Rejected zero-sized memory request");
            return Err(MemoryError::ZeroSizedRequest);
        }

        let memory_type_index = self
            .device
            .find_memory_type_index(type_mask, flags)
            .map_err(|err| MemoryError::device(size_bytes, 0, err))?;

        let max = self.classes.max_request();
        if size_bytes >= max {
            warn!(size_bytes, max, "Request exceeds the largest size class");
            return Err(MemoryError::RequestTooLarge {
                requested: size_bytes,
                max,
            });
        }

        let size_class = self.classes.range_index(size_bytes);
        let region = self.region(size_class, memory_type_index);
        let (chunk_index, handle) = region.allocate(self.device.as_ref(), size_bytes)?;

        self.requests.fetch_add(1, Ordering::Relaxed);
        self.live_allocations.fetch_add(1, Ordering::Relaxed);
        self.allocated_bytes.fetch_add(handle.size, Ordering::Relaxed);

        let record = AllocationRecord {
            region_key: region_key(size_class, memory_type_index),
            chunk_index,
            handle,
        };

        debug!(
            size_bytes,
            size_class,
            memory_type_index,
            chunk_index,
            offset = handle.offset,
            granted = handle.size,
            "Memory requested"
        );
        Ok(record)
    }

    /// Give a record back to the chunk that produced it.
    ///
    /// Returning the same record twice is a double free: chunks assert on it
    /// in debug builds and reject it otherwise.
    #[instrument(level = "trace", skip(self, record), fields(region_key = record.region_key, chunk_index = record.chunk_index))]
    pub fn return_memory(&self, record: AllocationRecord) -> MemoryResult<()> {
        if self.is_shut_down() {
            warn!(
                region_key = record.region_key,
                chunk_index = record.chunk_index,
                "Memory returned after cleanup"
            );
            return Err(MemoryError::ShutDown);
        }

        let region = self
            .regions
            .get(&record.region_key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(MemoryError::UnknownChunk {
                region_key: record.region_key,
                chunk_index: record.chunk_index,
            })?;

        region.release(record.chunk_index, &record.handle)?;

        self.returns.fetch_add(1, Ordering::Relaxed);
        self.live_allocations.fetch_sub(1, Ordering::Relaxed);
        self.allocated_bytes
            .fetch_sub(record.handle.size, Ordering::Relaxed);

        debug!(
            region_key = record.region_key,
            chunk_index = record.chunk_index,
            offset = record.handle.offset,
            size = record.handle.size,
            "Memory returned"
        );
        Ok(())
    }

    /// Fetch or lazily create the region for a class/type pair
    fn region(&self, size_class: SizeClass, memory_type_index: MemoryTypeIndex) -> Arc<Region> {
        let key = region_key(size_class, memory_type_index);
        if let Some(region) = self.regions.get(&key) {
            return Arc::clone(region.value());
        }

        let layout = self.layout_for(size_class);
        let entry = self
            .regions
            .entry(key)
            .or_insert_with(|| Arc::new(Region::new(key, size_class, memory_type_index, layout)));
        Arc::clone(entry.value())
    }

    fn layout_for(&self, size_class: SizeClass) -> RegionLayout {
        let strategy = self.config.strategy_for(size_class);
        let segment_size = match strategy {
            ChunkStrategy::Buddy => self.classes.range_base(size_class),
            ChunkStrategy::Segment => self.config.base_segment_size,
        };
        RegionLayout {
            strategy,
            segment_size,
            chunk_size: self.classes.chunk_size(size_class),
            tree_depth: self.config.buddy_tree_depth(),
        }
    }
}
