/*!
 * Region
 *
 * Pooling unit for one (size class, memory type) pair: an ordered list of
 * chunks sharing segment size and memory type. The list lives behind one
 * mutex held across the whole scan-then-grow path so two callers never
 * both decide to grow the region.
 */

use crate::core::types::{DeviceSize, MemoryTypeIndex, RegionKey, SizeClass};
use crate::device::MemoryDevice;
use crate::memory::chunk::{BuddyChunk, SegmentChunk};
use crate::memory::traits::SubAllocator;
use crate::memory::types::{AllocationHandle, ChunkStrategy, MemoryError, MemoryResult, RegionStats};
use parking_lot::Mutex;
use tracing::{debug, info};

/// Chunk geometry shared by every chunk of a region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RegionLayout {
    pub strategy: ChunkStrategy,
    /// Buddy leaf size or free-list unit
    pub segment_size: DeviceSize,
    pub chunk_size: DeviceSize,
    /// Only meaningful for buddy chunks
    pub tree_depth: u32,
}

pub(crate) struct Region {
    key: RegionKey,
    size_class: SizeClass,
    memory_type_index: MemoryTypeIndex,
    layout: RegionLayout,
    chunks: Mutex<Vec<Box<dyn SubAllocator>>>,
}

impl Region {
    pub fn new(
        key: RegionKey,
        size_class: SizeClass,
        memory_type_index: MemoryTypeIndex,
        layout: RegionLayout,
    ) -> Self {
        info!(
            region_key = key,
            size_class,
            memory_type_index,
            strategy = %layout.strategy,
            segment_size = layout.segment_size,
            chunk_size = layout.chunk_size,
            "Region created"
        );
        Self {
            key,
            size_class,
            memory_type_index,
            layout,
            chunks: Mutex::new(Vec::new()),
        }
    }

    fn create_chunk(&self, device: &dyn MemoryDevice) -> MemoryResult<Box<dyn SubAllocator>> {
        Ok(match self.layout.strategy {
            ChunkStrategy::Buddy => Box::new(BuddyChunk::new(
                device,
                self.memory_type_index,
                self.layout.segment_size,
                self.layout.tree_depth,
            )?),
            ChunkStrategy::Segment => Box::new(SegmentChunk::new(
                device,
                self.memory_type_index,
                self.layout.segment_size,
                self.layout.chunk_size,
            )?),
        })
    }

    /// First fit across existing chunks, growing the region on a miss
    pub fn allocate(
        &self,
        device: &dyn MemoryDevice,
        size: DeviceSize,
    ) -> MemoryResult<(u32, AllocationHandle)> {
        let mut chunks = self.chunks.lock();

        for (index, chunk) in chunks.iter_mut().enumerate() {
            if !chunk.has_free_space() {
                continue;
            }
            if let Some(handle) = chunk.allocate(size) {
                return Ok((index as u32, handle));
            }
        }

        let mut chunk = self.create_chunk(device)?;
        let handle = match chunk.allocate(size) {
            Some(handle) => handle,
            None => {
                let capacity = chunk.capacity();
                chunk.destroy(device);
                return Err(MemoryError::RequestTooLarge {
                    requested: size,
                    max: capacity,
                });
            }
        };

        let index = chunks.len() as u32;
        chunks.push(chunk);

        info!(
            region_key = self.key,
            chunk_index = index,
            chunks = chunks.len(),
            "Region grown"
        );
        Ok((index, handle))
    }

    pub fn release(&self, chunk_index: u32, handle: &AllocationHandle) -> MemoryResult<()> {
        let mut chunks = self.chunks.lock();
        let chunk = chunks
            .get_mut(chunk_index as usize)
            .ok_or(MemoryError::UnknownChunk {
                region_key: self.key,
                chunk_index,
            })?;
        chunk.release(handle)
    }

    /// Free every chunk's device block; returns how many chunks were torn down
    pub fn teardown(&self, device: &dyn MemoryDevice) -> usize {
        let mut chunks = self.chunks.lock();
        for chunk in chunks.iter_mut() {
            chunk.destroy(device);
        }
        let count = chunks.len();
        chunks.clear();
        debug!(region_key = self.key, chunks = count, "Region torn down");
        count
    }

    pub fn stats(&self) -> RegionStats {
        let chunks = self.chunks.lock();
        RegionStats {
            region_key: self.key,
            size_class: self.size_class,
            memory_type_index: self.memory_type_index,
            strategy: self.layout.strategy,
            chunks: chunks.len(),
            capacity: chunks.iter().map(|c| c.capacity()).sum(),
            free_bytes: chunks.iter().map(|c| c.free_bytes()).sum(),
        }
    }
}
