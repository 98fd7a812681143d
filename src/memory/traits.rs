/*!
 * Memory Traits
 * Chunk allocator abstraction shared by every sub-allocation strategy
 */

use super::types::{AllocationHandle, ChunkStrategy, MemoryResult};
use crate::core::types::{DeviceSize, MemoryTypeIndex};
use crate::device::{DeviceMemory, MemoryDevice};

/// One device-memory block carved up by a sub-allocation strategy.
///
/// Implementations are not internally synchronized; the router serializes
/// access with the owning region's lock.
pub trait SubAllocator: Send + Sync {
    /// Carve `size` bytes out of the chunk.
    ///
    /// `None` means the chunk cannot satisfy the request right now; the
    /// caller moves on to the next chunk or grows the region.
    fn allocate(&mut self, size: DeviceSize) -> Option<AllocationHandle>;

    /// Return a handle produced by this chunk's `allocate`
    fn release(&mut self, handle: &AllocationHandle) -> MemoryResult<()>;

    /// Cheap check that at least one segment is free
    fn has_free_space(&self) -> bool;

    /// Usable bytes in the chunk
    fn capacity(&self) -> DeviceSize;

    /// Bytes that are currently free
    fn free_bytes(&self) -> DeviceSize;

    /// Bytes currently handed out
    fn allocated_bytes(&self) -> DeviceSize {
        self.capacity() - self.free_bytes()
    }

    /// The device block backing this chunk
    fn memory(&self) -> DeviceMemory;

    fn memory_type_index(&self) -> MemoryTypeIndex;

    fn strategy(&self) -> ChunkStrategy;

    /// Give the device block back to the driver.
    ///
    /// Outstanding handles into this chunk become dangling.
    fn destroy(&mut self, device: &dyn MemoryDevice);
}
