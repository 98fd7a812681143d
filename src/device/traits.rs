/*!
 * Device Traits
 * Abstract driver interface the allocator sub-allocates from
 */

use super::types::{DeviceError, DeviceMemory, DeviceResult, MemoryPropertyFlags, MemoryType};
use crate::core::types::{DeviceSize, MemoryTypeIndex, MemoryTypeMask};

/// Device that hands out large memory blocks to sub-allocate.
///
/// Allocation calls may be expensive and the driver may cap how many memory
/// objects exist at once, which is why the router batches many resources
/// into one block.
pub trait MemoryDevice: Send + Sync {
    /// Pick the memory type for a resource's `type_mask` and required flags
    fn find_memory_type_index(
        &self,
        type_mask: MemoryTypeMask,
        flags: MemoryPropertyFlags,
    ) -> DeviceResult<MemoryTypeIndex>;

    /// Allocate a new device-memory block
    fn allocate_device_memory(
        &self,
        size: DeviceSize,
        memory_type_index: MemoryTypeIndex,
    ) -> DeviceResult<DeviceMemory>;

    /// Free a block previously returned by `allocate_device_memory`
    fn free_device_memory(&self, memory: DeviceMemory);
}

/// Standard memory type selection: the first type allowed by `type_mask`
/// whose property flags contain every requested flag.
pub fn find_memory_type_index(
    types: &[MemoryType],
    type_mask: MemoryTypeMask,
    flags: MemoryPropertyFlags,
) -> DeviceResult<MemoryTypeIndex> {
    types
        .iter()
        .enumerate()
        .take(32)
        .find(|&(i, ty)| type_mask & (1 << i) != 0 && ty.property_flags.contains(flags))
        .map(|(i, _)| i as MemoryTypeIndex)
        .ok_or(DeviceError::NoSuitableMemoryType { type_mask, flags })
}
