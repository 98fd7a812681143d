/*!
 * Core Types
 * Common types used across the memory subsystem
 */

/// Size or offset in bytes on the device
pub type DeviceSize = u64;

/// Index into the device's memory type table
pub type MemoryTypeIndex = u32;

/// Bit mask of acceptable memory types (bit `i` set = type `i` allowed)
pub type MemoryTypeMask = u32;

/// Region key: `size_class | (memory_type_index << 32)`
pub type RegionKey = u64;

/// Size class index produced by range bucketing
pub type SizeClass = u32;

/// Build a region key from its two components
#[inline]
pub const fn region_key(size_class: SizeClass, memory_type_index: MemoryTypeIndex) -> RegionKey {
    (size_class as u64) | ((memory_type_index as u64) << 32)
}

/// Split a region key back into `(size_class, memory_type_index)`
#[inline]
pub const fn split_region_key(key: RegionKey) -> (SizeClass, MemoryTypeIndex) {
    ((key & 0xFFFF_FFFF) as u32, (key >> 32) as u32)
}
