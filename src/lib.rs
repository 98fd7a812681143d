/*!
 * Render Memory Library
 * GPU device-memory sub-allocation for the renderer
 */

pub mod core;
pub mod device;
pub mod memory;
pub mod monitoring;

// Re-exports
pub use device::{DeviceError, DeviceMemory, MemoryDevice, MemoryPropertyFlags, SimulatedDevice};
pub use memory::{
    AllocationGuard, AllocationHandle, AllocationRecord, AllocationRouter, BuddyChunk,
    ChunkStrategy, MemoryError, MemoryResult, RouterConfig, SegmentChunk, SubAllocator,
};
pub use monitoring::init_tracing;
